//! Model point demo.
//!
//! Builds a small HVAC-flavoured database, drives it from a writer task and
//! a counter thread, and watches it from two mailboxes: a dedicated thread
//! that logs changes and an async task that runs a thermostat.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dm_core::{
    Bool, DatabaseConfig, JsonOptions, LockRequest, ModelDatabase, ModelPoint, Numeric,
    SequenceNumber, Subscriber,
};
use dm_mailbox::{Component, Mailbox, MailboxConfig, MailboxServer};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type Temperature = ModelPoint<Numeric<f32>>;
type Switch = ModelPoint<Bool>;
type Counter = ModelPoint<Numeric<u32>>;

/// Demo settings, read from the JSON file named by the first argument.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DemoSettings {
    /// Stop after this many seconds instead of waiting for Ctrl+C
    #[serde(skip_serializing_if = "Option::is_none")]
    run_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    write_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    database: Option<DatabaseConfig>,
}

impl DemoSettings {
    fn load(path: Option<String>) -> anyhow::Result<Self> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(&path)?;
                let settings = serde_json::from_str(&text)?;
                tracing::info!("Loaded settings from {}", path);
                Ok(settings)
            }
            None => Ok(Self::default()),
        }
    }

    fn write_interval(&self) -> Duration {
        Duration::from_millis(self.write_interval_ms.unwrap_or(500))
    }
}

struct Points {
    temperature: Temperature,
    setpoint: Temperature,
    heater: Switch,
    cycles: Counter,
}

impl Points {
    fn create(db: &Arc<ModelDatabase>) -> anyhow::Result<Self> {
        Ok(Self {
            temperature: db.create("hvac.zone1.temperature", Numeric::new(), None)?,
            setpoint: db.create("hvac.zone1.setpoint", Numeric::new(), Some(21.5))?,
            heater: db.create("hvac.zone1.heaterOn", Bool, Some(false))?,
            cycles: db.create("hvac.cycles", Numeric::hex(), Some(0))?,
        })
    }
}

/// Logs every temperature and heater change.
struct Display {
    temperature: Temperature,
    heater: Switch,
    on_temperature: Subscriber<Numeric<f32>>,
    on_heater: Subscriber<Bool>,
}

impl Component for Display {
    fn open(&self) {
        self.temperature
            .attach(&self.on_temperature, SequenceNumber::UNKNOWN);
        self.heater.attach(&self.on_heater, SequenceNumber::UNKNOWN);
    }

    fn close(&self) {
        self.temperature.detach(&self.on_temperature);
        self.heater.detach(&self.on_heater);
    }
}

/// Turns the heater on below the setpoint and off above it.
struct Thermostat {
    temperature: Temperature,
    on_temperature: Subscriber<Numeric<f32>>,
}

impl Component for Thermostat {
    fn open(&self) {
        self.temperature
            .attach(&self.on_temperature, SequenceNumber::UNKNOWN);
    }

    fn close(&self) {
        self.temperature.detach(&self.on_temperature);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,dm_core=debug,dm_mailbox=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings = DemoSettings::load(std::env::args().nth(1))?;
    tracing::info!("Model point demo starting...");

    let db = ModelDatabase::with_config(settings.database.clone().unwrap_or_default());
    let points = Points::create(&db)?;
    tracing::info!("Registered points: {:?}", db.names());

    // Viewer on a dedicated thread
    let viewer = MailboxServer::spawn(MailboxConfig::named("viewer"))?;
    let display = Arc::new(Display {
        temperature: points.temperature.clone(),
        heater: points.heater.clone(),
        on_temperature: Subscriber::new(viewer.handle(), |point: &Temperature, me: &Subscriber<Numeric<f32>>| {
            let snapshot = point.read_and_sync(me);
            if snapshot.is_valid() {
                tracing::info!("{} = {:.1} (seq {})", point.name(), snapshot.value, snapshot.sequence);
            } else {
                tracing::info!("{} is invalid (seq {})", point.name(), snapshot.sequence);
            }
        }),
        on_heater: Subscriber::new(viewer.handle(), |point: &Switch, _: &Subscriber<Bool>| {
            let state = if point.read().value { "on" } else { "off" };
            tracing::info!("{} switched {}", point.name(), state);
        }),
    });
    viewer.handle().open_async(&display).await?;

    // Thermostat on an async mailbox
    let (mailbox, controller) = Mailbox::new(&MailboxConfig::named("thermostat"));
    let controller_task = tokio::spawn(mailbox.run_async());
    let setpoint = points.setpoint.clone();
    let heater = points.heater.clone();
    let thermostat = Arc::new(Thermostat {
        temperature: points.temperature.clone(),
        on_temperature: Subscriber::new(controller.clone(), move |point: &Temperature, me: &Subscriber<Numeric<f32>>| {
            let current = point.read_and_sync(me);
            let (true, Some(target)) = (current.is_valid(), setpoint.value()) else {
                return;
            };
            heater.write(&(current.value < target), LockRequest::None);
        }),
    });
    controller.open_async(&thermostat).await?;

    // Temperature writer
    let temperature = points.temperature.clone();
    let interval = settings.write_interval();
    let writer = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut tick = 0u32;
        loop {
            ticker.tick().await;
            let value = 20.0 + 3.0 * (tick as f32 * 0.4).sin();
            temperature.write(&value, LockRequest::None);
            tick = tick.wrapping_add(1);
        }
    });

    // Cycle counter thread
    let running = Arc::new(AtomicBool::new(true));
    let counter = {
        let cycles = points.cycles.clone();
        let running = running.clone();
        thread::Builder::new()
            .name("cycle-counter".to_string())
            .spawn(move || {
                while running.load(Ordering::Relaxed) {
                    cycles.increment(1, LockRequest::None);
                    thread::sleep(interval * 2);
                }
            })?
    };

    // Lock the setpoint from "the shell"; a plain write is then ignored
    let update = db.from_json(r#"{"name":"hvac.zone1.setpoint","val":22.0,"locked":true}"#)?;
    tracing::info!("{} updated (seq {})", update.point, update.sequence);
    points.setpoint.write(&15.0, LockRequest::None);
    tracing::info!("Setpoint still {:?} while locked", points.setpoint.value());

    match settings.run_seconds {
        Some(seconds) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received Ctrl+C, shutting down...");
                }
                _ = tokio::time::sleep(Duration::from_secs(seconds)) => {
                    tracing::info!("Run time elapsed, shutting down...");
                }
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
            tracing::info!("Received Ctrl+C, shutting down...");
        }
    }

    writer.abort();
    running.store(false, Ordering::Relaxed);
    tokio::task::spawn_blocking(move || counter.join())
        .await?
        .map_err(|_| anyhow::anyhow!("Cycle counter thread panicked"))?;

    controller.close_async(&thermostat).await?;
    controller.shutdown();
    controller_task.await?;

    viewer.handle().close_async(&display).await?;
    tokio::task::spawn_blocking(move || viewer.shutdown()).await?;

    snapshot_roundtrip(&points.setpoint)?;
    dump(&db)?;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Save a point to a buffer, disturb it, and restore it.
fn snapshot_roundtrip(point: &Temperature) -> anyhow::Result<()> {
    let mut buffer = vec![0u8; point.external_size(true)];
    let (written, saved_at) = point.export_data(&mut buffer, true)?;

    point.write(&18.0, LockRequest::Unlock);
    let (_, restored_at) = point.import_data(&buffer[..written], true)?;
    tracing::info!(
        "{} restored to {:?} (saved at seq {}, now {}, locked {})",
        point.name(),
        point.value(),
        saved_at,
        restored_at,
        point.is_locked()
    );
    Ok(())
}

/// Print every point as JSON, in name order.
fn dump(db: &Arc<ModelDatabase>) -> anyhow::Result<()> {
    let mut current = db.first_by_name();
    while let Some(point) = current {
        println!("{}", point.to_json(JsonOptions::verbose())?);
        current = db.next_by_name(&point);
    }
    Ok(())
}
