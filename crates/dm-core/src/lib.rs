//! # dm-core
//!
//! Core model point data layer.
//!
//! This crate provides:
//! - Sequence numbers, validity codes and lock requests
//! - The value codec capability and a handful of thin built-in codecs
//! - Model points (typed and polymorphic handles) and the Model Database
//! - The subscription state machine behind change notifications
//! - Read-modify-write, binary export/import and the JSON envelope
//!
//! This crate is intentionally runtime-agnostic: it never spawns threads and
//! contains no async code. Change notifications are handed to a
//! [`NotificationQueue`] supplied by the application (see `dm-mailbox`).

pub mod codec;
pub mod config;
pub mod database;
pub mod error;
pub mod export;
pub mod json;
pub mod point;
pub mod rmw;
pub mod sequence;
pub mod subscriber;

pub use codec::{Bool, Numeric, NumericPrimitive, ValueCodec};
pub use config::DatabaseConfig;
pub use database::ModelDatabase;
pub use error::DmError;
pub use json::{JsonOptions, JsonUpdate};
pub use point::{ModelPoint, PointRef, Snapshot};
pub use rmw::RmwResult;
pub use sequence::{LockRequest, SequenceNumber, Validity};
pub use subscriber::{ChangeNotification, NotificationQueue, Subscriber};
