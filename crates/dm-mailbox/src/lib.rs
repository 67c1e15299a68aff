//! # dm-mailbox
//!
//! Execution contexts for model point subscribers.
//!
//! A mailbox is a queue plus the one thread or task that drains it. Change
//! notifications and arbitrary closures posted to the mailbox run there, one
//! at a time, in posting order. Two drivers are provided:
//!
//! - [`MailboxServer`]: a dedicated OS thread
//! - [`Mailbox::run_async`]: a future to spawn on a tokio runtime
//!
//! [`MailboxHandle`] is the sending side. It implements
//! [`dm_core::NotificationQueue`], so it is what subscribers are created
//! with, and it offers synchronous calls onto the mailbox for opening and
//! closing [`Component`]s.

pub mod config;
pub mod error;
pub mod mailbox;
pub mod server;

pub use config::MailboxConfig;
pub use error::MailboxError;
pub use mailbox::{Component, Mailbox, MailboxHandle};
pub use server::MailboxServer;
