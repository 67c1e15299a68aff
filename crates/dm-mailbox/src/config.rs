//! Mailbox configuration.

use serde::{Deserialize, Serialize};

/// Settings for one mailbox (execution context).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MailboxConfig {
    /// Mailbox name, also used as the thread name of a [`MailboxServer`](crate::MailboxServer).
    pub name: String,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            name: "dm-mailbox".to_string(),
        }
    }
}

impl MailboxConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}
