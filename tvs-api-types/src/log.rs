use serde::{Deserialize, Serialize};

use proxmox_schema::api;

#[api()]
#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Outcome recorded with an operation log entry
pub enum LogOutcome {
    /// Operation finished as requested
    Success,
    /// Operation failed
    Failure,
    /// Operation was cancelled
    Cancelled,
}

serde_plain::derive_display_from_serialize!(LogOutcome);
serde_plain::derive_fromstr_from_deserialize!(LogOutcome);

#[api(
    properties: {
        outcome: {
            type: LogOutcome,
        },
    },
)]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// Append-only audit record for tape and backup operations.
pub struct OperationLogEntry {
    /// Time stamp (epoch)
    pub ts: i64,
    /// Originator (plan id, "operator", "scheduler", ...)
    pub actor: String,
    /// Action name (e.g. 'backup.completed', 'cartridge.format')
    pub action: String,
    /// Target entity (tape id, task id, ...)
    pub target: String,
    pub outcome: LogOutcome,
    /// Free form details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[api()]
#[derive(Debug, PartialEq, Eq, PartialOrd, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// System log level
pub enum SystemLogLevel {
    /// Debug
    Debug,
    /// Informational
    Info,
    /// Warning
    Warn,
    /// Error
    Error,
}

serde_plain::derive_display_from_serialize!(SystemLogLevel);
serde_plain::derive_fromstr_from_deserialize!(SystemLogLevel);

#[api(
    properties: {
        level: {
            type: SystemLogLevel,
        },
    },
)]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// Append-only service diagnostics record.
pub struct SystemLogEntry {
    /// Time stamp (epoch)
    pub ts: i64,
    pub level: SystemLogLevel,
    /// Component name ('scheduler', 'engine', 'ltfs', ...)
    pub component: String,
    /// Message text
    pub message: String,
}
