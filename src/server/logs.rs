//! Append-only audit trail.
//!
//! Both logs are JSON lines files. The core only appends; readers are
//! external. Appends happen before the state transition they describe
//! becomes visible, so a consumer never sees a transition without its
//! log record.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{format_err, Error};

use tvs_api_types::{LogOutcome, OperationLogEntry, SystemLogEntry, SystemLogLevel};

pub struct AuditLog {
    operation_log_path: PathBuf,
    system_log_path: PathBuf,
}

fn append_json_line<T: serde::Serialize>(path: &Path, record: &T) -> Result<(), Error> {
    let mut line = serde_json::to_string(record)?;
    line.push('\n');

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| format_err!("open log {:?} failed - {}", path, err))?;

    file.write_all(line.as_bytes())
        .map_err(|err| format_err!("append to log {:?} failed - {}", path, err))?;

    Ok(())
}

impl AuditLog {
    pub fn new(log_dir: &Path) -> Result<Self, Error> {
        std::fs::create_dir_all(log_dir)?;
        Ok(Self {
            operation_log_path: log_dir.join("operations.jsonl"),
            system_log_path: log_dir.join("system.jsonl"),
        })
    }

    pub fn record_operation_log(&self, entry: &OperationLogEntry) -> Result<(), Error> {
        append_json_line(&self.operation_log_path, entry)
    }

    pub fn record_system_log(&self, entry: &SystemLogEntry) -> Result<(), Error> {
        append_json_line(&self.system_log_path, entry)
    }

    /// Convenience wrapper: builds the record and mirrors it to the
    /// process log.
    pub fn operation(
        &self,
        actor: &str,
        action: &str,
        target: &str,
        outcome: LogOutcome,
        details: Option<String>,
    ) -> Result<(), Error> {
        let entry = OperationLogEntry {
            ts: proxmox_time::epoch_i64(),
            actor: actor.to_string(),
            action: action.to_string(),
            target: target.to_string(),
            outcome,
            details,
        };
        log::info!(
            "operation {}: {} on {} - {}",
            entry.actor,
            entry.action,
            entry.target,
            entry.outcome
        );
        self.record_operation_log(&entry)
    }

    /// Convenience wrapper for system diagnostics.
    pub fn system(
        &self,
        level: SystemLogLevel,
        component: &str,
        message: impl Into<String>,
    ) -> Result<(), Error> {
        let entry = SystemLogEntry {
            ts: proxmox_time::epoch_i64(),
            level,
            component: component.to_string(),
            message: message.into(),
        };
        match level {
            SystemLogLevel::Debug => log::debug!("{}: {}", entry.component, entry.message),
            SystemLogLevel::Info => log::info!("{}: {}", entry.component, entry.message),
            SystemLogLevel::Warn => log::warn!("{}: {}", entry.component, entry.message),
            SystemLogLevel::Error => log::error!("{}: {}", entry.component, entry.message),
        }
        self.record_system_log(&entry)
    }
}
