use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

use proxmox_schema::{api, Schema, StringSchema};
use proxmox_uuid::Uuid;

use crate::{ErrorKind, PLAN_ID_SCHEMA, TAPE_ID_SCHEMA, UUID_FORMAT};

pub const TASK_ID_SCHEMA: Schema = StringSchema::new("Backup task ID.")
    .format(&UUID_FORMAT)
    .schema();

#[api()]
/// Backup kind
#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    /// Reformat the cartridge, then archive everything
    Full,
    /// Archive changes since the last backup
    Incremental,
    /// Archive changes since the last full backup
    Differential,
}

serde_plain::derive_display_from_serialize!(BackupKind);
serde_plain::derive_fromstr_from_deserialize!(BackupKind);

#[api()]
/// Task state
#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Queued, not yet started
    Pending,
    /// Currently holds the tape session
    Running,
    /// Finished without error
    Succeeded,
    /// Finished with an error
    Failed,
    /// Cancelled on external request
    Cancelled,
}

serde_plain::derive_display_from_serialize!(TaskState);
serde_plain::derive_fromstr_from_deserialize!(TaskState);

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// Task states move monotonically; the only shortcut is
    /// `Pending -> Cancelled`.
    pub fn check_transition(self, to: TaskState) -> Result<(), Error> {
        use TaskState::*;

        let allowed = matches!(
            (self, to),
            (Pending, Running) | (Pending, Cancelled) | (Running, Succeeded)
                | (Running, Failed) | (Running, Cancelled)
        );

        if !allowed {
            bail!("illegal task state transition {} -> {}", self, to);
        }
        Ok(())
    }
}

#[api(
    properties: {
        kind: {
            type: ErrorKind,
        },
    },
)]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// Error recorded on a failed task: taxonomy tag plus free text.
pub struct TaskError {
    pub kind: ErrorKind,
    /// Human readable message
    pub message: String,
}

#[api(
    properties: {
        "task-id": {
            schema: TASK_ID_SCHEMA,
        },
        "plan-id": {
            schema: PLAN_ID_SCHEMA,
            optional: true,
        },
        kind: {
            type: BackupKind,
        },
        state: {
            type: TaskState,
        },
        "tape-id": {
            schema: TAPE_ID_SCHEMA,
            optional: true,
        },
        error: {
            type: TaskError,
            optional: true,
        },
    },
)]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// One execution of one plan (or an ad-hoc request).
pub struct BackupTask {
    pub task_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    pub kind: BackupKind,
    pub state: TaskState,
    /// Target cartridge, bound at start
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tape_id: Option<String>,
    /// Ordered list of filesystem paths to archive
    pub source_roots: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
    pub bytes_written: u64,
    pub files_written: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskError>,
}

impl BackupTask {
    pub fn new(plan_id: Option<String>, kind: BackupKind, source_roots: Vec<String>) -> Self {
        Self {
            task_id: Uuid::generate(),
            plan_id,
            kind,
            state: TaskState::Pending,
            tape_id: None,
            source_roots,
            started_at: None,
            finished_at: None,
            bytes_written: 0,
            files_written: 0,
            archive_name: None,
            error: None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_task_state_monotone() {
        use TaskState::*;

        Pending.check_transition(Running).unwrap();
        Pending.check_transition(Cancelled).unwrap();
        Running.check_transition(Succeeded).unwrap();
        Running.check_transition(Failed).unwrap();
        Running.check_transition(Cancelled).unwrap();

        for (from, to) in [
            (Pending, Succeeded),
            (Pending, Failed),
            (Running, Pending),
            (Succeeded, Running),
            (Failed, Running),
            (Cancelled, Pending),
            (Succeeded, Failed),
        ] {
            assert!(from.check_transition(to).is_err());
        }
    }
}
