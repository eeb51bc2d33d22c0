//! Notification spool.
//!
//! The core only enqueues; the delivery transport picks spool files up
//! out of process. Notifications fire on transitions into `Failed` and
//! on `Succeeded` after a prior failure.

use std::path::Path;

use anyhow::Error;
use serde::{Deserialize, Serialize};

use proxmox_sys::fs::{replace_file, CreateOptions};

use tvs_api_types::{BackupTask, TaskState};

use crate::server::jobstate::PlanRunState;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationSeverity {
    Info,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Notification {
    pub ts: i64,
    pub severity: NotificationSeverity,
    /// Event name ('backup.failed', 'backup.recovered')
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    pub task_id: String,
    pub message: String,
}

/// Write one notification into the spool directory.
pub fn enqueue_notification(spool_dir: &Path, notification: &Notification) -> Result<(), Error> {
    std::fs::create_dir_all(spool_dir)?;

    let name = format!(
        "notification-{}-{}.json",
        notification.ts, notification.task_id
    );
    let raw = serde_json::to_string_pretty(notification)?;
    replace_file(spool_dir.join(name), raw.as_bytes(), CreateOptions::new(), false)?;

    Ok(())
}

/// Decide whether a finished task warrants a notification.
pub fn notification_for_task(
    task: &BackupTask,
    previous: &PlanRunState,
) -> Option<Notification> {
    let ts = proxmox_time::epoch_i64();
    let task_id = task.task_id.to_string();

    match task.state {
        TaskState::Failed => {
            let message = match &task.error {
                Some(error) => format!("backup failed ({}): {}", error.kind, error.message),
                None => "backup failed".to_string(),
            };
            Some(Notification {
                ts,
                severity: NotificationSeverity::Error,
                event: "backup.failed".to_string(),
                plan_id: task.plan_id.clone(),
                task_id,
                message,
            })
        }
        TaskState::Succeeded if previous.last_outcome == Some(TaskState::Failed) => {
            Some(Notification {
                ts,
                severity: NotificationSeverity::Info,
                event: "backup.recovered".to_string(),
                plan_id: task.plan_id.clone(),
                task_id,
                message: "backup succeeded after prior failure".to_string(),
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tvs_api_types::BackupKind;

    fn finished_task(state: TaskState) -> BackupTask {
        let mut task = BackupTask::new(
            Some("plan1".to_string()),
            BackupKind::Full,
            vec!["/data".to_string()],
        );
        task.state = state;
        task
    }

    #[test]
    fn test_notification_rules() {
        let failed = finished_task(TaskState::Failed);
        let succeeded = finished_task(TaskState::Succeeded);
        let cancelled = finished_task(TaskState::Cancelled);

        let after_success = PlanRunState {
            last_outcome: Some(TaskState::Succeeded),
            ..Default::default()
        };
        let after_failure = PlanRunState {
            last_outcome: Some(TaskState::Failed),
            ..Default::default()
        };

        // failures always notify
        assert!(notification_for_task(&failed, &after_success).is_some());
        assert!(notification_for_task(&failed, &after_failure).is_some());

        // success only notifies as recovery
        assert!(notification_for_task(&succeeded, &after_success).is_none());
        let recovered = notification_for_task(&succeeded, &after_failure).unwrap();
        assert_eq!(recovered.event, "backup.recovered");

        // cancellation is silent
        assert!(notification_for_task(&cancelled, &after_failure).is_none());
    }
}
