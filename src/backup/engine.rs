//! Backup engine.
//!
//! Executes one backup task end-to-end under the exclusive tape
//! session: precondition checks, label refresh (full backups),
//! archive streaming, bookkeeping. The engine never synthesizes
//! recoveries; every failure maps 1:1 onto the error taxonomy and is
//! recorded before the task state becomes visible.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tvs_api_types::{
    BackupKind, BackupTask, CartridgeLocation, CartridgeStatus, LogOutcome, SystemLogLevel,
    TapeError, TaskState, VolumeLabel,
};

use crate::backup::{ArchiveWriter, TaskControl, TaskProgress};
use crate::server::{
    enqueue_notification, jobstate, notification_for_task, StateStore,
};
use crate::tape::ltfs::LabelSource;
use crate::tape::{SessionManager, SessionReason, TapeHandle};

/// How long to poll for drive readiness after a load.
const READINESS_TIMEOUT_SECS: u64 = 60;

/// Progress is persisted at least this often while archiving.
const PROGRESS_PERSIST_INTERVAL: Duration = Duration::from_secs(5);

pub struct BackupEngine {
    device: Arc<Mutex<TapeHandle>>,
    session_manager: Arc<SessionManager>,
    store: Arc<StateStore>,
    jobstate_dir: PathBuf,
    spool_dir: PathBuf,
    compress: bool,
    max_volume_bytes: Option<u64>,
}

struct JobContext {
    tape_id: String,
    // set once the cartridge entered `Writing`
    writing: bool,
}

impl BackupEngine {
    pub fn new(
        device: Arc<Mutex<TapeHandle>>,
        session_manager: Arc<SessionManager>,
        store: Arc<StateStore>,
        jobstate_dir: PathBuf,
        spool_dir: PathBuf,
        compress: bool,
        max_volume_bytes: Option<u64>,
    ) -> Self {
        Self {
            device,
            session_manager,
            store,
            jobstate_dir,
            spool_dir,
            compress,
            max_volume_bytes,
        }
    }

    /// Run a single pending task to completion.
    ///
    /// Returns the finished task record; the same record has been
    /// persisted. The session is released on every exit path.
    pub fn run(
        &self,
        mut task: BackupTask,
        control: Arc<TaskControl>,
        progress: Arc<TaskProgress>,
    ) -> BackupTask {
        let task_id = task.task_id.to_string();
        let actor = task
            .plan_id
            .clone()
            .unwrap_or_else(|| "operator".to_string());

        task.state = TaskState::Running;
        task.started_at = Some(proxmox_time::epoch_i64());
        if let Err(err) = self.store.update_task_state(&task) {
            log::error!("task {}: persisting Running state failed - {}", task_id, err);
        }

        let mut context = JobContext {
            tape_id: String::new(),
            writing: false,
        };

        let result = match self.session_manager.acquire(SessionReason::Backup {
            task_id: task_id.clone(),
        }) {
            Ok(session) => {
                let result =
                    self.execute(&session, &mut task, &mut context, &control, &progress);
                drop(session); // released on all paths; explicit here for clarity
                result
            }
            Err(err) => Err(err),
        };

        task.bytes_written = progress.bytes_written();
        task.files_written = progress.files_written();
        task.finished_at = Some(proxmox_time::epoch_i64());

        match result {
            Ok(()) => {
                task.state = TaskState::Succeeded;
                task.error = None;

                let _ = self.store.audit().operation(
                    &actor,
                    "backup.completed",
                    &context.tape_id,
                    LogOutcome::Success,
                    Some(format!(
                        "{} bytes, {} files, archive {}",
                        task.bytes_written,
                        task.files_written,
                        task.archive_name.as_deref().unwrap_or("-")
                    )),
                );
            }
            Err(err) => {
                self.handle_failure(&mut task, &mut context, &actor, &err);
            }
        }

        self.finish_task(&mut task);
        task
    }

    fn handle_failure(
        &self,
        task: &mut BackupTask,
        context: &mut JobContext,
        actor: &str,
        err: &TapeError,
    ) {
        let cancelled = matches!(err, TapeError::Cancelled);

        task.state = if cancelled {
            TaskState::Cancelled
        } else {
            TaskState::Failed
        };
        task.error = if cancelled {
            None
        } else {
            Some(err.to_task_error())
        };

        // cartridge leaves the Writing state according to the failure
        if context.writing && !context.tape_id.is_empty() {
            let next_status = match err {
                TapeError::Cancelled => CartridgeStatus::Mounted,
                TapeError::EndOfMedium => CartridgeStatus::Full,
                _ => CartridgeStatus::Errored,
            };
            if let Err(status_err) = self
                .store
                .update_cartridge_status(&context.tape_id, next_status)
            {
                log::error!(
                    "task {}: cartridge status update failed - {}",
                    task.task_id,
                    status_err
                );
            }
        }

        let outcome = if cancelled {
            LogOutcome::Cancelled
        } else {
            LogOutcome::Failure
        };
        let action = if cancelled {
            "backup.cancelled"
        } else {
            "backup.failed"
        };

        let _ = self.store.audit().operation(
            actor,
            action,
            &context.tape_id,
            outcome,
            Some(err.to_string()),
        );
    }

    // Record jobstate and emit a notification when warranted, then
    // persist the terminal task state.
    fn finish_task(&self, task: &mut BackupTask) {
        if let Some(plan_id) = task.plan_id.clone() {
            let previous = jobstate::load_plan_state(&self.jobstate_dir, &plan_id)
                .unwrap_or_default();

            if let Some(notification) = notification_for_task(task, &previous) {
                if let Err(err) = enqueue_notification(&self.spool_dir, &notification) {
                    log::error!("enqueueing notification failed - {}", err);
                }
            }

            let outcome = task.state;
            if let Err(err) = jobstate::update_plan_state(&self.jobstate_dir, &plan_id, |state| {
                state.last_outcome = Some(outcome);
            }) {
                log::error!("updating plan state failed - {}", err);
            }
        }

        if let Err(err) = self.store.update_task_state(task) {
            log::error!(
                "task {}: persisting terminal state failed - {}",
                task.task_id,
                err
            );
        }
    }

    fn execute(
        &self,
        session: &crate::tape::TapeSession,
        task: &mut BackupTask,
        context: &mut JobContext,
        control: &Arc<TaskControl>,
        progress: &Arc<TaskProgress>,
    ) -> Result<(), TapeError> {
        let mut device = self.device.lock().unwrap();

        // bind the target cartridge
        let cartridge = self.resolve_cartridge(task)?;
        context.tape_id = cartridge.tape_id.clone();
        task.tape_id = Some(cartridge.tape_id.clone());
        self.store
            .update_task_state(task)
            .map_err(|err| TapeError::ConfigError(err.to_string()))?;

        control.check_abort()?;

        // bring the medium online
        if cartridge.status == CartridgeStatus::Idle {
            session.check_cartridge_transition(
                &cartridge.tape_id,
                cartridge.status,
                CartridgeStatus::Mounted,
            )
            .map_err(|err| TapeError::ConfigError(err.to_string()))?;

            if !device.ready()? {
                device.load()?;
            }
            device.wait_for_ready(READINESS_TIMEOUT_SECS)?;

            self.store
                .update_cartridge_status(&cartridge.tape_id, CartridgeStatus::Mounted)
                .map_err(|err| TapeError::ConfigError(err.to_string()))?;
        } else {
            device.wait_for_ready(READINESS_TIMEOUT_SECS)?;
        }

        device.mount_volume()?;

        let info = device.device_info()?;
        log::info!(
            "task {}: drive {} {} ({})",
            task.task_id,
            info.vendor,
            info.product,
            info.firmware
        );

        let current_label = self.read_label(&mut device)?;

        let now = proxmox_time::epoch_i64();
        let tm = proxmox_time::gmtime(now)
            .map_err(|err| TapeError::ConfigError(format!("broken system time - {}", err)))?;
        let year = (tm.tm_year + 1900) as u16;
        let month = (tm.tm_mon + 1) as u8;

        control.check_abort()?;

        // label policy
        match task.kind {
            BackupKind::Full => {
                let desired = self.desired_label(current_label, year, month)?;

                log::info!("task {}: formatting with label {}", task.task_id, desired);
                device.format(&desired, false, false)?;
                device.mount_volume()?;

                self.store
                    .update_cartridge_label(&cartridge.tape_id, desired)
                    .map_err(|err| TapeError::ConfigError(err.to_string()))?;

                // a reformat makes a Full/Errored cartridge writable again
                let current = self
                    .store
                    .lookup_cartridge(&cartridge.tape_id)
                    .map_err(|err| TapeError::ConfigError(err.to_string()))?;
                if current.status != CartridgeStatus::Mounted {
                    session
                        .check_cartridge_transition(
                            &cartridge.tape_id,
                            current.status,
                            CartridgeStatus::Mounted,
                        )
                        .map_err(|err| TapeError::ConfigError(err.to_string()))?;
                    self.store
                        .update_cartridge_status(&cartridge.tape_id, CartridgeStatus::Mounted)
                        .map_err(|err| TapeError::ConfigError(err.to_string()))?;
                }

                let _ = self.store.audit().operation(
                    task.plan_id.as_deref().unwrap_or("operator"),
                    "cartridge.format",
                    &cartridge.tape_id,
                    LogOutcome::Success,
                    Some(format!("label {}", desired)),
                );
            }
            BackupKind::Incremental | BackupKind::Differential => match current_label {
                Some(label) if label.is_current_month(month) => {
                    if !label.year_matches(year) {
                        let _ = self.store.audit().system(
                            SystemLogLevel::Warn,
                            "engine",
                            format!(
                                "label {} matches month {:02} but not year {}",
                                label, month, year
                            ),
                        );
                    }
                }
                Some(label) => {
                    return Err(TapeError::LabelMonthMismatch {
                        label: label.to_string(),
                        month,
                    });
                }
                None => {
                    return Err(TapeError::LabelMonthMismatch {
                        label: "<unlabeled>".to_string(),
                        month,
                    });
                }
            },
        }

        control.check_abort()?;

        // archive naming: <plan_or_task>_<utc_timestamp>.tar[.gz]
        let job_name = task
            .plan_id
            .clone()
            .unwrap_or_else(|| task.task_id.to_string());
        let suffix = if self.compress { ".tar.gz" } else { ".tar" };
        let archive_name = format!(
            "{}_{:04}{:02}{:02}_{:02}{:02}{:02}{}",
            job_name, year, month, tm.tm_mday, tm.tm_hour, tm.tm_min, tm.tm_sec, suffix
        );
        task.archive_name = Some(archive_name.clone());

        // writer starts: Mounted -> Writing
        let current = self
            .store
            .lookup_cartridge(&cartridge.tape_id)
            .map_err(|err| TapeError::ConfigError(err.to_string()))?;

        // per-cartridge volume ceiling
        if let Some(max_volume_bytes) = self.max_volume_bytes {
            if current.used_bytes >= max_volume_bytes {
                return Err(TapeError::EndOfMedium);
            }
        }

        session
            .check_cartridge_transition(
                &cartridge.tape_id,
                current.status,
                CartridgeStatus::Writing,
            )
            .map_err(|err| TapeError::ConfigError(err.to_string()))?;
        self.store
            .update_cartridge_status(&cartridge.tape_id, CartridgeStatus::Writing)
            .map_err(|err| TapeError::ConfigError(err.to_string()))?;
        context.writing = true;

        let destination = device.volume_path().join(&archive_name);

        let writer = ArchiveWriter::new(
            &task.source_roots,
            &destination,
            self.compress,
            Arc::clone(progress),
            Arc::clone(control),
        );

        let persister = self.spawn_progress_persister(task, progress);
        let result = writer.run();
        persister.stop();

        result?;

        // success: Writing -> Mounted
        self.store
            .update_cartridge_status(&cartridge.tape_id, CartridgeStatus::Mounted)
            .map_err(|err| TapeError::ConfigError(err.to_string()))?;
        context.writing = false;

        let health = device.health_snapshot().ok();
        // the label refresh above may have reset the usage counter
        let base_bytes = self
            .store
            .lookup_cartridge(&cartridge.tape_id)
            .map(|cartridge| cartridge.used_bytes)
            .unwrap_or(cartridge.used_bytes);
        let used_bytes = base_bytes + progress.bytes_written();
        if let Err(err) =
            self.store
                .update_cartridge_usage(&cartridge.tape_id, used_bytes, health)
        {
            log::warn!("task {}: usage update failed - {}", task.task_id, err);
        }

        Ok(())
    }

    fn desired_label(
        &self,
        current: Option<VolumeLabel>,
        year: u16,
        month: u8,
    ) -> Result<VolumeLabel, TapeError> {
        if let Some(label) = current {
            // keep the sequence number when month and year still match
            if label.is_current_month(month) && label.year_matches(year) {
                return Ok(label);
            }
        }

        let known = self
            .store
            .list_known_labels()
            .map_err(|err| TapeError::ConfigError(err.to_string()))?;

        VolumeLabel::next_in_month(&known, year, month)
            .map_err(|err| TapeError::ConfigError(err.to_string()))
    }

    fn read_label(&self, device: &mut TapeHandle) -> Result<Option<VolumeLabel>, TapeError> {
        match device.read_volume_label()? {
            Some((label, LabelSource::LegacyFile)) => {
                let _ = self.store.audit().system(
                    SystemLogLevel::Warn,
                    "ltfs",
                    format!(
                        "volume label {} read from legacy {} file, please relabel",
                        label,
                        crate::tape::ltfs::LEGACY_LABEL_FILE
                    ),
                );
                Ok(Some(label))
            }
            Some((label, LabelSource::VolumeName)) => Ok(Some(label)),
            None => Ok(None),
        }
    }

    // Pick the target cartridge: an explicit binding wins, otherwise
    // prefer whatever is already in the drive, then mounted, then the
    // first idle cartridge.
    fn resolve_cartridge(
        &self,
        task: &BackupTask,
    ) -> Result<tvs_api_types::TapeCartridge, TapeError> {
        if let Some(tape_id) = &task.tape_id {
            return self
                .store
                .lookup_cartridge(tape_id)
                .map_err(|err| TapeError::ConfigError(err.to_string()));
        }

        let cartridges = self
            .store
            .list_cartridges()
            .map_err(|err| TapeError::ConfigError(err.to_string()))?;

        let in_drive = cartridges
            .iter()
            .find(|cartridge| cartridge.location == CartridgeLocation::Drive);
        let mounted = cartridges
            .iter()
            .find(|cartridge| cartridge.status == CartridgeStatus::Mounted);
        let idle = cartridges
            .iter()
            .find(|cartridge| cartridge.status == CartridgeStatus::Idle);

        in_drive
            .or(mounted)
            .or(idle)
            .cloned()
            .ok_or_else(|| TapeError::ConfigError("no usable cartridge available".to_string()))
    }

    fn spawn_progress_persister(
        &self,
        task: &BackupTask,
        progress: &Arc<TaskProgress>,
    ) -> ProgressPersister {
        let stop = Arc::new(AtomicBool::new(false));
        let store = Arc::clone(&self.store);
        let progress = Arc::clone(progress);
        let mut snapshot = task.clone();
        let stop2 = Arc::clone(&stop);

        let handle = std::thread::spawn(move || loop {
            for _ in 0..10 {
                if stop2.load(Ordering::SeqCst) {
                    return;
                }
                std::thread::sleep(PROGRESS_PERSIST_INTERVAL / 10);
            }

            snapshot.bytes_written = progress.bytes_written();
            snapshot.files_written = progress.files_written();
            if let Err(err) = store.update_task_state(&snapshot) {
                log::warn!("persisting task progress failed - {}", err);
            }
        });

        ProgressPersister { stop, handle }
    }
}

struct ProgressPersister {
    stop: Arc<AtomicBool>,
    handle: std::thread::JoinHandle<()>,
}

impl ProgressPersister {
    fn stop(self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.handle.join();
    }
}

/// Build a pending task from a plan definition.
pub fn task_from_plan(plan: &tvs_api_types::BackupPlanConfig) -> BackupTask {
    BackupTask::new(
        Some(plan.id.clone()),
        plan.kind,
        plan.source_roots.clone(),
    )
}
