//! Recurring plan scheduler.
//!
//! Single tick loop (60 s resolution by default) evaluating cron
//! schedules, a bounded FIFO dispatch queue with per-plan coalescing,
//! and periodic maintenance (retention sweep, health probe). The
//! scheduler never runs more than one engine task at a time.

pub mod cron;
pub use cron::CronExpression;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Error;

use tvs_api_types::{
    BackupPlanConfig, BackupPlanStatus, CartridgeStatus, LogOutcome, SystemLogLevel, TapeError,
};

use crate::backup::{task_from_plan, BackupEngine, TaskControl, TaskProgress};
use crate::server::{jobstate, shutdown_requested, StateStore};
use crate::tape::{SessionManager, SessionReason, TapeHandle};

/// Bounded depth of the dispatch queue.
const DISPATCH_QUEUE_DEPTH: usize = 16;

/// Retention sweep cadence.
const RETENTION_SWEEP_INTERVAL: i64 = 3600;

/// Health probe cadence.
const HEALTH_PROBE_INTERVAL: i64 = 6 * 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerLifecycle {
    Init,
    Running,
    Draining,
    Stopped,
}

/// Evaluates which plans are due and owns the per-plan fire state.
pub struct PlanScheduler {
    jobstate_dir: PathBuf,
}

impl PlanScheduler {
    pub fn new(jobstate_dir: PathBuf) -> Result<Self, Error> {
        jobstate::create_jobstate_dir(&jobstate_dir)?;
        Ok(Self { jobstate_dir })
    }

    /// One evaluation pass: returns the plans due at `now` and
    /// advances their `last_fire_at`.
    ///
    /// `last_fire_at` moves to `now` (not to the computed fire time),
    /// so any number of fires missed during downtime collapse into
    /// exactly one catch-up dispatch, and a second pass with the same
    /// `now` yields nothing.
    pub fn due_plans(&self, now: i64, plans: &[BackupPlanConfig]) -> Vec<BackupPlanConfig> {
        let mut due = Vec::new();

        for plan in plans {
            if !plan.is_enabled() {
                continue;
            }

            let expression: CronExpression = match plan.schedule.parse() {
                Ok(expression) => expression,
                Err(err) => {
                    log::warn!("plan '{}': bad schedule '{}' - {}", plan.id, plan.schedule, err);
                    continue;
                }
            };

            let state = match jobstate::load_plan_state(&self.jobstate_dir, &plan.id) {
                Ok(state) => state,
                Err(err) => {
                    log::warn!("plan '{}': loading state failed - {}", plan.id, err);
                    continue;
                }
            };

            let last_fire = match state.last_fire_at {
                Some(last_fire) => last_fire,
                None => {
                    // first sighting: anchor the schedule at now
                    let _ = jobstate::update_plan_state(&self.jobstate_dir, &plan.id, |state| {
                        state.last_fire_at = Some(now);
                    });
                    continue;
                }
            };

            let next_fire = match expression.compute_next_event(last_fire, false) {
                Ok(next_fire) => next_fire,
                Err(err) => {
                    log::warn!("plan '{}': schedule evaluation failed - {}", plan.id, err);
                    continue;
                }
            };

            if next_fire <= now {
                let _ = jobstate::update_plan_state(&self.jobstate_dir, &plan.id, |state| {
                    state.last_fire_at = Some(now);
                });
                due.push(plan.clone());
            }
        }

        due
    }

    /// Next computed fire time of a plan (for status listings).
    pub fn next_fire(&self, plan: &BackupPlanConfig) -> Option<i64> {
        let expression: CronExpression = plan.schedule.parse().ok()?;
        let state = jobstate::load_plan_state(&self.jobstate_dir, &plan.id).ok()?;
        let last = state.last_fire_at?;
        expression.compute_next_event(last, false).ok()
    }

    /// Plan configurations combined with their live scheduling state.
    pub fn plan_status(&self, plans: &[BackupPlanConfig]) -> Vec<BackupPlanStatus> {
        plans
            .iter()
            .map(|plan| {
                let state = jobstate::load_plan_state(&self.jobstate_dir, &plan.id)
                    .unwrap_or_default();
                BackupPlanStatus {
                    config: plan.clone(),
                    last_fire_at: state.last_fire_at,
                    next_fire_at: self.next_fire(plan),
                }
            })
            .collect()
    }
}

pub struct Scheduler {
    store: Arc<StateStore>,
    engine: BackupEngine,
    plan_scheduler: PlanScheduler,
    device: Arc<Mutex<TapeHandle>>,
    session_manager: Arc<SessionManager>,
    tick_interval: Duration,
    auto_erase_expired: bool,
    queue: VecDeque<BackupPlanConfig>,
    lifecycle: SchedulerLifecycle,
    // cancellation token of the currently running task, for the
    // shutdown force-abort
    current_control: Arc<Mutex<Option<Arc<TaskControl>>>>,
    last_retention_sweep: i64,
    last_health_probe: i64,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<StateStore>,
        engine: BackupEngine,
        plan_scheduler: PlanScheduler,
        device: Arc<Mutex<TapeHandle>>,
        session_manager: Arc<SessionManager>,
        tick_interval: Duration,
        auto_erase_expired: bool,
    ) -> Self {
        Self {
            store,
            engine,
            plan_scheduler,
            device,
            session_manager,
            tick_interval,
            auto_erase_expired,
            queue: VecDeque::new(),
            lifecycle: SchedulerLifecycle::Init,
            current_control: Arc::new(Mutex::new(None)),
            last_retention_sweep: 0,
            last_health_probe: 0,
        }
    }

    pub fn lifecycle(&self) -> SchedulerLifecycle {
        self.lifecycle
    }

    /// Token of the task currently executing, if any.
    pub fn current_task_control(&self) -> Arc<Mutex<Option<Arc<TaskControl>>>> {
        Arc::clone(&self.current_control)
    }

    fn enqueue(&mut self, plan: BackupPlanConfig) {
        if self.queue.iter().any(|queued| queued.id == plan.id) {
            log::debug!("plan '{}': coalescing duplicate dispatch", plan.id);
            return;
        }
        if self.queue.len() >= DISPATCH_QUEUE_DEPTH {
            log::warn!("dispatch queue full, dropping dispatch for plan '{}'", plan.id);
            return;
        }
        self.queue.push_back(plan);
    }

    fn dispatch(&mut self, plan: BackupPlanConfig) {
        let task = task_from_plan(&plan);

        if let Err(err) = self.store.create_task(&task) {
            log::error!("plan '{}': creating task failed - {}", plan.id, err);
            return;
        }

        let control = TaskControl::new();
        let progress = TaskProgress::new();

        *self.current_control.lock().unwrap() = Some(Arc::clone(&control));

        log::info!("plan '{}': starting task {}", plan.id, task.task_id);
        let finished = self.engine.run(task, control, progress);
        log::info!(
            "plan '{}': task {} finished as {}",
            plan.id,
            finished.task_id,
            finished.state
        );

        *self.current_control.lock().unwrap() = None;
    }

    fn tick(&mut self, now: i64) {
        let plans = match self.store.list_plans() {
            Ok(plans) => plans,
            Err(err) => {
                log::error!("listing plans failed - {}", err);
                return;
            }
        };

        for plan in self.plan_scheduler.due_plans(now, &plans) {
            self.enqueue(plan);
        }

        if now - self.last_retention_sweep >= RETENTION_SWEEP_INTERVAL {
            self.last_retention_sweep = now;
            if let Err(err) = self.retention_sweep(now) {
                log::warn!("retention sweep failed - {}", err);
            }
        }

        if now - self.last_health_probe >= HEALTH_PROBE_INTERVAL {
            self.last_health_probe = now;
            if let Err(err) = self.health_probe() {
                log::warn!("health probe failed - {}", err);
            }
        }
    }

    /// Mark cartridges whose retention elapsed as expired; optionally
    /// erase the one sitting in the drive.
    fn retention_sweep(&mut self, now: i64) -> Result<(), Error> {
        let expired: Vec<_> = self
            .store
            .list_cartridges()?
            .into_iter()
            .filter(|cartridge| {
                cartridge.expires_on <= now
                    && matches!(
                        cartridge.status,
                        CartridgeStatus::Idle | CartridgeStatus::Mounted
                    )
            })
            .collect();

        if expired.is_empty() {
            return Ok(());
        }

        let session = match self.session_manager.acquire(SessionReason::Retention) {
            Ok(session) => session,
            Err(TapeError::Busy { holder, .. }) => {
                log::info!("retention sweep postponed, session held by '{}'", holder);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        for cartridge in expired {
            session.check_cartridge_transition(
                &cartridge.tape_id,
                cartridge.status,
                CartridgeStatus::Expired,
            )?;

            if self.auto_erase_expired && cartridge.status == CartridgeStatus::Mounted {
                let mut device = self.device.lock().unwrap();
                if let Err(err) = device.erase(true) {
                    log::warn!(
                        "erasing expired cartridge '{}' failed - {}",
                        cartridge.tape_id,
                        err
                    );
                }
            }

            // the log record lands before the transition becomes visible
            self.store.audit().operation(
                "retention",
                "cartridge.expired",
                &cartridge.tape_id,
                LogOutcome::Success,
                Some(format!("label {}", cartridge.label)),
            )?;

            self.store
                .update_cartridge_status(&cartridge.tape_id, CartridgeStatus::Expired)?;
        }

        Ok(())
    }

    /// Read TapeAlert flags and a diagnostic snapshot into the health
    /// record of the loaded cartridge. Skipped when the session is
    /// busy; a running backup is never disturbed.
    fn health_probe(&mut self) -> Result<(), Error> {
        let _session = match self.session_manager.acquire(SessionReason::Diagnostic) {
            Ok(session) => session,
            Err(TapeError::Busy { .. }) => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let mounted = self
            .store
            .list_cartridges()?
            .into_iter()
            .find(|cartridge| cartridge.status == CartridgeStatus::Mounted);

        let mounted = match mounted {
            Some(cartridge) => cartridge,
            None => return Ok(()),
        };

        let mut device = self.device.lock().unwrap();

        let flags = device.tape_alert()?;
        if flags.is_critical() {
            self.store.audit().system(
                SystemLogLevel::Error,
                "health",
                format!(
                    "cartridge '{}' reports critical tape alerts: {:?}",
                    mounted.tape_id, flags
                ),
            )?;
        }

        let snapshot = device.health_snapshot()?;
        self.store
            .update_cartridge_usage(&mounted.tape_id, mounted.used_bytes, Some(snapshot))?;

        Ok(())
    }

    /// Blocking scheduler loop; returns after a shutdown request once
    /// the current engine task drained.
    pub fn run_loop(&mut self) {
        self.lifecycle = SchedulerLifecycle::Running;
        log::info!(
            "scheduler started (tick interval {} s)",
            self.tick_interval.as_secs()
        );

        let mut next_tick = proxmox_time::epoch_i64();

        while !shutdown_requested() {
            let now = proxmox_time::epoch_i64();

            if now >= next_tick {
                self.tick(now);
                next_tick = now + self.tick_interval.as_secs() as i64;
            }

            match self.queue.pop_front() {
                Some(plan) => self.dispatch(plan),
                None => std::thread::sleep(Duration::from_secs(1)),
            }
        }

        self.lifecycle = SchedulerLifecycle::Draining;
        log::info!("scheduler draining, {} queued dispatches dropped", self.queue.len());
        self.queue.clear();

        self.lifecycle = SchedulerLifecycle::Stopped;
        log::info!("scheduler stopped");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tvs_api_types::BackupKind;

    struct TestDir(PathBuf);

    impl Drop for TestDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    fn test_dir(name: &str) -> TestDir {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "tapevault-scheduler-test-{}-{}",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&path);
        std::fs::create_dir_all(&path).unwrap();
        TestDir(path)
    }

    fn test_plan(id: &str, schedule: &str) -> BackupPlanConfig {
        BackupPlanConfig {
            id: id.to_string(),
            name: id.to_string(),
            schedule: schedule.to_string(),
            kind: BackupKind::Full,
            source_roots: vec!["/data".to_string()],
            retention_months: None,
            enabled: None,
            comment: None,
        }
    }

    #[test]
    fn test_tick_idempotent() {
        let dir = test_dir("idempotent");
        let scheduler = PlanScheduler::new(dir.0.clone()).unwrap();
        let plans = vec![test_plan("plan1", "* * * * *")];

        let now = 1_000_000_000;

        // first pass only anchors the schedule
        assert!(scheduler.due_plans(now, &plans).is_empty());

        // one minute later the plan fires
        let now = now + 60;
        assert_eq!(scheduler.due_plans(now, &plans).len(), 1);

        // a second pass with no time advance fires nothing
        assert!(scheduler.due_plans(now, &plans).is_empty());
    }

    #[test]
    fn test_missed_runs_collapse_into_one() {
        let dir = test_dir("catchup");
        let scheduler = PlanScheduler::new(dir.0.clone()).unwrap();
        let plans = vec![test_plan("plan1", "* * * * *")];

        let start = 1_000_000_000;
        assert!(scheduler.due_plans(start, &plans).is_empty());

        // service was "down" across three fires
        let now = start + 3 * 60 + 30;
        assert_eq!(scheduler.due_plans(now, &plans).len(), 1);

        // exactly one catch-up; the next fire is a full period away
        assert!(scheduler.due_plans(now, &plans).is_empty());
        assert!(scheduler.due_plans(now + 30, &plans).is_empty());
        assert_eq!(scheduler.due_plans(now + 90, &plans).len(), 1);
    }

    #[test]
    fn test_plan_status_reports_fire_times() {
        let dir = test_dir("status");
        let scheduler = PlanScheduler::new(dir.0.clone()).unwrap();
        let plans = vec![test_plan("plan1", "* * * * *")];

        let now = 1_000_000_000;
        assert!(scheduler.due_plans(now, &plans).is_empty());
        assert_eq!(scheduler.due_plans(now + 60, &plans).len(), 1);

        let status = scheduler.plan_status(&plans);
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].last_fire_at, Some(now + 60));
        let next = status[0].next_fire_at.unwrap();
        assert!(next > now + 60);
    }

    #[test]
    fn test_disabled_plans_never_fire() {
        let dir = test_dir("disabled");
        let scheduler = PlanScheduler::new(dir.0.clone()).unwrap();

        let mut plan = test_plan("plan1", "* * * * *");
        plan.enabled = Some(false);
        let plans = vec![plan];

        let now = 1_000_000_000;
        assert!(scheduler.due_plans(now, &plans).is_empty());
        assert!(scheduler.due_plans(now + 3600, &plans).is_empty());
    }

    #[test]
    fn test_bad_schedule_is_skipped() {
        let dir = test_dir("badsched");
        let scheduler = PlanScheduler::new(dir.0.clone()).unwrap();
        let plans = vec![
            test_plan("broken", "not a cron"),
            test_plan("good", "* * * * *"),
        ];

        let now = 1_000_000_000;
        assert!(scheduler.due_plans(now, &plans).is_empty());
        let due = scheduler.due_plans(now + 60, &plans);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, "good");
    }
}
