//! Tapevault service daemon.
//!
//! Wires the configured tape transport, the session manager and the
//! persistence layer together, then hands control to the scheduler
//! loop. SIGINT/SIGTERM trigger a graceful drain: the running backup
//! task gets the configured grace before it is force-aborted.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{format_err, Error};

use tapevault::backup::BackupEngine;
use tapevault::scheduler::{PlanScheduler, Scheduler};
use tapevault::server::{request_shutdown, StateStore};
use tapevault::tape::ltfs::LtfsTools;
use tapevault::tape::{open_tape_drive, SessionManager, DRIVE_LOCK_DIR, STATE_DIR};

fn main() {
    if let Err(err) = syslog::init(
        syslog::Facility::LOG_DAEMON,
        log::LevelFilter::Info,
        Some("tapevault-daemon"),
    ) {
        eprintln!("unable to initialize syslog: {}", err);
        std::process::exit(-1);
    }

    if let Err(err) = run() {
        log::error!("daemon failed: {}", err);
        std::process::exit(-1);
    }
}

fn run() -> Result<(), Error> {
    let service = tvs_config::service::service_config()
        .map_err(|err| format_err!("loading service configuration failed - {}", err))?;

    let drive_config = tvs_config::drive::config()
        .map_err(|err| format_err!("loading drive configuration failed - {}", err))?;
    tvs_config::drive::check_drive_exists(&drive_config, &service.drive)?;

    let mut ltfs = LtfsTools {
        mount_point: service.mount_point().to_string(),
        ..LtfsTools::default()
    };
    if let Some(path) = &service.mkltfs_path {
        ltfs.mkltfs_path = path.clone();
    }
    if let Some(path) = &service.ltfs_path {
        ltfs.ltfs_path = path.clone();
    }

    let device = open_tape_drive(&drive_config, &service.drive, ltfs)
        .map_err(|err| format_err!("opening drive '{}' failed - {}", service.drive, err))?;

    let session_manager = SessionManager::new(
        &service.drive,
        &device.device_path(),
        PathBuf::from(DRIVE_LOCK_DIR),
    );
    let device = Arc::new(Mutex::new(device));

    let state_dir = PathBuf::from(STATE_DIR);
    let store = Arc::new(StateStore::open(&state_dir)?);

    let jobstate_dir = state_dir.join("jobstates");
    let spool_dir = state_dir.join("notifications");

    let engine = BackupEngine::new(
        Arc::clone(&device),
        Arc::clone(&session_manager),
        Arc::clone(&store),
        jobstate_dir.clone(),
        spool_dir,
        service.compress(),
        service.max_volume_bytes,
    );

    let plan_scheduler = PlanScheduler::new(jobstate_dir)?;

    let mut scheduler = Scheduler::new(
        store,
        engine,
        plan_scheduler,
        device,
        session_manager,
        Duration::from_secs(service.check_interval()),
        service.auto_erase_expired.unwrap_or(false),
    );

    let current_control = scheduler.current_task_control();
    let grace = Duration::from_secs(service.shutdown_grace());

    // scheduler and engine run on a worker thread, the async runtime
    // only handles signals
    let scheduler_thread = std::thread::spawn(move || scheduler.run_loop());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("got SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                log::info!("got SIGTERM, shutting down");
            }
        }

        Ok::<(), Error>(())
    })?;

    request_shutdown();

    // drain: give the running task the configured grace, then abort
    let deadline = Instant::now() + grace;
    while !scheduler_thread.is_finished() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(200));
    }

    if !scheduler_thread.is_finished() {
        if let Some(control) = current_control.lock().unwrap().as_ref() {
            log::warn!("drain grace elapsed, aborting running task");
            control.request_abort();
        }
    }

    scheduler_thread
        .join()
        .map_err(|_| format_err!("scheduler thread panicked"))?;

    log::info!("daemon stopped");
    Ok(())
}
