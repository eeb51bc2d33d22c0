//! End-to-end backup engine tests against the virtual tape drive.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Error;

use tvs_api_types::{
    BackupKind, BackupTask, CartridgeLocation, CartridgeStatus, ErrorKind, TapeCartridge,
    TapeDensity, TaskState, VolumeLabel,
};

use tapevault::backup::{BackupEngine, TaskControl, TaskProgress};
use tapevault::server::StateStore;
use tapevault::tape::ltfs::LtfsTools;
use tapevault::tape::{open_tape_drive, SessionManager, SessionReason, TapeHandle};

struct TestEnv {
    _dir: TestDir,
    store: Arc<StateStore>,
    device: Arc<Mutex<TapeHandle>>,
    session_manager: Arc<SessionManager>,
    engine: BackupEngine,
    source: PathBuf,
    volume: PathBuf,
}

struct TestDir(PathBuf);

impl Drop for TestDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

fn test_dir(name: &str) -> TestDir {
    let mut path = std::env::temp_dir();
    path.push(format!(
        "tapevault-engine-test-{}-{}",
        name,
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&path);
    std::fs::create_dir_all(&path).unwrap();
    TestDir(path)
}

fn test_cartridge(label: &str, now: i64) -> TapeCartridge {
    TapeCartridge {
        tape_id: "tape1".to_string(),
        label: label.parse().unwrap(),
        kind: TapeDensity::LTO8,
        capacity_bytes: 12 * 1024 * 1024 * 1024 * 1024,
        used_bytes: 0,
        location: CartridgeLocation::Drive,
        manufactured_on: now - 86400,
        expires_on: now + 365 * 86400,
        status: CartridgeStatus::Idle,
        last_health: None,
        created_at: now,
        updated_at: now,
    }
}

fn setup(name: &str, on_volume_label: Option<&str>, cartridge_label: &str) -> TestEnv {
    let dir = test_dir(name);
    let base = dir.0.clone();

    // source data: one megabyte file
    let source = base.join("data");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(source.join("one.bin"), vec![0x5au8; 1024 * 1024]).unwrap();

    // drive configuration with a virtual backend
    let vtape_dir = base.join("vtape");
    let config_text = format!("virtual: drive0\n\tpath {}\n", vtape_dir.display());
    let drive_config = tvs_config::drive::CONFIG.parse("tape.cfg", &config_text).unwrap();

    let mut device =
        open_tape_drive(&drive_config, "drive0", LtfsTools::default()).unwrap();
    let volume = device.volume_path();

    // seed the medium
    device.load().unwrap();
    if let Some(label) = on_volume_label {
        let label: VolumeLabel = label.parse().unwrap();
        device.format(&label, false, false).unwrap();
    }
    device.unload().unwrap();

    let session_manager =
        SessionManager::new("drive0", &device.device_path(), base.join("locks"));
    let device = Arc::new(Mutex::new(device));

    let store = Arc::new(StateStore::open(&base.join("state")).unwrap());

    let now = proxmox_time::epoch_i64();
    store
        .upsert_cartridge(test_cartridge(cartridge_label, now))
        .unwrap();

    let engine = BackupEngine::new(
        Arc::clone(&device),
        Arc::clone(&session_manager),
        Arc::clone(&store),
        base.join("jobstates"),
        base.join("notifications"),
        false,
        None,
    );

    TestEnv {
        _dir: dir,
        store,
        device,
        session_manager,
        engine,
        source,
        volume,
    }
}

fn now_year_month() -> (u16, u8) {
    let tm = proxmox_time::gmtime(proxmox_time::epoch_i64()).unwrap();
    ((tm.tm_year + 1900) as u16, (tm.tm_mon + 1) as u8)
}

fn month_label(seq: u8) -> String {
    let (year, month) = now_year_month();
    format!("TP{:04}{:02}{:02}", year, month, seq)
}

fn pending_task(env: &TestEnv, kind: BackupKind) -> BackupTask {
    let task = BackupTask::new(
        Some("plan1".to_string()),
        kind,
        vec![env.source.display().to_string()],
    );
    env.store.create_task(&task).unwrap();
    task
}

fn run_task(env: &TestEnv, task: BackupTask) -> BackupTask {
    env.engine
        .run(task, TaskControl::new(), TaskProgress::new())
}

// S1: full backup onto a cartridge already labeled for the current
// month keeps the label (sequence number preserved).
#[test]
fn test_full_backup_current_month() -> Result<(), Error> {
    let label = month_label(3);
    let env = setup("s1", Some(&label), &label);

    let task = pending_task(&env, BackupKind::Full);
    let finished = run_task(&env, task);

    assert_eq!(finished.state, TaskState::Succeeded);
    assert!(finished.bytes_written > 1024 * 1024);
    assert_eq!(finished.files_written, 1);
    assert_eq!(finished.tape_id.as_deref(), Some("tape1"));

    // label stayed TP<yyyy><mm>03
    let cartridge = env.store.lookup_cartridge("tape1")?;
    assert_eq!(cartridge.label.to_string(), label);
    assert_eq!(cartridge.status, CartridgeStatus::Mounted);

    // the archive file exists on the volume and is named after the plan
    let archive_name = finished.archive_name.clone().unwrap();
    assert!(archive_name.starts_with("plan1_"));
    assert!(archive_name.ends_with(".tar"));
    assert!(env.volume.join(&archive_name).exists());

    // timestamps are sane
    assert!(finished.started_at.unwrap() <= finished.finished_at.unwrap());

    Ok(())
}

// S2: a stale label forces a reformat with a freshly minted label.
#[test]
fn test_full_backup_stale_label_reformats() -> Result<(), Error> {
    let env = setup("s2", Some("TP20201107"), "TP20201107");

    let task = pending_task(&env, BackupKind::Full);
    let finished = run_task(&env, task);

    assert_eq!(finished.state, TaskState::Succeeded);

    // no labels known for the current month: seq 01 is minted
    let expected = month_label(1);
    let cartridge = env.store.lookup_cartridge("tape1")?;
    assert_eq!(cartridge.label.to_string(), expected);

    // the volume itself carries the new label too
    let mut device = env.device.lock().unwrap();
    let (on_volume, _source) = device.read_volume_label().unwrap().unwrap();
    assert_eq!(on_volume.to_string(), expected);

    Ok(())
}

// S3: incremental against a stale label fails fast, nothing written.
#[test]
fn test_incremental_stale_label_fails() -> Result<(), Error> {
    let env = setup("s3", Some("TP20201107"), "TP20201107");

    let task = pending_task(&env, BackupKind::Incremental);
    let finished = run_task(&env, task);

    assert_eq!(finished.state, TaskState::Failed);
    let error = finished.error.clone().unwrap();
    assert_eq!(error.kind, ErrorKind::LabelMonthMismatch);

    // no bytes written, no archive, label untouched
    assert_eq!(finished.bytes_written, 0);
    let cartridge = env.store.lookup_cartridge("tape1")?;
    assert_eq!(cartridge.label.to_string(), "TP20201107");

    // session was released
    assert!(env.session_manager.current_holder().is_none());
    let _session = env.session_manager.acquire(SessionReason::Diagnostic).unwrap();

    Ok(())
}

// Incremental in the current month succeeds without a format.
#[test]
fn test_incremental_current_month() -> Result<(), Error> {
    let label = month_label(1);
    let env = setup("inc", Some(&label), &label);

    let task = pending_task(&env, BackupKind::Incremental);
    let finished = run_task(&env, task);

    assert_eq!(finished.state, TaskState::Succeeded);
    let cartridge = env.store.lookup_cartridge("tape1")?;
    assert_eq!(cartridge.label.to_string(), label);

    Ok(())
}

// S5: cancellation mid-archive closes the archive and leaves the
// cartridge mounted.
#[test]
fn test_cancellation_mid_archive() -> Result<(), Error> {
    let label = month_label(1);
    let env = setup("s5", Some(&label), &label);

    // big enough that the writer cannot win the race with the abort
    std::fs::write(env.source.join("big.bin"), vec![0u8; 64 * 1024 * 1024]).unwrap();

    let task = pending_task(&env, BackupKind::Incremental);
    let control = TaskControl::new();
    let progress = TaskProgress::new();

    // abort as soon as the cartridge enters Writing
    let store = Arc::clone(&env.store);
    let abort_control = Arc::clone(&control);
    let watcher = std::thread::spawn(move || {
        for _ in 0..10_000 {
            if let Ok(cartridge) = store.lookup_cartridge("tape1") {
                if cartridge.status == CartridgeStatus::Writing {
                    abort_control.request_abort();
                    return;
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    });

    let finished = env.engine.run(task, control, progress);
    watcher.join().unwrap();

    assert_eq!(finished.state, TaskState::Cancelled);

    // partial archive exists and is closed; cartridge back to Mounted
    let archive_name = finished.archive_name.clone().unwrap();
    assert!(env.volume.join(&archive_name).exists());

    let cartridge = env.store.lookup_cartridge("tape1")?;
    assert_eq!(cartridge.status, CartridgeStatus::Mounted);

    // session released
    assert!(env.session_manager.current_holder().is_none());

    Ok(())
}

// S6: a concurrent session request fails Busy and does not disturb
// anything.
#[test]
fn test_concurrent_session_request() -> Result<(), Error> {
    let label = month_label(1);
    let env = setup("s6", Some(&label), &label);

    // a diagnostic session holds the transport
    let diagnostic = env.session_manager.acquire(SessionReason::Diagnostic)?;

    let task = pending_task(&env, BackupKind::Full);
    let finished = run_task(&env, task);

    assert_eq!(finished.state, TaskState::Failed);
    let error = finished.error.clone().unwrap();
    assert_eq!(error.kind, ErrorKind::Busy);

    // the diagnostic session is unaffected
    assert!(env.session_manager.current_holder().is_some());
    drop(diagnostic);

    // cartridge state untouched
    let cartridge = env.store.lookup_cartridge("tape1")?;
    assert_eq!(cartridge.status, CartridgeStatus::Idle);
    assert_eq!(cartridge.label.to_string(), label);

    Ok(())
}

// task state transitions recorded in the store stay monotone
#[test]
fn test_task_record_persisted() -> Result<(), Error> {
    let label = month_label(1);
    let env = setup("record", Some(&label), &label);

    let task = pending_task(&env, BackupKind::Full);
    let task_id = task.task_id.to_string();

    let stored = env.store.load_task(&task_id)?;
    assert_eq!(stored.state, TaskState::Pending);

    let finished = run_task(&env, task);
    assert_eq!(finished.state, TaskState::Succeeded);

    let stored = env.store.load_task(&task_id)?;
    assert_eq!(stored.state, TaskState::Succeeded);
    assert_eq!(stored.bytes_written, finished.bytes_written);

    // a terminal task cannot go back to Running
    let mut regressed = stored.clone();
    regressed.state = TaskState::Running;
    assert!(env.store.update_task_state(&regressed).is_err());

    Ok(())
}
