//! Single-writer tape session.
//!
//! All tape I/O runs under an acquired session. Acquisition hands out
//! a scoped guard; release happens on every exit path (including
//! unwinds) via `Drop`. A second in-process acquisition while the
//! session is held fails with `Busy`, and an on-disk device lock
//! excludes other processes from the same transport.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{format_err, Error};
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;

use proxmox_sys::fs::{atomic_open_or_create_file, lock_file, CreateOptions};

use tvs_api_types::{CartridgeStatus, TapeError, VolumeLabel};

/// Why a session was requested; recorded for `Busy` diagnostics.
#[derive(Debug, Clone)]
pub enum SessionReason {
    Backup { task_id: String },
    Format { label: VolumeLabel },
    Diagnostic,
    Retention,
}

impl std::fmt::Display for SessionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionReason::Backup { task_id } => write!(f, "backup/{}", task_id),
            SessionReason::Format { label } => write!(f, "format/{}", label),
            SessionReason::Diagnostic => write!(f, "diagnostic"),
            SessionReason::Retention => write!(f, "retention"),
        }
    }
}

#[derive(Debug, Clone)]
struct HolderInfo {
    reason: String,
    since: i64,
}

/// Hands out exclusive [`TapeSession`] guards for one drive.
pub struct SessionManager {
    drive_name: String,
    device_path: String,
    lock_dir: PathBuf,
    holder: Mutex<Option<HolderInfo>>,
}

pub struct DeviceLockGuard(#[allow(dead_code)] std::fs::File);

// Uses systemd escape_unit to compute a file name from `device_path`,
// then locks `<lock_dir>/<name>`.
fn open_device_lock(lock_dir: &PathBuf, device_path: &str) -> Result<std::fs::File, Error> {
    let lock_name = proxmox_sys::systemd::escape_unit(device_path, true);

    std::fs::create_dir_all(lock_dir)?;

    let mut path = lock_dir.clone();
    path.push(lock_name);

    let options = CreateOptions::new().perm(Mode::from_bits_truncate(0o660));

    atomic_open_or_create_file(
        path,
        OFlag::O_RDWR | OFlag::O_CLOEXEC | OFlag::O_APPEND,
        &[],
        options,
        false,
    )
}

// Acquires an exclusive lock on `device_path`
fn lock_device_path(lock_dir: &PathBuf, device_path: &str) -> Result<DeviceLockGuard, TapeError> {
    let mut file = open_device_lock(lock_dir, device_path)
        .map_err(|err| TapeError::DeviceUnavailable(format!("open device lock - {}", err)))?;

    let timeout = std::time::Duration::new(10, 0);
    if let Err(err) = lock_file(&mut file, true, Some(timeout)) {
        if err.kind() == std::io::ErrorKind::Interrupted {
            return Err(TapeError::Busy {
                holder: "another process".to_string(),
                since: 0,
            });
        }
        return Err(TapeError::DeviceUnavailable(format!(
            "lock device path - {}",
            err
        )));
    }

    Ok(DeviceLockGuard(file))
}

impl SessionManager {
    pub fn new(drive_name: &str, device_path: &str, lock_dir: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            drive_name: drive_name.to_string(),
            device_path: device_path.to_string(),
            lock_dir,
            holder: Mutex::new(None),
        })
    }

    pub fn drive_name(&self) -> &str {
        &self.drive_name
    }

    /// Acquire the exclusive session.
    ///
    /// Returns `Busy{current_holder, since}` without blocking when the
    /// session is already held.
    pub fn acquire(self: &Arc<Self>, reason: SessionReason) -> Result<TapeSession, TapeError> {
        {
            let mut holder = self.holder.lock().unwrap();
            if let Some(current) = holder.as_ref() {
                return Err(TapeError::Busy {
                    holder: current.reason.clone(),
                    since: current.since,
                });
            }
            *holder = Some(HolderInfo {
                reason: reason.to_string(),
                since: proxmox_time::epoch_i64(),
            });
        }

        // also take the on-disk lock so other processes stay out
        let device_lock = match lock_device_path(&self.lock_dir, &self.device_path) {
            Ok(guard) => guard,
            Err(err) => {
                *self.holder.lock().unwrap() = None;
                return Err(err);
            }
        };

        log::debug!(
            "drive '{}': session acquired ({})",
            self.drive_name,
            reason
        );

        Ok(TapeSession {
            manager: Arc::clone(self),
            _device_lock: device_lock,
        })
    }

    /// Current holder, if the session is taken.
    pub fn current_holder(&self) -> Option<(String, i64)> {
        self.holder
            .lock()
            .unwrap()
            .as_ref()
            .map(|info| (info.reason.clone(), info.since))
    }

    fn release(&self) {
        let mut holder = self.holder.lock().unwrap();
        if let Some(info) = holder.take() {
            log::debug!(
                "drive '{}': session released ({})",
                self.drive_name,
                info.reason
            );
        }
    }
}

/// Scoped session guard; releases on drop.
pub struct TapeSession {
    manager: Arc<SessionManager>,
    _device_lock: DeviceLockGuard,
}

impl TapeSession {
    pub fn drive_name(&self) -> &str {
        self.manager.drive_name()
    }

    /// Validate a cartridge state machine edge.
    ///
    /// Every status change of a cartridge travels through the session
    /// holding the transport, so illegal jumps (e.g. `Idle` straight
    /// to `Writing`) are rejected here.
    pub fn check_cartridge_transition(
        &self,
        tape_id: &str,
        from: CartridgeStatus,
        to: CartridgeStatus,
    ) -> Result<(), Error> {
        from.check_transition(to)
            .map_err(|err| format_err!("cartridge '{}': {}", tape_id, err))
    }
}

impl Drop for TapeSession {
    fn drop(&mut self) {
        self.manager.release();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_manager(name: &str) -> (Arc<SessionManager>, tempdir::TempDirGuard) {
        let dir = tempdir::create(name);
        let device_path = dir.path.join("device");
        std::fs::write(&device_path, b"").unwrap();
        let manager = SessionManager::new(
            "drive0",
            device_path.to_str().unwrap(),
            dir.path.join("locks"),
        );
        (manager, dir)
    }

    // minimal scoped temp dir helper for the session tests
    mod tempdir {
        use std::path::PathBuf;

        pub struct TempDirGuard {
            pub path: PathBuf,
        }

        impl Drop for TempDirGuard {
            fn drop(&mut self) {
                let _ = std::fs::remove_dir_all(&self.path);
            }
        }

        pub fn create(name: &str) -> TempDirGuard {
            let mut path = std::env::temp_dir();
            path.push(format!("tapevault-session-test-{}-{}", name, std::process::id()));
            std::fs::create_dir_all(&path).unwrap();
            TempDirGuard { path }
        }
    }

    #[test]
    fn test_exclusive_acquisition() {
        let (manager, _dir) = test_manager("exclusive");

        let session = manager
            .acquire(SessionReason::Backup {
                task_id: "task1".to_string(),
            })
            .unwrap();

        // second acquisition fails Busy with holder info
        match manager.acquire(SessionReason::Diagnostic) {
            Err(TapeError::Busy { holder, since }) => {
                assert_eq!(holder, "backup/task1");
                assert!(since > 0);
            }
            other => panic!("expected Busy, got {:?}", other.map(|_| ())),
        }

        drop(session);

        // after release the session is free again
        let _session = manager.acquire(SessionReason::Diagnostic).unwrap();
    }

    #[test]
    fn test_release_on_unwind() {
        let (manager, _dir) = test_manager("unwind");

        let manager2 = Arc::clone(&manager);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _session = manager2.acquire(SessionReason::Retention).unwrap();
            panic!("job blew up");
        }));
        assert!(result.is_err());

        // the guard was dropped during unwinding
        assert!(manager.current_holder().is_none());
        let _session = manager.acquire(SessionReason::Diagnostic).unwrap();
    }

    #[test]
    fn test_transition_check() {
        let (manager, _dir) = test_manager("transition");
        let session = manager.acquire(SessionReason::Diagnostic).unwrap();

        session
            .check_cartridge_transition("tape1", CartridgeStatus::Idle, CartridgeStatus::Mounted)
            .unwrap();

        assert!(session
            .check_cartridge_transition("tape1", CartridgeStatus::Idle, CartridgeStatus::Writing)
            .is_err());
    }
}
