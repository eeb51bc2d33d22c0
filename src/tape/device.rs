//! Unified tape device facade.
//!
//! The two production transports (SCSI pass-through, ITDT) and the
//! virtual test drive are wired at startup from the drive
//! configuration and held behind one handle for the process lifetime.
//! The facade owns the transient-error retry policy, so callers see a
//! single failure per operation.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{bail, Error};
use serde::Deserialize;

use proxmox_section_config::SectionConfigData;

use tvs_api_types::{
    DeviceInfo, ItdtTapeDrive, PerformanceCounters, ScsiTapeDrive, TapeError, TapePosition,
    VirtualTapeDrive, VolumeLabel,
};
use tvs_tape::sg_tape::TapeAlertFlags;
use tvs_tape::{ItdtTape, SgTape};

use crate::tape::ltfs::{self, LabelSource, LtfsTools};
use crate::tape::virtual_tape::{open_virtual_tape_drive, VirtualTapeHandle};

/// Transient-failure retry: exponential backoff, base 500 ms, cap 8 s,
/// up to 5 attempts.
const RETRY_ATTEMPTS: u32 = 5;
const RETRY_BASE: Duration = Duration::from_millis(500);
const RETRY_CAP: Duration = Duration::from_secs(8);

fn retry_transient<T>(
    what: &str,
    mut op: impl FnMut() -> Result<T, TapeError>,
) -> Result<T, TapeError> {
    let mut delay = RETRY_BASE;

    for attempt in 1..=RETRY_ATTEMPTS {
        match op() {
            Err(err) if err.is_transient() && attempt < RETRY_ATTEMPTS => {
                log::info!(
                    "{}: transient failure (attempt {}/{}), retrying in {} ms - {}",
                    what,
                    attempt,
                    RETRY_ATTEMPTS,
                    delay.as_millis(),
                    err
                );
                std::thread::sleep(delay);
                delay = std::cmp::min(delay * 2, RETRY_CAP);
            }
            other => return other,
        }
    }

    unreachable!("retry loop always returns on the last attempt");
}

enum TapeBackend {
    Scsi { tape: SgTape, path: String },
    Itdt(ItdtTape),
    Virtual(VirtualTapeHandle),
}

/// The single tape transport of this process.
pub struct TapeHandle {
    backend: TapeBackend,
    drive_name: String,
    ltfs: LtfsTools,
    rewinds: u64,
    last_position: Option<TapePosition>,
}

/// Opens the configured tape drive.
pub fn open_tape_drive(
    config: &SectionConfigData,
    drive: &str,
    ltfs: LtfsTools,
) -> Result<TapeHandle, Error> {
    let backend = match config.sections.get(drive) {
        Some((section_type_name, config)) => match section_type_name.as_ref() {
            "scsi" => {
                let drive_config = ScsiTapeDrive::deserialize(config)?;
                let mut tape = SgTape::open(&drive_config.path)?;

                // compression on, configured (or variable) block size,
                // drive buffer mode; fails without a loaded medium
                let block_size = drive_config.block_size.unwrap_or(0);
                if let Err(err) =
                    tape.set_drive_options(Some(true), Some(block_size), Some(true))
                {
                    log::warn!("drive '{}': setting drive options failed - {}", drive, err);
                }

                TapeBackend::Scsi {
                    tape,
                    path: drive_config.path,
                }
            }
            "itdt" => {
                let drive_config = ItdtTapeDrive::deserialize(config)?;
                TapeBackend::Itdt(ItdtTape::open(&drive_config))
            }
            "virtual" => {
                let drive_config = VirtualTapeDrive::deserialize(config)?;
                TapeBackend::Virtual(open_virtual_tape_drive(&drive_config)?)
            }
            ty => bail!("unknown drive type '{}' - internal error", ty),
        },
        None => {
            bail!("no such drive '{}'", drive);
        }
    };

    Ok(TapeHandle {
        backend,
        drive_name: drive.to_string(),
        ltfs,
        rewinds: 0,
        last_position: None,
    })
}

impl TapeHandle {
    pub fn drive_name(&self) -> &str {
        &self.drive_name
    }

    /// Device path used for inter-process locking.
    pub fn device_path(&self) -> String {
        match &self.backend {
            TapeBackend::Scsi { path, .. } => path.clone(),
            TapeBackend::Itdt(tape) => tape.device().to_string(),
            TapeBackend::Virtual(handle) => handle.volume_path().display().to_string(),
        }
    }

    fn invalidate_position(&mut self) {
        self.last_position = None;
    }

    /// TEST UNIT READY; `Ok(false)` if no medium is loaded or the
    /// drive is not ready.
    pub fn ready(&mut self) -> Result<bool, TapeError> {
        let backend = &mut self.backend;
        let result = retry_transient("test_unit_ready", || match backend {
            TapeBackend::Scsi { tape, .. } => tape.test_unit_ready(),
            TapeBackend::Itdt(tape) => tape.test_unit_ready(),
            TapeBackend::Virtual(handle) => handle.test_unit_ready(),
        });

        match result {
            Ok(()) => Ok(true),
            Err(TapeError::NotReady { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Poll readiness with a bounded deadline.
    pub fn wait_for_ready(&mut self, timeout_secs: u64) -> Result<(), TapeError> {
        let start = SystemTime::now();
        loop {
            if self.ready()? {
                return Ok(());
            }
            let elapsed = start
                .elapsed()
                .unwrap_or(Duration::from_secs(timeout_secs));
            if elapsed.as_secs() >= timeout_secs {
                return Err(TapeError::NotReady {
                    message: format!("drive not ready after {} s", timeout_secs),
                    becoming_ready: false,
                });
            }
            std::thread::sleep(Duration::from_secs(1));
        }
    }

    pub fn load(&mut self) -> Result<(), TapeError> {
        self.invalidate_position();
        let backend = &mut self.backend;
        retry_transient("load", || match backend {
            TapeBackend::Scsi { tape, .. } => tape.load(),
            TapeBackend::Itdt(tape) => tape.load(),
            TapeBackend::Virtual(handle) => handle.load(),
        })
    }

    pub fn unload(&mut self) -> Result<(), TapeError> {
        self.invalidate_position();
        let backend = &mut self.backend;
        retry_transient("unload", || match backend {
            TapeBackend::Scsi { tape, .. } => tape.eject(),
            TapeBackend::Itdt(tape) => tape.unload(),
            TapeBackend::Virtual(handle) => handle.unload(),
        })
    }

    pub fn rewind(&mut self) -> Result<(), TapeError> {
        self.invalidate_position();
        self.rewinds += 1;
        let backend = &mut self.backend;
        retry_transient("rewind", || match backend {
            TapeBackend::Scsi { tape, .. } => tape.rewind(),
            TapeBackend::Itdt(tape) => tape.rewind(),
            TapeBackend::Virtual(handle) => handle.rewind(),
        })
    }

    pub fn erase(&mut self, fast: bool) -> Result<(), TapeError> {
        self.invalidate_position();
        let backend = &mut self.backend;
        retry_transient("erase", || match backend {
            TapeBackend::Scsi { tape, .. } => tape.erase_media(fast),
            TapeBackend::Itdt(tape) => tape.erase(fast),
            TapeBackend::Virtual(handle) => handle.erase(fast),
        })
    }

    /// Write a fresh LTFS volume carrying `label`.
    ///
    /// Decomposed as rewind, short erase, backend-native format, LTFS
    /// volume creation. Blocks until the drive reports completion
    /// unless `immediate` is set.
    pub fn format(
        &mut self,
        label: &VolumeLabel,
        immediate: bool,
        verify: bool,
    ) -> Result<(), TapeError> {
        self.rewind()?;
        self.erase(true)?;

        self.invalidate_position();
        match &mut self.backend {
            TapeBackend::Scsi { tape, path } => {
                tape.format_media(!verify)?;
                ltfs::make_ltfs_volume(&self.ltfs, path, label)
                    .map_err(|err| TapeError::MediumError(err.to_string()))?;
            }
            TapeBackend::Itdt(tape) => {
                tape.format_tape(immediate, verify)?;
                let device = tape.device().to_string();
                ltfs::make_ltfs_volume(&self.ltfs, &device, label)
                    .map_err(|err| TapeError::MediumError(err.to_string()))?;
            }
            TapeBackend::Virtual(handle) => {
                handle.format_volume(label)?;
            }
        }

        if !immediate {
            self.wait_for_ready(60 * 10)?;
        }

        Ok(())
    }

    /// Path of the mounted volume root (archive destination).
    pub fn volume_path(&self) -> PathBuf {
        match &self.backend {
            TapeBackend::Virtual(handle) => handle.volume_path(),
            _ => PathBuf::from(&self.ltfs.mount_point),
        }
    }

    pub fn mount_volume(&mut self) -> Result<(), TapeError> {
        match &mut self.backend {
            TapeBackend::Virtual(handle) => {
                std::fs::create_dir_all(handle.volume_path())
                    .map_err(|err| TapeError::MediumError(format!("mount failed - {}", err)))?;
                Ok(())
            }
            TapeBackend::Scsi { path, .. } => {
                let device = path.clone();
                if !ltfs::volume_is_mounted(&self.ltfs) {
                    ltfs::mount_volume(&self.ltfs, &device)
                        .map_err(|err| TapeError::MediumError(err.to_string()))?;
                }
                Ok(())
            }
            TapeBackend::Itdt(tape) => {
                let device = tape.device().to_string();
                if !ltfs::volume_is_mounted(&self.ltfs) {
                    ltfs::mount_volume(&self.ltfs, &device)
                        .map_err(|err| TapeError::MediumError(err.to_string()))?;
                }
                Ok(())
            }
        }
    }

    pub fn unmount_volume(&mut self) -> Result<(), TapeError> {
        match &self.backend {
            TapeBackend::Virtual(_) => Ok(()),
            _ => {
                if ltfs::volume_is_mounted(&self.ltfs) {
                    ltfs::unmount_volume(&self.ltfs)
                        .map_err(|err| TapeError::MediumError(err.to_string()))?;
                }
                Ok(())
            }
        }
    }

    /// Read the on-volume label (requires a mounted volume).
    pub fn read_volume_label(
        &mut self,
    ) -> Result<Option<(VolumeLabel, LabelSource)>, TapeError> {
        match &self.backend {
            TapeBackend::Virtual(handle) => Ok(handle
                .read_label()?
                .map(|label| (label, LabelSource::VolumeName))),
            _ => {
                let mount_point = self.ltfs.mount_point.clone();
                ltfs::read_volume_label(&mount_point)
                    .map_err(|err| TapeError::MediumError(err.to_string()))
            }
        }
    }

    /// Stream a local file onto the volume (keeps the file name).
    pub fn write_file(&mut self, local_path: &Path) -> Result<u64, TapeError> {
        let file_name = local_path
            .file_name()
            .ok_or_else(|| TapeError::InvalidCommand("write_file: missing file name".into()))?;

        let volume = self.volume_path();
        match &mut self.backend {
            TapeBackend::Itdt(tape) => {
                let local = local_path.display().to_string();
                tape.write_file(&local)?;
                let len = std::fs::metadata(local_path)
                    .map(|meta| meta.len())
                    .unwrap_or(0);
                Ok(len)
            }
            _ => {
                let dest = volume.join(file_name);
                std::fs::copy(local_path, &dest)
                    .map_err(|err| TapeError::MediumError(format!("write_file - {}", err)))
            }
        }
    }

    /// Stream a file from the volume into a local path.
    pub fn read_file(&mut self, remote_name: &str, local_path: &Path) -> Result<u64, TapeError> {
        let volume = self.volume_path();
        match &mut self.backend {
            TapeBackend::Itdt(tape) => {
                let local = local_path.display().to_string();
                tape.read_file(&local, None)?;
                let len = std::fs::metadata(local_path)
                    .map(|meta| meta.len())
                    .unwrap_or(0);
                Ok(len)
            }
            _ => {
                let src = volume.join(remote_name);
                std::fs::copy(&src, local_path)
                    .map_err(|err| TapeError::MediumError(format!("read_file - {}", err)))
            }
        }
    }

    pub fn write_filemark(&mut self, count: usize) -> Result<(), TapeError> {
        self.invalidate_position();
        match &mut self.backend {
            TapeBackend::Scsi { tape, .. } => tape.write_filemarks(count, false),
            TapeBackend::Itdt(tape) => tape.write_filemarks(count),
            TapeBackend::Virtual(handle) => handle.write_filemarks(count),
        }
    }

    pub fn space_filemarks(&mut self, count: isize) -> Result<(), TapeError> {
        self.invalidate_position();
        match &mut self.backend {
            TapeBackend::Scsi { tape, .. } => tape.space_filemarks(count),
            TapeBackend::Itdt(tape) => tape.space_filemarks(count),
            TapeBackend::Virtual(handle) => handle.space_filemarks(count),
        }
    }

    pub fn space_records(&mut self, count: isize) -> Result<(), TapeError> {
        self.invalidate_position();
        match &mut self.backend {
            TapeBackend::Scsi { tape, .. } => tape.space_blocks(count),
            TapeBackend::Itdt(tape) => tape.space_records(count),
            TapeBackend::Virtual(handle) => handle.space_records(count),
        }
    }

    /// Current position as advertised by the drive.
    pub fn position(&mut self) -> Result<TapePosition, TapeError> {
        let backend = &mut self.backend;
        let position = retry_transient("read position", || match backend {
            TapeBackend::Scsi { tape, .. } => tape.position(),
            TapeBackend::Itdt(tape) => tape.position(),
            TapeBackend::Virtual(handle) => handle.position(),
        })?;

        self.last_position = Some(position);
        Ok(position)
    }

    /// Position cached from the last query; valid until the next
    /// tape-moving operation.
    pub fn last_known_position(&self) -> Option<TapePosition> {
        self.last_position
    }

    pub fn device_info(&mut self) -> Result<DeviceInfo, TapeError> {
        match &mut self.backend {
            TapeBackend::Scsi { tape, .. } => {
                let generation = match tape.read_drive_status() {
                    Ok(status) => tvs_api_types::TapeDensity::try_from(status.density_code).ok(),
                    Err(_) => None,
                };
                let info = tape.info();
                Ok(DeviceInfo {
                    vendor: info.vendor.clone(),
                    product: info.product.clone(),
                    firmware: info.revision.clone(),
                    serial: None,
                    generation,
                    native_capacity: generation.and_then(|g| g.native_capacity()),
                })
            }
            TapeBackend::Itdt(tape) => {
                let info = tape.device_info()?;
                Ok(DeviceInfo {
                    vendor: info.vendor,
                    product: info.product,
                    firmware: info.revision,
                    serial: Some(info.serial),
                    generation: None,
                    native_capacity: None,
                })
            }
            TapeBackend::Virtual(handle) => handle.device_info(),
        }
    }

    /// Current TapeAlert flags.
    ///
    /// Only the SCSI path can read the non-clearing TapeAlert response
    /// page; the other back-ends report no alerts.
    pub fn tape_alert(&mut self) -> Result<TapeAlertFlags, TapeError> {
        match &mut self.backend {
            TapeBackend::Scsi { tape, .. } => tape.tape_alert_flags(),
            _ => Ok(TapeAlertFlags::empty()),
        }
    }

    pub fn performance_counters(&mut self) -> Result<PerformanceCounters, TapeError> {
        let mut counters = match &mut self.backend {
            TapeBackend::Scsi { tape, .. } => {
                let stats = tape
                    .volume_statistics()
                    .map_err(|err| TapeError::HardwareError(err.to_string()))?;
                PerformanceCounters {
                    mounts: stats.volume_mounts,
                    rewinds: 0,
                    mb_written: stats.lifetime_bytes_written / 1_000_000,
                    mb_read: stats.lifetime_bytes_read / 1_000_000,
                }
            }
            TapeBackend::Itdt(_) => PerformanceCounters::default(),
            TapeBackend::Virtual(handle) => handle.performance_counters()?,
        };

        counters.rewinds += self.rewinds;
        Ok(counters)
    }

    /// Opaque diagnostic snapshot for the cartridge health record.
    pub fn health_snapshot(&mut self) -> Result<String, TapeError> {
        match &mut self.backend {
            TapeBackend::Scsi { tape, .. } => tape
                .receive_diagnostic(0)
                .map_err(|err| TapeError::HardwareError(err.to_string())),
            TapeBackend::Itdt(tape) => tape.logsense(),
            TapeBackend::Virtual(_) => Ok(String::from("virtual drive - no diagnostics")),
        }
    }

    /// Toggle drive-level hardware encryption; the key blob is passed
    /// through opaquely (32 byte AES-256 key).
    pub fn set_encryption(&mut self, enabled: bool, key: Option<&[u8]>) -> Result<(), TapeError> {
        match &mut self.backend {
            TapeBackend::Scsi { tape, .. } => {
                let key = if enabled {
                    let blob = key.ok_or_else(|| {
                        TapeError::ConfigError("encryption enabled without key".into())
                    })?;
                    let key: [u8; 32] = blob.try_into().map_err(|_| {
                        TapeError::ConfigError("encryption key must be 32 bytes".into())
                    })?;
                    Some(key)
                } else {
                    None
                };
                tape.set_encryption(key)
            }
            _ if !enabled => Ok(()),
            _ => Err(TapeError::InvalidCommand(
                "hardware encryption requires the scsi backend".into(),
            )),
        }
    }

    pub fn set_worm(&mut self, enabled: bool) -> Result<(), TapeError> {
        match &mut self.backend {
            TapeBackend::Scsi { tape, .. } => tape.set_worm(enabled),
            _ if !enabled => Ok(()),
            _ => Err(TapeError::InvalidCommand(
                "WORM mode requires the scsi backend".into(),
            )),
        }
    }
}
