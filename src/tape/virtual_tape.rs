// Note: This is only for test and debug

use std::fs::File;
use std::path::PathBuf;

use anyhow::{format_err, Error};
use serde::{Deserialize, Serialize};

use proxmox_sys::fs::{replace_file, CreateOptions};

use tvs_api_types::{
    DeviceInfo, PerformanceCounters, TapeDensity, TapeError, TapePosition, VirtualTapeDrive,
    VolumeLabel,
};

/// This needs to lock the backing directory
pub fn open_virtual_tape_drive(config: &VirtualTapeDrive) -> Result<VirtualTapeHandle, Error> {
    proxmox_lang::try_block!({
        let path = PathBuf::from(&config.path);
        std::fs::create_dir_all(&path)?;

        let mut lock_path = path.clone();
        lock_path.push(".drive.lck");

        let options = CreateOptions::new();
        let timeout = std::time::Duration::new(10, 0);
        let lock = proxmox_sys::fs::open_file_locked(&lock_path, timeout, true, options)?;

        Ok(VirtualTapeHandle {
            _lock: lock,
            max_size: config.max_size.unwrap_or(64 * 1024 * 1024),
            path,
        })
    })
    .map_err(|err: Error| {
        format_err!(
            "open drive '{}' ({}) failed - {}",
            config.name,
            config.path,
            err
        )
    })
}

#[derive(Serialize, Deserialize, Default)]
struct VirtualDriveStatus {
    /// Medium loaded
    loaded: bool,
    /// Current volume label, written at format time
    label: Option<String>,
    /// Logical position (block count)
    position: u64,
    /// Filemark count
    filemarks: u64,
    /// Mount counter
    mounts: u64,
}

pub struct VirtualTapeHandle {
    path: PathBuf,
    max_size: usize,
    _lock: File,
}

fn io_err(err: Error) -> TapeError {
    TapeError::MediumError(err.to_string())
}

impl VirtualTapeHandle {
    fn status_file_path(&self) -> PathBuf {
        let mut path = self.path.clone();
        path.push("drive-status.json");
        path
    }

    /// Directory that plays the role of the mounted LTFS volume.
    pub fn volume_path(&self) -> PathBuf {
        let mut path = self.path.clone();
        path.push("volume");
        path
    }

    fn load_status(&self) -> Result<VirtualDriveStatus, Error> {
        let path = self.status_file_path();

        let default = serde_json::to_value(VirtualDriveStatus::default())?;

        let data = proxmox_sys::fs::file_get_json(path, Some(default))?;
        let status: VirtualDriveStatus = serde_json::from_value(data)?;
        Ok(status)
    }

    fn store_status(&self, status: &VirtualDriveStatus) -> Result<(), Error> {
        let path = self.status_file_path();
        let raw = serde_json::to_string_pretty(&serde_json::to_value(status)?)?;

        let options = CreateOptions::new();
        replace_file(path, raw.as_bytes(), options, false)?;
        Ok(())
    }

    fn with_loaded<T>(
        &self,
        what: &str,
        update: impl FnOnce(&mut VirtualDriveStatus) -> T,
    ) -> Result<T, TapeError> {
        let mut status = self.load_status().map_err(io_err)?;
        if !status.loaded {
            return Err(TapeError::NotReady {
                message: format!("{} failed - no medium loaded", what),
                becoming_ready: false,
            });
        }
        let result = update(&mut status);
        self.store_status(&status).map_err(io_err)?;
        Ok(result)
    }

    pub fn test_unit_ready(&mut self) -> Result<(), TapeError> {
        let status = self.load_status().map_err(io_err)?;
        if !status.loaded {
            return Err(TapeError::NotReady {
                message: "no medium loaded".to_string(),
                becoming_ready: false,
            });
        }
        Ok(())
    }

    pub fn load(&mut self) -> Result<(), TapeError> {
        let mut status = self.load_status().map_err(io_err)?;
        status.loaded = true;
        status.position = 0;
        status.mounts += 1;
        self.store_status(&status).map_err(io_err)
    }

    pub fn unload(&mut self) -> Result<(), TapeError> {
        let mut status = self.load_status().map_err(io_err)?;
        status.loaded = false;
        status.position = 0;
        self.store_status(&status).map_err(io_err)
    }

    pub fn rewind(&mut self) -> Result<(), TapeError> {
        self.with_loaded("rewind", |status| {
            status.position = 0;
        })
    }

    pub fn erase(&mut self, _fast: bool) -> Result<(), TapeError> {
        self.with_loaded("erase", |status| {
            status.position = 0;
            status.filemarks = 0;
            status.label = None;
        })?;

        let volume = self.volume_path();
        if volume.exists() {
            std::fs::remove_dir_all(&volume)
                .map_err(|err| TapeError::MediumError(format!("erase failed - {}", err)))?;
        }
        Ok(())
    }

    /// Erase and create a fresh empty volume carrying `label`.
    pub fn format_volume(&mut self, label: &VolumeLabel) -> Result<(), TapeError> {
        self.erase(true)?;

        let volume = self.volume_path();
        std::fs::create_dir_all(&volume)
            .map_err(|err| TapeError::MediumError(format!("format failed - {}", err)))?;

        self.with_loaded("format", |status| {
            status.label = Some(label.to_string());
        })
    }

    pub fn read_label(&self) -> Result<Option<VolumeLabel>, TapeError> {
        let status = self.load_status().map_err(io_err)?;
        match status.label {
            Some(text) => {
                let label = text
                    .parse()
                    .map_err(|err| TapeError::MediumError(format!("bad volume label - {}", err)))?;
                Ok(Some(label))
            }
            None => Ok(None),
        }
    }

    pub fn write_filemarks(&mut self, count: usize) -> Result<(), TapeError> {
        self.with_loaded("write filemarks", |status| {
            status.filemarks += count as u64;
            status.position += count as u64;
        })
    }

    pub fn space_filemarks(&mut self, count: isize) -> Result<(), TapeError> {
        self.space_records(count)
    }

    pub fn space_records(&mut self, count: isize) -> Result<(), TapeError> {
        self.with_loaded("space", |status| {
            if count < 0 {
                status.position = status.position.saturating_sub((-count) as u64);
            } else {
                status.position += count as u64;
            }
        })
    }

    pub fn position(&mut self) -> Result<TapePosition, TapeError> {
        let status = self.load_status().map_err(io_err)?;
        if !status.loaded {
            return Err(TapeError::NotReady {
                message: "no medium loaded".to_string(),
                becoming_ready: false,
            });
        }
        Ok(TapePosition {
            partition: 0,
            logical_block: status.position,
            at_bop: status.position == 0,
            at_eop: false,
        })
    }

    pub fn device_info(&mut self) -> Result<DeviceInfo, TapeError> {
        Ok(DeviceInfo {
            vendor: "TAPEVAULT".to_string(),
            product: "VIRTUAL-TAPE".to_string(),
            firmware: "0000".to_string(),
            serial: Some("000000000".to_string()),
            generation: Some(TapeDensity::Unknown),
            native_capacity: Some(self.max_size as u64),
        })
    }

    pub fn performance_counters(&mut self) -> Result<PerformanceCounters, TapeError> {
        let status = self.load_status().map_err(io_err)?;
        Ok(PerformanceCounters {
            mounts: status.mounts,
            rewinds: 0,
            mb_written: 0,
            mb_read: 0,
        })
    }
}
