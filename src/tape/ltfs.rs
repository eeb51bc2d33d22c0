//! LTFS volume helpers.
//!
//! The archive data path goes through LTFS file I/O on a mounted
//! volume. Volume creation and mounting are delegated to the LTFS
//! reference tools (`mkltfs`, `ltfs`), wrapped the same way as any
//! other external tape tool.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use anyhow::{bail, format_err, Error};

use proxmox_sys::command::run_command;

use tvs_api_types::VolumeLabel;

/// Extended attribute carrying the LTFS volume name on the mount root.
const LTFS_VOLUME_NAME_XATTR: &str = "user.ltfs.volumeName";

/// Legacy label file some old installations carry at the volume root.
/// Read-only fallback; never written.
pub const LEGACY_LABEL_FILE: &str = ".TAPE_LABEL.txt";

/// Where a volume label was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelSource {
    /// LTFS volume-name attribute
    VolumeName,
    /// Legacy `.TAPE_LABEL.txt` file (operators should migrate)
    LegacyFile,
}

/// External LTFS tool locations plus the configured mount point.
#[derive(Debug, Clone)]
pub struct LtfsTools {
    pub mkltfs_path: String,
    pub ltfs_path: String,
    pub mount_point: String,
}

impl Default for LtfsTools {
    fn default() -> Self {
        Self {
            mkltfs_path: "/usr/bin/mkltfs".to_string(),
            ltfs_path: "/usr/bin/ltfs".to_string(),
            mount_point: "/mnt/tapevault".to_string(),
        }
    }
}

fn getxattr(path: &Path, name: &str) -> Result<Vec<u8>, nix::errno::Errno> {
    let path = CString::new(path.as_os_str().as_bytes()).map_err(|_| nix::errno::Errno::EINVAL)?;
    let name = CString::new(name.as_bytes()).map_err(|_| nix::errno::Errno::EINVAL)?;

    let mut buffer = vec![0u8; 256];
    let res = unsafe {
        libc::getxattr(
            path.as_ptr(),
            name.as_ptr(),
            buffer.as_mut_ptr() as *mut libc::c_void,
            buffer.len(),
        )
    };

    if res < 0 {
        return Err(nix::errno::Errno::last());
    }

    buffer.truncate(res as usize);
    Ok(buffer)
}

/// Read the volume label from a mounted LTFS volume.
///
/// Prefers the LTFS volume-name attribute; falls back to the legacy
/// `.TAPE_LABEL.txt` file. Returns `None` for unlabeled volumes.
pub fn read_volume_label(mount_point: &str) -> Result<Option<(VolumeLabel, LabelSource)>, Error> {
    let root = Path::new(mount_point);

    match getxattr(root, LTFS_VOLUME_NAME_XATTR) {
        Ok(data) => {
            let text = String::from_utf8_lossy(&data).trim().to_string();
            if !text.is_empty() {
                let label = text.parse().map_err(|err| {
                    format_err!("volume carries invalid label '{}' - {}", text, err)
                })?;
                return Ok(Some((label, LabelSource::VolumeName)));
            }
        }
        Err(nix::errno::Errno::ENODATA) | Err(nix::errno::Errno::EOPNOTSUPP) => { /* fall through */ }
        Err(err) => bail!("reading volume name attribute failed - {}", err),
    }

    let legacy_path = root.join(LEGACY_LABEL_FILE);
    if let Some(text) = proxmox_sys::fs::file_read_optional_string(&legacy_path)? {
        let text = text.trim();
        if !text.is_empty() {
            let label = text
                .parse()
                .map_err(|err| format_err!("legacy label file contains '{}' - {}", text, err))?;
            return Ok(Some((label, LabelSource::LegacyFile)));
        }
    }

    Ok(None)
}

/// Create an LTFS volume on the loaded cartridge with the given label.
pub fn make_ltfs_volume(tools: &LtfsTools, device: &str, label: &VolumeLabel) -> Result<(), Error> {
    let label_text = label.to_string();

    let mut command = std::process::Command::new(&tools.mkltfs_path);
    command.args(["-d", device, "-n", &label_text, "-f"]);

    run_command(command, None)
        .map_err(|err| format_err!("mkltfs for label {} failed - {}", label_text, err))?;

    Ok(())
}

/// Mount the LTFS volume at the configured mount point.
pub fn mount_volume(tools: &LtfsTools, device: &str) -> Result<(), Error> {
    std::fs::create_dir_all(&tools.mount_point)?;

    let mut command = std::process::Command::new(&tools.ltfs_path);
    command.arg(&tools.mount_point);
    command.arg("-o");
    command.arg(format!("devname={}", device));

    run_command(command, None)
        .map_err(|err| format_err!("mounting LTFS volume failed - {}", err))?;

    Ok(())
}

/// Unmount the LTFS volume.
pub fn unmount_volume(tools: &LtfsTools) -> Result<(), Error> {
    let mut command = std::process::Command::new("umount");
    command.arg(&tools.mount_point);

    run_command(command, None)
        .map_err(|err| format_err!("unmounting LTFS volume failed - {}", err))?;

    Ok(())
}

/// True if something is mounted at the configured mount point.
pub fn volume_is_mounted(tools: &LtfsTools) -> bool {
    let mount_point = Path::new(&tools.mount_point);

    let mount_stat = match nix::sys::stat::stat(mount_point) {
        Ok(stat) => stat,
        Err(_) => return false,
    };
    let parent = match mount_point.parent() {
        Some(parent) => parent,
        None => return false,
    };
    let parent_stat = match nix::sys::stat::stat(parent) {
        Ok(stat) => stat,
        Err(_) => return false,
    };

    mount_stat.st_dev != parent_stat.st_dev
}
