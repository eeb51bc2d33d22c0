//! Tape transport enumeration.
//!
//! Walks `/sys/class/scsi_generic` and uses udev properties to find
//! tape drives (SCSI peripheral type 1) and media changers (type 8).

use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Error};
use nix::fcntl::{fcntl, FcntlArg, OFlag};

use proxmox_sys::error::SysResult;
use proxmox_sys::fs::scan_subdir;

use tvs_api_types::{DeviceKind, TapeDeviceInfo};

lazy_static::lazy_static! {
    static ref SCSI_GENERIC_NAME_REGEX: regex::Regex =
        regex::Regex::new(r"^sg\d+$").unwrap();
}

fn udev_property(device: &udev::Device, name: &str) -> Option<String> {
    device
        .property_value(name)
        .map(std::ffi::OsString::from)
        .and_then(|s| s.into_string().ok())
}

fn scan_scsi_generic_class(scsi_type: &str, kind: DeviceKind) -> Vec<TapeDeviceInfo> {
    let mut list = Vec::new();

    let dir_iter = match scan_subdir(
        libc::AT_FDCWD,
        "/sys/class/scsi_generic",
        &SCSI_GENERIC_NAME_REGEX,
    ) {
        Err(_) => return list,
        Ok(iter) => iter,
    };

    for item in dir_iter {
        let item = match item {
            Err(_) => continue,
            Ok(item) => item,
        };

        let name = match item.file_name().to_str() {
            Some(name) => name.to_string(),
            None => continue,
        };

        let mut sys_path = PathBuf::from("/sys/class/scsi_generic");
        sys_path.push(&name);

        let device = match udev::Device::from_syspath(&sys_path) {
            Err(_) => continue,
            Ok(device) => device,
        };

        let devnum = match device.devnum() {
            None => continue,
            Some(devnum) => devnum,
        };

        let parent = match device.parent() {
            None => continue,
            Some(parent) => parent,
        };

        match parent.attribute_value("type") {
            Some(type_osstr) => {
                if type_osstr != scsi_type {
                    continue;
                }
            }
            _ => {
                continue;
            }
        }

        if device.devnode().map(Path::to_owned).is_none() {
            continue;
        }

        let serial = match udev_property(&device, "ID_SCSI_SERIAL") {
            None => continue,
            Some(serial) => serial,
        };

        let vendor =
            udev_property(&device, "ID_VENDOR").unwrap_or_else(|| String::from("unknown"));

        let product =
            udev_property(&device, "ID_MODEL").unwrap_or_else(|| String::from("unknown"));

        let revision = udev_property(&device, "ID_REVISION");

        // SCSI address "host:bus:target:lun" from the parent sysname
        let scsi_addr = parent
            .sysname()
            .to_str()
            .map(|addr| addr.replace(':', "-"));

        let dev_path = match kind {
            DeviceKind::Tape => format!("/dev/tape/by-id/scsi-{}-sg", serial),
            DeviceKind::Changer => format!("/dev/tape/by-id/scsi-{}", serial),
        };

        if PathBuf::from(&dev_path).exists() {
            list.push(TapeDeviceInfo {
                kind,
                path: dev_path,
                serial,
                vendor,
                product,
                revision,
                scsi_addr,
                major: unsafe { libc::major(devnum) },
                minor: unsafe { libc::minor(devnum) },
            });
        }
    }

    list
}

/// List tape drives (SCSI peripheral type 1)
pub fn tape_device_list() -> Vec<TapeDeviceInfo> {
    scan_scsi_generic_class("1", DeviceKind::Tape)
}

/// List media changers (SCSI peripheral type 8)
pub fn changer_device_list() -> Vec<TapeDeviceInfo> {
    scan_scsi_generic_class("8", DeviceKind::Changer)
}

/// Enumerate all available tape transports (drives and libraries)
pub fn scan_tape_devices() -> Vec<TapeDeviceInfo> {
    let mut list = tape_device_list();
    list.extend(changer_device_list());
    list
}

/// Test if a device exists, and return the associated `TapeDeviceInfo`
pub fn lookup_device<'a>(devices: &'a [TapeDeviceInfo], path: &str) -> Option<&'a TapeDeviceInfo> {
    if let Ok(stat) = nix::sys::stat::stat(path) {
        let major = unsafe { libc::major(stat.st_rdev) };
        let minor = unsafe { libc::minor(stat.st_rdev) };

        devices
            .iter()
            .find(|d| d.major == major && d.minor == minor)
    } else {
        None
    }
}

/// Make sure the path is a SCSI-generic tape device
pub fn check_drive_path(drives: &[TapeDeviceInfo], path: &str) -> Result<(), Error> {
    if lookup_device(drives, path).is_none() {
        bail!("path '{}' is not a SCSI-generic tape device", path);
    }
    Ok(())
}

/// Check for correct major/minor numbers
pub fn check_tape_is_sg_device(file: &File) -> Result<(), Error> {
    let stat = nix::sys::stat::fstat(file.as_raw_fd())?;

    let devnum = stat.st_rdev;

    let major = unsafe { libc::major(devnum) };

    if major == 9 {
        bail!("not a scsi-generic tape device (cannot use linux tape devices)");
    }

    if major != 21 {
        bail!("not a scsi-generic tape device");
    }

    Ok(())
}

/// Opens a SCSI-generic tape device
///
/// The open call uses O_NONBLOCK, but that flag is cleared after open
/// succeeded. This also checks the device type.
pub fn open_sg_tape_device(path: &str) -> Result<File, Error> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)?;

    // clear O_NONBLOCK from now on.

    let flags = fcntl(file.as_raw_fd(), FcntlArg::F_GETFL).into_io_result()?;

    let mut flags = OFlag::from_bits_truncate(flags);
    flags.remove(OFlag::O_NONBLOCK);

    fcntl(file.as_raw_fd(), FcntlArg::F_SETFL(flags)).into_io_result()?;

    check_tape_is_sg_device(&file)
        .map_err(|err| format_err!("device type check {:?} failed - {}", path, err))?;

    Ok(file)
}
