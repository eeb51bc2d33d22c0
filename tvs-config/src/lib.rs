pub mod drive;
pub mod plan;
pub mod service;

use anyhow::{format_err, Error};
use nix::unistd::{Gid, Group, Uid, User};

/// User account the service runs as.
pub const SERVICE_USER_NAME: &str = "tapevault";
/// Group of the service user.
pub const SERVICE_GROUP_NAME: &str = "tapevault";

/// Return user info for the service user (``getpwnam_r(3)``)
pub fn service_user() -> Result<nix::unistd::User, Error> {
    if cfg!(test) {
        Ok(User::from_uid(Uid::current())?.expect("current user does not exist"))
    } else {
        User::from_name(SERVICE_USER_NAME)?
            .ok_or_else(|| format_err!("Unable to lookup '{}' user.", SERVICE_USER_NAME))
    }
}

/// Return group info for the service group (``getgrnam(3)``)
pub fn service_group() -> Result<nix::unistd::Group, Error> {
    if cfg!(test) {
        Ok(Group::from_gid(Gid::current())?.expect("current group does not exist"))
    } else {
        Group::from_name(SERVICE_GROUP_NAME)?
            .ok_or_else(|| format_err!("Unable to lookup '{}' group.", SERVICE_GROUP_NAME))
    }
}

pub struct ConfigLockGuard(Option<std::fs::File>);

/// Open or create a lock file owned by the service user and lock it.
///
/// File mode is 0660, default timeout 10 seconds.
pub fn open_config_lockfile<P: AsRef<std::path::Path>>(
    path: P,
    timeout: Option<std::time::Duration>,
    exclusive: bool,
) -> Result<ConfigLockGuard, Error> {
    let user = service_user()?;
    let options = proxmox_sys::fs::CreateOptions::new()
        .perm(nix::sys::stat::Mode::from_bits_truncate(0o660))
        .owner(user.uid)
        .group(user.gid);

    let timeout = timeout.unwrap_or(std::time::Duration::new(10, 0));

    let file = proxmox_sys::fs::open_file_locked(&path, timeout, exclusive, options)?;
    Ok(ConfigLockGuard(Some(file)))
}

/// Atomically write a config file owned by the service user (mode 0640).
pub fn replace_config<P: AsRef<std::path::Path>>(path: P, data: &[u8]) -> Result<(), Error> {
    let user = service_user()?;
    let options = proxmox_sys::fs::CreateOptions::new()
        .perm(nix::sys::stat::Mode::from_bits_truncate(0o640))
        .owner(nix::unistd::ROOT)
        .group(user.gid);

    proxmox_sys::fs::replace_file(path, data, options, true)?;
    Ok(())
}

/// Atomically write a state file owned by the service user (mode 0644).
pub fn replace_state_file<P: AsRef<std::path::Path>>(path: P, data: &[u8]) -> Result<(), Error> {
    let user = service_user()?;
    let options = proxmox_sys::fs::CreateOptions::new()
        .perm(nix::sys::stat::Mode::from_bits_truncate(0o644))
        .owner(user.uid)
        .group(user.gid);

    proxmox_sys::fs::replace_file(path, data, options, false)?;
    Ok(())
}
