//! Tape drive configuration
//!
//! This configuration module is based on [`SectionConfig`], and
//! provides a type safe interface to store [`ScsiTapeDrive`],
//! [`ItdtTapeDrive`] and [`VirtualTapeDrive`] configurations.
//!
//! The `scsi` and `itdt` backends are mutually exclusive for one
//! drive; [`VirtualTapeDrive`] is only useful for testing.
//!
//! [ScsiTapeDrive]: tvs_api_types::ScsiTapeDrive
//! [ItdtTapeDrive]: tvs_api_types::ItdtTapeDrive
//! [VirtualTapeDrive]: tvs_api_types::VirtualTapeDrive

use std::collections::HashMap;

use anyhow::{bail, Error};
use lazy_static::lazy_static;

use proxmox_schema::*;
use proxmox_section_config::{SectionConfig, SectionConfigData, SectionConfigPlugin};

use tvs_api_types::{ItdtTapeDrive, ScsiTapeDrive, VirtualTapeDrive, DRIVE_NAME_SCHEMA};

use crate::{open_config_lockfile, replace_config, ConfigLockGuard};

lazy_static! {
    /// Static [`SectionConfig`] to access parser/writer functions.
    pub static ref CONFIG: SectionConfig = init();
}

fn init() -> SectionConfig {
    let mut config = SectionConfig::new(&DRIVE_NAME_SCHEMA);

    let obj_schema = match ScsiTapeDrive::API_SCHEMA {
        Schema::Object(ref obj_schema) => obj_schema,
        _ => unreachable!(),
    };
    let plugin = SectionConfigPlugin::new("scsi".to_string(), Some("name".to_string()), obj_schema);
    config.register_plugin(plugin);

    let obj_schema = match ItdtTapeDrive::API_SCHEMA {
        Schema::Object(ref obj_schema) => obj_schema,
        _ => unreachable!(),
    };
    let plugin = SectionConfigPlugin::new("itdt".to_string(), Some("name".to_string()), obj_schema);
    config.register_plugin(plugin);

    let obj_schema = match VirtualTapeDrive::API_SCHEMA {
        Schema::Object(ref obj_schema) => obj_schema,
        _ => unreachable!(),
    };
    let plugin =
        SectionConfigPlugin::new("virtual".to_string(), Some("name".to_string()), obj_schema);
    config.register_plugin(plugin);

    config
}

/// Configuration file name
pub const DRIVE_CFG_FILENAME: &str = "/etc/tapevault/tape.cfg";
/// Lock file name (used to prevent concurrent access)
pub const DRIVE_CFG_LOCKFILE: &str = "/etc/tapevault/.tape.lck";

/// Get exclusive lock
pub fn lock() -> Result<ConfigLockGuard, Error> {
    open_config_lockfile(DRIVE_CFG_LOCKFILE, None, true)
}

/// Read and parse the configuration file
pub fn config() -> Result<SectionConfigData, Error> {
    let content =
        proxmox_sys::fs::file_read_optional_string(DRIVE_CFG_FILENAME)?.unwrap_or_default();

    let data = CONFIG.parse(DRIVE_CFG_FILENAME, &content)?;
    Ok(data)
}

/// Save the configuration file
pub fn save_config(config: &SectionConfigData) -> Result<(), Error> {
    let raw = CONFIG.write(DRIVE_CFG_FILENAME, config)?;
    replace_config(DRIVE_CFG_FILENAME, raw.as_bytes())
}

/// Check if the specified drive name exists in the config.
pub fn check_drive_exists(config: &SectionConfigData, drive: &str) -> Result<(), Error> {
    match config.sections.get(drive) {
        Some((section_type, _)) => {
            if !(section_type == "scsi" || section_type == "itdt" || section_type == "virtual") {
                bail!("Entry '{}' exists, but is not a tape drive", drive);
            }
        }
        None => bail!("Drive '{}' does not exist", drive),
    }
    Ok(())
}

// shell completion helper

/// List all drive names
pub fn complete_drive_name(_arg: &str, _param: &HashMap<String, String>) -> Vec<String> {
    match config() {
        Ok(data) => data.sections.keys().map(|id| id.to_string()).collect(),
        Err(_) => Vec::new(),
    }
}
