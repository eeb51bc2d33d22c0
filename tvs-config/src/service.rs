//! Process-wide service configuration.
//!
//! Loaded once at startup; read-only afterwards.

use anyhow::Error;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use proxmox_schema::{api, ApiType, IntegerSchema, Schema, StringSchema};
use proxmox_section_config::{SectionConfig, SectionConfigData, SectionConfigPlugin};

use tvs_api_types::{DRIVE_NAME_SCHEMA, TAPEVAULT_SAFE_ID_FORMAT};

use crate::{open_config_lockfile, replace_config, ConfigLockGuard};

pub const CHECK_INTERVAL_SCHEMA: Schema =
    IntegerSchema::new("Scheduler tick interval in seconds.")
        .minimum(1)
        .maximum(60)
        .default(60)
        .schema();

pub const SHUTDOWN_GRACE_SCHEMA: Schema = IntegerSchema::new(
    "Seconds a running backup task may drain on shutdown before it is force-aborted.",
)
.minimum(0)
.default(300)
.schema();

pub const LTFS_MOUNT_POINT_SCHEMA: Schema =
    StringSchema::new("Mount point for the LTFS volume.")
        .default("/mnt/tapevault")
        .schema();

#[api(
    properties: {
        drive: {
            schema: DRIVE_NAME_SCHEMA,
        },
        "check-interval": {
            schema: CHECK_INTERVAL_SCHEMA,
            optional: true,
        },
        "shutdown-grace": {
            schema: SHUTDOWN_GRACE_SCHEMA,
            optional: true,
        },
        "mount-point": {
            schema: LTFS_MOUNT_POINT_SCHEMA,
            optional: true,
        },
    },
)]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// Global service options.
pub struct ServiceConfig {
    /// Name of the drive section in tape.cfg used by this service
    pub drive: String,
    /// Scheduler tick interval (seconds)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub check_interval: Option<u64>,
    /// Default retention for plans without an own setting (months)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_months: Option<u32>,
    /// Erase expired cartridges during the retention sweep
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_erase_expired: Option<bool>,
    /// Ceiling per cartridge in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_volume_bytes: Option<u64>,
    /// Compress archives with gzip
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compress: Option<bool>,
    /// Mount point for the LTFS volume
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mount_point: Option<String>,
    /// Location of the mkltfs binary
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mkltfs_path: Option<String>,
    /// Location of the ltfs binary
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ltfs_path: Option<String>,
    /// Shutdown drain grace (seconds)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown_grace: Option<u64>,
}

impl ServiceConfig {
    pub fn check_interval(&self) -> u64 {
        self.check_interval.unwrap_or(60)
    }

    pub fn retention_months(&self) -> u32 {
        self.retention_months.unwrap_or(12)
    }

    pub fn compress(&self) -> bool {
        self.compress.unwrap_or(false)
    }

    pub fn mount_point(&self) -> &str {
        self.mount_point.as_deref().unwrap_or("/mnt/tapevault")
    }

    pub fn shutdown_grace(&self) -> u64 {
        self.shutdown_grace.unwrap_or(300)
    }
}

pub const SERVICE_SECTION_ID_SCHEMA: Schema = StringSchema::new("Section name.")
    .format(&TAPEVAULT_SAFE_ID_FORMAT)
    .schema();

lazy_static! {
    pub static ref CONFIG: SectionConfig = init();
}

fn init() -> SectionConfig {
    let obj_schema = match ServiceConfig::API_SCHEMA {
        Schema::Object(ref obj_schema) => obj_schema,
        _ => unreachable!(),
    };

    let plugin = SectionConfigPlugin::new("service".to_string(), None, obj_schema);
    let mut config = SectionConfig::new(&SERVICE_SECTION_ID_SCHEMA);
    config.register_plugin(plugin);

    config
}

pub const SERVICE_CFG_FILENAME: &str = "/etc/tapevault/service.cfg";
pub const SERVICE_CFG_LOCKFILE: &str = "/etc/tapevault/.service.lck";

/// Get exclusive lock
pub fn lock() -> Result<ConfigLockGuard, Error> {
    open_config_lockfile(SERVICE_CFG_LOCKFILE, None, true)
}

pub fn config() -> Result<SectionConfigData, Error> {
    let content =
        proxmox_sys::fs::file_read_optional_string(SERVICE_CFG_FILENAME)?.unwrap_or_default();

    let data = CONFIG.parse(SERVICE_CFG_FILENAME, &content)?;
    Ok(data)
}

pub fn save_config(config: &SectionConfigData) -> Result<(), Error> {
    let raw = CONFIG.write(SERVICE_CFG_FILENAME, config)?;
    replace_config(SERVICE_CFG_FILENAME, raw.as_bytes())
}

/// Load the single `service` section (section name 'main').
pub fn service_config() -> Result<ServiceConfig, Error> {
    use serde::Deserialize as _;

    let data = config()?;
    match data.sections.get("main") {
        Some((_section_type, section)) => Ok(ServiceConfig::deserialize(section)?),
        None => anyhow::bail!("missing 'service: main' section in {}", SERVICE_CFG_FILENAME),
    }
}
