use std::collections::HashMap;

use anyhow::Error;
use lazy_static::lazy_static;

use proxmox_schema::{ApiType, Schema};
use proxmox_section_config::{SectionConfig, SectionConfigData, SectionConfigPlugin};

use tvs_api_types::{BackupPlanConfig, PLAN_ID_SCHEMA};

use crate::{open_config_lockfile, replace_config, ConfigLockGuard};

lazy_static! {
    pub static ref CONFIG: SectionConfig = init();
}

fn init() -> SectionConfig {
    let obj_schema = match BackupPlanConfig::API_SCHEMA {
        Schema::Object(ref obj_schema) => obj_schema,
        _ => unreachable!(),
    };

    let plugin = SectionConfigPlugin::new("plan".to_string(), Some(String::from("id")), obj_schema);
    let mut config = SectionConfig::new(&PLAN_ID_SCHEMA);
    config.register_plugin(plugin);

    config
}

pub const PLAN_CFG_FILENAME: &str = "/etc/tapevault/plan.cfg";
pub const PLAN_CFG_LOCKFILE: &str = "/etc/tapevault/.plan.lck";

/// Get exclusive lock
pub fn lock() -> Result<ConfigLockGuard, Error> {
    open_config_lockfile(PLAN_CFG_LOCKFILE, None, true)
}

pub fn config() -> Result<SectionConfigData, Error> {
    let content =
        proxmox_sys::fs::file_read_optional_string(PLAN_CFG_FILENAME)?.unwrap_or_default();

    let data = CONFIG.parse(PLAN_CFG_FILENAME, &content)?;
    Ok(data)
}

pub fn save_config(config: &SectionConfigData) -> Result<(), Error> {
    let raw = CONFIG.write(PLAN_CFG_FILENAME, config)?;
    replace_config(PLAN_CFG_FILENAME, raw.as_bytes())
}

/// List all configured plans.
pub fn list_plans(config: &SectionConfigData) -> Result<Vec<BackupPlanConfig>, Error> {
    use serde::Deserialize;

    let mut list = Vec::new();
    for (_id, (_section_type, section)) in config.sections.iter() {
        list.push(BackupPlanConfig::deserialize(section)?);
    }
    list.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(list)
}

// shell completion helper

/// List all plan IDs
pub fn complete_plan_id(_arg: &str, _param: &HashMap<String, String>) -> Vec<String> {
    match config() {
        Ok(data) => data.sections.keys().map(|id| id.to_string()).collect(),
        Err(_) => Vec::new(),
    }
}
