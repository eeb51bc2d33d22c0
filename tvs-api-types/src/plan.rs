use serde::{Deserialize, Serialize};

use proxmox_schema::{api, ArraySchema, IntegerSchema, Schema};

use crate::{
    BackupKind, CRON_SCHEDULE_SCHEMA, PLAN_ID_SCHEMA, SINGLE_LINE_COMMENT_SCHEMA,
    SOURCE_ROOT_SCHEMA,
};

pub const SOURCE_ROOT_LIST_SCHEMA: Schema =
    ArraySchema::new("List of source roots.", &SOURCE_ROOT_SCHEMA).schema();

pub const RETENTION_MONTHS_SCHEMA: Schema =
    IntegerSchema::new("Number of months written cartridges are retained.")
        .minimum(1)
        .maximum(120)
        .default(12)
        .schema();

#[api(
    properties: {
        id: {
            schema: PLAN_ID_SCHEMA,
        },
        kind: {
            type: BackupKind,
        },
        schedule: {
            schema: CRON_SCHEDULE_SCHEMA,
        },
        "source-roots": {
            schema: SOURCE_ROOT_LIST_SCHEMA,
        },
        "retention-months": {
            schema: RETENTION_MONTHS_SCHEMA,
            optional: true,
        },
        comment: {
            schema: SINGLE_LINE_COMMENT_SCHEMA,
            optional: true,
        },
    },
)]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// Declarative recurring backup intent.
pub struct BackupPlanConfig {
    pub id: String,
    /// Human readable plan name
    pub name: String,
    pub schedule: String,
    pub kind: BackupKind,
    pub source_roots: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_months: Option<u32>,
    /// Disabled plans are skipped by the scheduler
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl BackupPlanConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

#[api(
    properties: {
        config: {
            type: BackupPlanConfig,
        },
    },
)]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// Plan configuration plus live scheduling state.
pub struct BackupPlanStatus {
    #[serde(flatten)]
    pub config: BackupPlanConfig,
    /// Last fire time (epoch)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_fire_at: Option<i64>,
    /// Next computed fire time (epoch)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_fire_at: Option<i64>,
}
