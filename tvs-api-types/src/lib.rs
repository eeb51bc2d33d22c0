//! Basic API types used by most of the tapevault code.

use proxmox_schema::{const_regex, ApiStringFormat, Schema, StringSchema};

pub use proxmox_schema::api_types::SAFE_ID_FORMAT as TAPEVAULT_SAFE_ID_FORMAT;
pub use proxmox_schema::api_types::SAFE_ID_REGEX as TAPEVAULT_SAFE_ID_REGEX;
pub use proxmox_schema::api_types::SAFE_ID_REGEX_STR as TAPEVAULT_SAFE_ID_REGEX_STR;
pub use proxmox_schema::api_types::COMMENT_SCHEMA as SINGLE_LINE_COMMENT_SCHEMA;
pub use proxmox_schema::api_types::UUID_FORMAT;

const_regex! {
    /// Volume labels: 'TP' + year + month + sequence number.
    pub VOLUME_LABEL_REGEX = r"^TP\d{8}$";

    /// Cron schedules: 5 or 6 whitespace separated fields.
    pub CRON_SCHEDULE_REGEX = r"^\S+(?:\s+\S+){4,5}$";
}

pub const VOLUME_LABEL_FORMAT: ApiStringFormat =
    ApiStringFormat::Pattern(&VOLUME_LABEL_REGEX);

pub const VOLUME_LABEL_SCHEMA: Schema =
    StringSchema::new("Tape volume label (e.g. 'TP20250103').")
        .format(&VOLUME_LABEL_FORMAT)
        .min_length(10)
        .max_length(10)
        .schema();

pub const CRON_SCHEDULE_FORMAT: ApiStringFormat =
    ApiStringFormat::Pattern(&CRON_SCHEDULE_REGEX);

pub const CRON_SCHEDULE_SCHEMA: Schema =
    StringSchema::new("Run schedule as 5- or 6-field cron expression (e.g. '0 2 * * *').")
        .format(&CRON_SCHEDULE_FORMAT)
        .schema();

pub const PLAN_ID_SCHEMA: Schema = StringSchema::new("Backup plan identifier.")
    .format(&TAPEVAULT_SAFE_ID_FORMAT)
    .min_length(3)
    .max_length(32)
    .schema();

pub const TAPE_ID_SCHEMA: Schema = StringSchema::new("Cartridge identifier.")
    .format(&TAPEVAULT_SAFE_ID_FORMAT)
    .min_length(2)
    .max_length(32)
    .schema();

#[rustfmt::skip]
pub const SOURCE_ROOT_SCHEMA: Schema =
    StringSchema::new("Absolute filesystem path used as backup source root.")
        .min_length(1)
        .schema();

mod label;
pub use label::*;

mod cartridge;
pub use cartridge::*;

mod task;
pub use task::*;

mod plan;
pub use plan::*;

mod drive;
pub use drive::*;

mod log;
pub use log::*;

mod error;
pub use error::*;
