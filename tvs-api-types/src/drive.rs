//! Types for the tape drive configuration and status API
use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

use proxmox_schema::{api, IntegerSchema, Schema, StringSchema, Updater};

use crate::TAPEVAULT_SAFE_ID_FORMAT;

pub const DRIVE_NAME_SCHEMA: Schema = StringSchema::new("Drive Identifier.")
    .format(&TAPEVAULT_SAFE_ID_FORMAT)
    .min_length(3)
    .max_length(32)
    .schema();

pub const SCSI_DRIVE_PATH_SCHEMA: Schema =
    StringSchema::new("The path to a SCSI-generic tape device (i.e. '/dev/sg0')").schema();

pub const ITDT_DEVICE_SCHEMA: Schema =
    StringSchema::new("The device file handed to ITDT (i.e. '/dev/nst0')").schema();

pub const ITDT_PATH_SCHEMA: Schema =
    StringSchema::new("Location of the ITDT binary.").default("/usr/bin/itdt").schema();

pub const ITDT_WORK_MODE_SCHEMA: Schema =
    IntegerSchema::new("ITDT work mode (-w option).")
        .minimum(1)
        .maximum(4)
        .schema();

pub const BLOCK_SIZE_SCHEMA: Schema =
    IntegerSchema::new("Tape block size in bytes (0 selects variable block mode).")
        .minimum(0)
        .maximum(0x80_00_00)
        .default(0)
        .schema();

#[api(
    properties: {
        name: {
            schema: DRIVE_NAME_SCHEMA,
        },
        path: {
            schema: SCSI_DRIVE_PATH_SCHEMA,
        },
        "block-size": {
            schema: BLOCK_SIZE_SCHEMA,
            optional: true,
        },
    }
)]
#[derive(Serialize, Deserialize, Updater, Clone)]
#[serde(rename_all = "kebab-case")]
/// SCSI pass-through tape drive
pub struct ScsiTapeDrive {
    #[updater(skip)]
    pub name: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_size: Option<u32>,
}

#[api(
    properties: {
        name: {
            schema: DRIVE_NAME_SCHEMA,
        },
        device: {
            schema: ITDT_DEVICE_SCHEMA,
        },
        "itdt-path": {
            schema: ITDT_PATH_SCHEMA,
            optional: true,
        },
        "work-mode": {
            schema: ITDT_WORK_MODE_SCHEMA,
            optional: true,
        },
    }
)]
#[derive(Serialize, Deserialize, Updater, Clone)]
#[serde(rename_all = "kebab-case")]
/// Tape drive driven through the external ITDT tool
pub struct ItdtTapeDrive {
    #[updater(skip)]
    pub name: String,
    pub device: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub itdt_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub work_mode: Option<u64>,
}

#[api(
    properties: {
        name: {
            schema: DRIVE_NAME_SCHEMA,
        }
    }
)]
#[derive(Serialize, Deserialize, Clone)]
#[serde(rename_all = "kebab-case")]
/// Simulated tape drive (only for test and debug)
pub struct VirtualTapeDrive {
    pub name: String,
    /// Path to the backing directory
    pub path: String,
    /// Virtual tape size in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_size: Option<usize>,
}

#[api()]
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
/// Kind of device
pub enum DeviceKind {
    /// Tape library / autoloader robot
    Changer,
    /// Normal SCSI tape device
    Tape,
}

#[api(
    properties: {
        kind: {
            type: DeviceKind,
        },
    },
)]
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// Tape device information gathered by a transport scan
pub struct TapeDeviceInfo {
    pub kind: DeviceKind,
    /// Path to the device node
    pub path: String,
    /// Serial number (autodetected)
    pub serial: String,
    /// Vendor (autodetected)
    pub vendor: String,
    /// Product / model (autodetected)
    pub product: String,
    /// Firmware revision
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    /// SCSI address as "host-bus-target-lun"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scsi_addr: Option<String>,
    /// Device major number
    pub major: u32,
    /// Device minor number
    pub minor: u32,
}

impl TapeDeviceInfo {
    pub fn is_library(&self) -> bool {
        self.kind == DeviceKind::Changer
    }
}

#[api()]
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialOrd, PartialEq)]
pub enum TapeDensity {
    /// Unknown (no media loaded)
    Unknown,
    /// LTO5
    LTO5,
    /// LTO6
    LTO6,
    /// LTO7
    LTO7,
    /// LTO7 media in LTO8 drive
    LTO7M8,
    /// LTO8
    LTO8,
    /// LTO9
    LTO9,
    /// IBM TS1100 family (3592)
    TS3592,
}

serde_plain::derive_display_from_serialize!(TapeDensity);
serde_plain::derive_fromstr_from_deserialize!(TapeDensity);

impl TryFrom<u8> for TapeDensity {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let density = match value {
            0x00 => TapeDensity::Unknown,
            0x58 => TapeDensity::LTO5,
            0x5a => TapeDensity::LTO6,
            0x5c => TapeDensity::LTO7,
            0x5d => TapeDensity::LTO7M8,
            0x5e => TapeDensity::LTO8,
            0x60 => TapeDensity::LTO9,
            0x51..=0x55 => TapeDensity::TS3592,
            _ => bail!("unknown tape density code 0x{:02x}", value),
        };
        Ok(density)
    }
}

impl TapeDensity {
    /// Native (uncompressed) capacity, if known.
    pub fn native_capacity(&self) -> Option<u64> {
        let tib = 1024u64 * 1024 * 1024 * 1024;
        match self {
            TapeDensity::Unknown => None,
            TapeDensity::LTO5 => Some(tib + tib / 2),
            TapeDensity::LTO6 => Some(2 * tib + tib / 2),
            TapeDensity::LTO7 => Some(6 * tib),
            TapeDensity::LTO7M8 => Some(9 * tib),
            TapeDensity::LTO8 => Some(12 * tib),
            TapeDensity::LTO9 => Some(18 * tib),
            TapeDensity::TS3592 => Some(20 * tib),
        }
    }
}

#[api(
    properties: {
        generation: {
            type: TapeDensity,
            optional: true,
        },
    },
)]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// Static drive identification.
pub struct DeviceInfo {
    /// Vendor
    pub vendor: String,
    /// Product
    pub product: String,
    /// Firmware revision
    pub firmware: String,
    /// Serial number
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    /// Drive generation (derived from the reported density)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<TapeDensity>,
    /// Native capacity of loaded media in bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native_capacity: Option<u64>,
}

#[api()]
#[derive(Default, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// Aggregated drive/volume performance counters.
pub struct PerformanceCounters {
    /// Number of volume mounts
    pub mounts: u64,
    /// Number of rewind operations observed by this service
    pub rewinds: u64,
    /// Megabytes written in volume life
    pub mb_written: u64,
    /// Megabytes read in volume life
    pub mb_read: u64,
}

#[api()]
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
/// Current logical tape position.
pub struct TapePosition {
    /// Partition number (always 0, partitioned media is unsupported)
    pub partition: u32,
    /// Logical block (object) number
    pub logical_block: u64,
    /// Positioned at beginning of partition
    pub at_bop: bool,
    /// Positioned at end of partition
    pub at_eop: bool,
}
