use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

use proxmox_schema::{api, ApiStringFormat, Schema, StringSchema};

use crate::{TapeDensity, VolumeLabel, TAPE_ID_SCHEMA, VOLUME_LABEL_SCHEMA};

#[api()]
/// Cartridge status
#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CartridgeStatus {
    /// Cartridge sits in a library slot
    Idle,
    /// Cartridge is loaded into the drive
    Mounted,
    /// A backup task is currently writing to the cartridge
    Writing,
    /// Cartridge reached end of medium
    Full,
    /// Retention period elapsed
    Expired,
    /// A fatal error was attributed to this cartridge
    Errored,
}

serde_plain::derive_display_from_serialize!(CartridgeStatus);
serde_plain::derive_fromstr_from_deserialize!(CartridgeStatus);

impl CartridgeStatus {
    /// Check a single cartridge state machine edge.
    ///
    /// The session layer rejects everything else, so a cartridge can
    /// never e.g. jump from `Idle` straight to `Writing`.
    pub fn check_transition(self, to: CartridgeStatus) -> Result<(), Error> {
        use CartridgeStatus::*;

        // Full/Errored cartridges return to Mounted via reformat
        let allowed = matches!(
            (self, to),
            (Idle, Mounted)
                | (Mounted, Writing)
                | (Mounted, Idle)
                | (Writing, Mounted)
                | (Writing, Full)
                | (Writing, Errored)
                | (Full, Mounted)
                | (Full, Idle)
                | (Errored, Mounted)
                | (Errored, Idle)
                | (Idle, Expired)
                | (Mounted, Expired)
        );

        if !allowed {
            bail!("illegal cartridge status transition {} -> {}", self, to);
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
/// Physical location of a cartridge
pub enum CartridgeLocation {
    /// Loaded into the tape drive
    Drive,
    /// Library storage slot
    Slot(u64),
    /// Removed from the library
    Offline,
}

proxmox_serde::forward_deserialize_to_from_str!(CartridgeLocation);
proxmox_serde::forward_serialize_to_display!(CartridgeLocation);

impl proxmox_schema::ApiType for CartridgeLocation {
    const API_SCHEMA: Schema =
        StringSchema::new("Cartridge location (e.g. 'drive', 'slot-12', 'offline')")
            .format(&ApiStringFormat::VerifyFn(|text| {
                let _: CartridgeLocation = text.parse()?;
                Ok(())
            }))
            .schema();
}

impl std::fmt::Display for CartridgeLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CartridgeLocation::Drive => write!(f, "drive"),
            CartridgeLocation::Slot(slot) => write!(f, "slot-{}", slot),
            CartridgeLocation::Offline => write!(f, "offline"),
        }
    }
}

impl std::str::FromStr for CartridgeLocation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "drive" {
            return Ok(CartridgeLocation::Drive);
        }
        if s == "offline" {
            return Ok(CartridgeLocation::Offline);
        }
        if let Some(slot) = s.strip_prefix("slot-") {
            return Ok(CartridgeLocation::Slot(slot.parse()?));
        }
        bail!("CartridgeLocation parse error");
    }
}

#[api(
    properties: {
        "tape-id": {
            schema: TAPE_ID_SCHEMA,
        },
        label: {
            schema: VOLUME_LABEL_SCHEMA,
        },
        kind: {
            type: TapeDensity,
        },
        location: {
            type: CartridgeLocation,
        },
        status: {
            type: CartridgeStatus,
        },
    },
)]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// A physical tape cartridge known to the service.
pub struct TapeCartridge {
    /// Opaque identifier, equal to the first written label
    pub tape_id: String,
    /// Current volume label
    pub label: VolumeLabel,
    pub kind: TapeDensity,
    /// Native capacity in bytes
    pub capacity_bytes: u64,
    /// Bytes written to the current volume
    pub used_bytes: u64,
    pub location: CartridgeLocation,
    /// Manufacture date (epoch)
    pub manufactured_on: i64,
    /// Retention expiry (epoch)
    pub expires_on: i64,
    pub status: CartridgeStatus,
    /// Opaque diagnostic snapshot (raw log pages, ITDT output)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health: Option<String>,
    /// Creation time stamp (epoch)
    pub created_at: i64,
    /// Last update time stamp (epoch)
    pub updated_at: i64,
}

impl TapeCartridge {
    pub fn check(&self) -> Result<(), Error> {
        if self.expires_on < self.manufactured_on {
            bail!(
                "cartridge '{}': expiry {} before manufacture date {}",
                self.tape_id,
                self.expires_on,
                self.manufactured_on
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_status_transitions() {
        use CartridgeStatus::*;

        for (from, to) in [
            (Idle, Mounted),
            (Mounted, Writing),
            (Writing, Mounted),
            (Writing, Full),
            (Writing, Errored),
            (Full, Mounted),
            (Errored, Mounted),
            (Mounted, Idle),
            (Idle, Expired),
            (Mounted, Expired),
        ] {
            from.check_transition(to).unwrap();
        }

        for (from, to) in [
            (Idle, Writing),
            (Idle, Full),
            (Writing, Idle),
            (Writing, Expired),
            (Expired, Writing),
            (Full, Writing),
            (Mounted, Mounted),
        ] {
            assert!(
                from.check_transition(to).is_err(),
                "{} -> {} must be rejected",
                from,
                to
            );
        }
    }

    #[test]
    fn test_location_round_trip() -> Result<(), Error> {
        for text in ["drive", "slot-3", "slot-240", "offline"] {
            let location: CartridgeLocation = text.parse()?;
            assert_eq!(location.to_string(), text);
        }
        assert!("slot-".parse::<CartridgeLocation>().is_err());
        assert!("shelf".parse::<CartridgeLocation>().is_err());
        Ok(())
    }
}
