//! Month-scoped volume labels.
//!
//! Every formatted cartridge carries a label of the form
//! `TPYYYYMMNN`, where `NN` is a per-month sequence number. The label
//! month gates which backup kinds may run against the cartridge.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Error};

use proxmox_schema::{ApiStringFormat, Schema, StringSchema};

/// A parsed `TPYYYYMMNN` volume label.
///
/// Historic media may carry `TPYYYYMMDD` labels where the last two
/// digits were the day of month. Those parse like any other sequence
/// number and are replaced the next time the cartridge is formatted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VolumeLabel {
    pub year: u16,
    pub month: u8,
    pub seq: u8,
}

impl VolumeLabel {
    pub fn new(year: u16, month: u8, seq: u8) -> Result<Self, Error> {
        let label = Self { year, month, seq };
        label.check()?;
        Ok(label)
    }

    fn check(&self) -> Result<(), Error> {
        if !(1900..=2100).contains(&self.year) {
            bail!("volume label year {} out of range", self.year);
        }
        if !(1..=12).contains(&self.month) {
            bail!("volume label month {:02} out of range", self.month);
        }
        if !(1..=99).contains(&self.seq) {
            bail!("volume label sequence {:02} out of range", self.seq);
        }
        Ok(())
    }

    /// Month-only freshness test.
    ///
    /// A mismatching year with a matching month is tolerated here; the
    /// caller is expected to log a warning via [`Self::year_matches`].
    pub fn is_current_month(&self, month: u8) -> bool {
        self.month == month
    }

    pub fn year_matches(&self, year: u16) -> bool {
        self.year == year
    }

    /// Pick the smallest unused sequence number (>= 1) for the given
    /// month among `known_labels`.
    pub fn next_in_month(
        known_labels: &[VolumeLabel],
        year: u16,
        month: u8,
    ) -> Result<VolumeLabel, Error> {
        let mut used = [false; 100];
        for label in known_labels {
            if label.year == year && label.month == month {
                used[label.seq as usize] = true;
            }
        }
        for seq in 1..=99u8 {
            if !used[seq as usize] {
                return VolumeLabel::new(year, month, seq);
            }
        }
        bail!(
            "all 99 volume labels for {:04}-{:02} are in use",
            year,
            month
        );
    }
}

impl fmt::Display for VolumeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TP{:04}{:02}{:02}", self.year, self.month, self.seq)
    }
}

impl FromStr for VolumeLabel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = match s.strip_prefix("TP") {
            Some(rest) => rest,
            None => bail!("volume label '{}' does not start with 'TP'", s),
        };
        if digits.len() != 8 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            bail!("volume label '{}' is not of the form TPYYYYMMNN", s);
        }
        let year: u16 = digits[0..4].parse()?;
        let month: u8 = digits[4..6].parse()?;
        let seq: u8 = digits[6..8].parse()?;

        VolumeLabel::new(year, month, seq)
            .map_err(|err| anyhow::format_err!("invalid volume label '{}' - {}", s, err))
    }
}

proxmox_serde::forward_deserialize_to_from_str!(VolumeLabel);
proxmox_serde::forward_serialize_to_display!(VolumeLabel);

impl proxmox_schema::ApiType for VolumeLabel {
    const API_SCHEMA: Schema = StringSchema::new("Volume label (TPYYYYMMNN).")
        .format(&ApiStringFormat::VerifyFn(|text| {
            let _: VolumeLabel = text.parse()?;
            Ok(())
        }))
        .schema();
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_label_round_trip() -> Result<(), Error> {
        for year in [1900u16, 1999, 2025, 2100] {
            for month in 1..=12u8 {
                for seq in [1u8, 7, 31, 99] {
                    let label = VolumeLabel::new(year, month, seq)?;
                    let text = label.to_string();
                    assert_eq!(text.len(), 10);
                    let parsed: VolumeLabel = text.parse()?;
                    assert_eq!(parsed, label);
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_label_parse_rejects_garbage() {
        for text in [
            "TP2025010",    // too short
            "TP202501030",  // too long
            "XX20250103",   // wrong prefix
            "TP2025AB03",   // non-digit
            "TP20251303",   // month 13
            "TP20250100",   // seq 0
            "tp20250103",   // lowercase
        ] {
            assert!(text.parse::<VolumeLabel>().is_err(), "accepted '{}'", text);
        }
    }

    #[test]
    fn test_legacy_day_of_month_alias() -> Result<(), Error> {
        // day-of-month style labels parse like regular sequence numbers
        let label: VolumeLabel = "TP20241107".parse()?;
        assert_eq!(label.seq, 7);
        assert!(label.is_current_month(11));
        assert!(!label.is_current_month(12));
        Ok(())
    }

    #[test]
    fn test_next_in_month() -> Result<(), Error> {
        let known = [
            "TP20250101".parse()?,
            "TP20250102".parse()?,
            "TP20250104".parse()?,
            "TP20241201".parse()?,
        ];

        // gaps are filled first
        let next = VolumeLabel::next_in_month(&known, 2025, 1)?;
        assert_eq!(next.to_string(), "TP20250103");
        assert!(!known.contains(&next));

        // fresh month starts at 01
        let next = VolumeLabel::next_in_month(&known, 2025, 2)?;
        assert_eq!(next.to_string(), "TP20250201");

        // december 2024 already has seq 1
        let next = VolumeLabel::next_in_month(&known, 2024, 12)?;
        assert_eq!(next.to_string(), "TP20241202");

        Ok(())
    }

    #[test]
    fn test_next_in_month_exhausted() -> Result<(), Error> {
        let mut known = Vec::new();
        for seq in 1..=99u8 {
            known.push(VolumeLabel::new(2025, 3, seq)?);
        }
        assert!(VolumeLabel::next_in_month(&known, 2025, 3).is_err());
        Ok(())
    }

    #[test]
    fn test_month_only_comparison() -> Result<(), Error> {
        let label: VolumeLabel = "TP20240103".parse()?;
        // year mismatch is a warning, not a rejection
        assert!(label.is_current_month(1));
        assert!(!label.year_matches(2025));
        Ok(())
    }
}
