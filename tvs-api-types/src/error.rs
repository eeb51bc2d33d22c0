//! Shared error taxonomy.
//!
//! Every tape, session and engine operation fails with exactly one of
//! these kinds. The transports translate their native failures (SCSI
//! sense data, ITDT output) into this vocabulary, so both back-ends are
//! indistinguishable to callers.

use serde::{Deserialize, Serialize};

use proxmox_schema::api;

use crate::TaskError;

#[api()]
#[derive(Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// Error classification tag, persisted with failed tasks.
pub enum ErrorKind {
    /// Transport cannot reach the drive
    DeviceUnavailable,
    /// Drive present, medium not loaded or still loading
    NotReady,
    /// Physical or logical write protect
    WriteProtected,
    /// Read/write/position failure attributable to the cartridge
    MediumError,
    /// Drive-attributed failure
    HardwareError,
    /// Exceeded per-call deadline
    Timeout,
    /// Unsupported opcode or bad parameters
    InvalidCommand,
    /// Non-full job against an out-of-month label
    LabelMonthMismatch,
    /// Session held by another holder
    Busy,
    /// External cancellation honored
    Cancelled,
    /// Missing or inconsistent configuration
    ConfigError,
    /// Physical end of medium reached mid-write
    EndOfMedium,
    /// Post-write verification disagreed with source
    IntegrityError,
}

serde_plain::derive_display_from_serialize!(ErrorKind);
serde_plain::derive_fromstr_from_deserialize!(ErrorKind);

#[derive(thiserror::Error, Debug)]
pub enum TapeError {
    #[error("device unavailable - {0}")]
    DeviceUnavailable(String),
    #[error("drive not ready - {message}")]
    NotReady {
        message: String,
        /// Set when the drive reported a becoming-ready condition; such
        /// errors are retried by the device layer.
        becoming_ready: bool,
    },
    #[error("medium is write protected")]
    WriteProtected,
    #[error("medium error - {0}")]
    MediumError(String),
    #[error("hardware error - {0}")]
    HardwareError(String),
    #[error("timeout - {0}")]
    Timeout(String),
    #[error("invalid command - {0}")]
    InvalidCommand(String),
    #[error("volume label '{label}' does not match current month {month:02}")]
    LabelMonthMismatch { label: String, month: u8 },
    #[error("tape session busy - held by '{holder}' since {since}")]
    Busy { holder: String, since: i64 },
    #[error("operation cancelled")]
    Cancelled,
    #[error("configuration error - {0}")]
    ConfigError(String),
    #[error("reached end of medium")]
    EndOfMedium,
    #[error("integrity check failed - {0}")]
    IntegrityError(String),
}

impl TapeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TapeError::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
            TapeError::NotReady { .. } => ErrorKind::NotReady,
            TapeError::WriteProtected => ErrorKind::WriteProtected,
            TapeError::MediumError(_) => ErrorKind::MediumError,
            TapeError::HardwareError(_) => ErrorKind::HardwareError,
            TapeError::Timeout(_) => ErrorKind::Timeout,
            TapeError::InvalidCommand(_) => ErrorKind::InvalidCommand,
            TapeError::LabelMonthMismatch { .. } => ErrorKind::LabelMonthMismatch,
            TapeError::Busy { .. } => ErrorKind::Busy,
            TapeError::Cancelled => ErrorKind::Cancelled,
            TapeError::ConfigError(_) => ErrorKind::ConfigError,
            TapeError::EndOfMedium => ErrorKind::EndOfMedium,
            TapeError::IntegrityError(_) => ErrorKind::IntegrityError,
        }
    }

    /// True for failures the device layer may retry with backoff
    /// (becoming-ready, unit attention, busy drive, per-call timeout).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TapeError::NotReady {
                becoming_ready: true,
                ..
            } | TapeError::Timeout(_)
        )
    }

    pub fn to_task_error(&self) -> TaskError {
        TaskError {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_kind_tag_round_trip() {
        for kind in [
            ErrorKind::DeviceUnavailable,
            ErrorKind::NotReady,
            ErrorKind::WriteProtected,
            ErrorKind::MediumError,
            ErrorKind::HardwareError,
            ErrorKind::Timeout,
            ErrorKind::InvalidCommand,
            ErrorKind::LabelMonthMismatch,
            ErrorKind::Busy,
            ErrorKind::Cancelled,
            ErrorKind::ConfigError,
            ErrorKind::EndOfMedium,
            ErrorKind::IntegrityError,
        ] {
            let text = kind.to_string();
            let parsed: ErrorKind = text.parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_transient_classification() {
        let becoming_ready = TapeError::NotReady {
            message: "in process of becoming ready".into(),
            becoming_ready: true,
        };
        assert!(becoming_ready.is_transient());

        let no_medium = TapeError::NotReady {
            message: "medium not present".into(),
            becoming_ready: false,
        };
        assert!(!no_medium.is_transient());

        assert!(TapeError::Timeout("tur".into()).is_transient());
        assert!(!TapeError::WriteProtected.is_transient());
        assert!(!TapeError::EndOfMedium.is_transient());
    }
}
