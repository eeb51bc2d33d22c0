//! Tape transport facade, session management and cartridge inventory.

mod device;
pub use device::*;

mod virtual_tape;
pub use virtual_tape::*;

pub mod ltfs;

mod session;
pub use session::*;

mod inventory;
pub use inventory::*;

/// Runtime state directory.
pub const STATE_DIR: &str = "/var/lib/tapevault";

/// Directory holding per-drive lock files.
pub const DRIVE_LOCK_DIR: &str = "/run/tapevault/drive-locks";
