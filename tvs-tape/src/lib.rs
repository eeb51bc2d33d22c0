//! Tape transport back-ends.
//!
//! Two mutually exclusive production transports live here: direct SCSI
//! pass-through (`sg_tape`, via libsgutils2) and the external ITDT
//! driver (`itdt`). Both translate their native failures into the
//! shared [`TapeError`](tvs_api_types::TapeError) taxonomy, so the rest
//! of the service never learns which one is wired in.

pub mod sgutils2;

pub mod sg_tape;
pub use sg_tape::SgTape;

pub mod itdt;
pub use itdt::ItdtTape;

mod list_drives;
pub use list_drives::*;
