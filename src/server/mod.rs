//! Service plumbing: persistence, audit logs, plan run state,
//! notifications and shutdown handling.

pub mod jobstate;

mod logs;
pub use logs::*;

mod notifications;
pub use notifications::*;

mod store;
pub use store::*;

mod state;
pub use state::*;
