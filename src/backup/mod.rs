//! Backup execution pipeline.

mod worker;
pub use worker::*;

mod archive;
pub use archive::*;

mod engine;
pub use engine::*;
