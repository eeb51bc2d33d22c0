//! Tapevault - LTFS tape backup service.
//!
//! The service drives exactly one tape transport. All tape I/O is
//! serialized behind the single-writer [`tape::TapeSession`]; backup
//! jobs stream filesystem data through [`backup::ArchiveWriter`] onto
//! the mounted LTFS volume, and [`scheduler::Scheduler`] fires
//! recurring plans from cron expressions.

pub mod tape;

pub mod backup;

pub mod scheduler;

pub mod server;
