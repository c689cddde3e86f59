//! Substrate: errors, time, atomic I/O, canonical JSON, path confinement,
//! locking, the worker pool, the git adapter, and the on-disk layout.

pub mod canonical;
pub mod error;
pub mod fsio;
pub mod git;
pub mod layout;
pub mod ledger;
pub mod lock;
pub mod pool;
pub mod sandbox;
pub mod time;
