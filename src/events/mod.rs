//! Merge-event log: append-only JSONL segments, checkpointed consumers,
//! latest-per-repo summary.

pub mod log;
pub mod summary;
