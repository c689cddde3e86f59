//! Lane A: the Knowledge pipeline.
//!
//! Registry -> Indexer -> (graph approval) -> Scan -> Synthesize -> Staleness ->
//! Sufficiency -> Bundle. Every write into the knowledge root is serialized
//! by the Lane A orchestrate lock.

pub mod bundle;
pub mod evidence;
pub mod graph;
pub mod indexer;
pub mod qa;
pub mod registry;
pub mod scan;
pub mod staleness;
pub mod sufficiency;
pub mod synthesize;
pub mod version;
