//! Lane B: intake triage and the Lane A governance boundary.

pub mod gate;
pub mod intake;
pub mod triage;
