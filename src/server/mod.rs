//! Process-level plumbing: listening, confinement, and resource limits.

pub mod limits;
pub mod listener;
pub mod privilege;
