//! CLI subcommand implementations

pub mod monitors;
pub mod plan;
pub mod probe;
pub mod reconcile;
