//! Command layer - entry points of the subcommands

pub mod daemon;
pub mod once;

pub use daemon::run_daemon;
pub use once::run_once;
