pub mod cli;
pub mod exporter;

pub use cli::*;
pub use exporter::*;
