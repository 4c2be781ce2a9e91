pub mod app;
pub mod cmd;
pub mod config;
pub mod correlation;
pub mod metrics;
pub mod platform;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;
