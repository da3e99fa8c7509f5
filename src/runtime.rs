//! Runtime glue: configuration, telemetry and the runner that owns the
//! coordinator's lifecycle.

pub mod config;
pub mod runner;
pub mod telemetry;
