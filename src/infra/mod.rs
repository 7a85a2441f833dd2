//! Infrastructure adapters and runtime bootstrap.

pub mod error;
pub mod render;
pub mod telemetry;
