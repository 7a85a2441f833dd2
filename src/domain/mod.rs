//! Core data model for the export pipeline.

pub mod types;
