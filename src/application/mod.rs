//! Application services: batch dispatch, progress estimation, archive
//! aggregation, and export orchestration.

pub mod archive;
pub mod batch;
pub mod error;
pub mod export;
pub mod progress;
