//! Export pipeline for a visual page editor.
//!
//! The pipeline turns a set of logical pages (canvas regions or
//! invitee-personalized variants) into rendered image artifacts via an
//! external rendering service, reports smooth progress while the batch is in
//! flight, tolerates partial failures, and packages the surviving artifacts
//! into a single deliverable.

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
pub mod util;
