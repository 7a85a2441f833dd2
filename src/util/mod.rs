//! Small shared helpers.

pub mod names;
