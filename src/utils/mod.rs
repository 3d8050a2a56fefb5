//! Utility functions.
//!
//! Process bootstrap helpers and retry policies used across the crate.

pub mod bootstrap;
pub mod retry;
