//! Startup and retry helpers.

pub mod bootstrap;
pub mod retry;
