//! Command handlers

pub mod config;
pub mod queue;
pub mod retry;
pub mod status;
pub mod sync;
