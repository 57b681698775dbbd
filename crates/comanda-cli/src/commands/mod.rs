//! Command handlers

pub mod config;
pub mod records;
pub mod status;
pub mod watch;
