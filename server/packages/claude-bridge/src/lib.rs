//! Claude bridge core utilities.

pub mod aggregate;
pub mod cli;
pub mod config;
pub mod content;
pub mod messages;
pub mod model;
pub mod router;
pub mod streaming;
pub mod telemetry;
