//! notify-engine library crate.
//!
//! Notification delivery engine: preference filtering, quiet hours, retry
//! queue and multi-channel fan-out, with SQLite persistence.

pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod notification;

pub use error::{Error, Result};
