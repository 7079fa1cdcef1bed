//! Drive folder ingestion, face processing and face similarity search.
//!
//! The [`db::Database`] store owns all state. Workers and the scheduler
//! drive it in the background; [`service::PhotoService`] is the
//! access-checked entry point for callers.

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod maintenance;
pub mod schedule;
pub mod service;
pub mod workers;

pub use error::{Error, Result};
