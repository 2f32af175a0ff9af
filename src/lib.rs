//! claimboard library
//!
//! This module exports the core components for testing and integration.

pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod hub;
pub mod logging;
pub mod mirror;
pub mod pool;
pub mod reaper;
pub mod routing;
pub mod tools;
pub mod types;
