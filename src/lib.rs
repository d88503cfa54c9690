//! Task Dispatch Library
//!
//! This module exports the core components for testing and integration.

pub mod breaker;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod format;
pub mod scanner;
pub mod scheduler;
pub mod transport;
pub mod types;
