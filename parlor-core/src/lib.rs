//! Core types for parlor
//!
//! This crate owns the conversation data model, the session store and its
//! durable blob backends, plus the configuration and logging setup shared by
//! the client and the CLI.

pub mod config;
pub mod error;
pub mod logging;
pub mod session;

pub use error::{Error, Result};
