//! Shared plumbing for the rubro classification services
//!
//! Provides the common error type, configuration loading, the event bus used
//! for progress broadcasting, and database initialization.

pub mod config;
pub mod db;
pub mod error;
pub mod events;

pub use error::{Error, Result};
