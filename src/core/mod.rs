//! Core module - shared infrastructure for gantry
//!
//! This module contains foundational types, configuration, logging, and
//! error handling used throughout the runtime.

pub mod config;
pub mod error;
pub mod logging;
pub mod types;

pub use config::Config;
pub use error::{GantryError, Result};
pub use types::*;
