//! Core types and contracts for the Ema actor runtime.
//!
//! Everything here is shared across the workspace: the message model the
//! agent loop runs on, the structured-reply shape, the conversation buffer,
//! the memory store contracts, configuration, and the error taxonomy.

pub mod buffer;
pub mod config;
pub mod error;
pub mod memory;
pub mod types;

pub use error::{EmaError, Result};
