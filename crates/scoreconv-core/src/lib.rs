//! # scoreconv-core
//!
//! Core types, error taxonomy and shared defaults for the scoreconv worker.
//!
//! This crate holds the typed view of the graph store's records (jobs,
//! property values, documents) that the transport and job crates agree on.

pub mod defaults;
pub mod error;
pub mod file_safety;
pub mod models;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use file_safety::{has_extension, sanitize_filename};
pub use models::*;
