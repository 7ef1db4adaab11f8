//! Utilities for schema_stride
//!
//! This module provides utility functions used across the library.

pub mod logging;
pub mod naming;

// Re-export key utility functions
pub use naming::{apply_naming_convention, get_table_name, index_name, slugify};
