//! Schema module for schema_stride
//!
//! Diffing, rename detection and safety validation over project snapshots.

pub mod differ;
pub mod rename;
pub mod validate;

// Re-export key types
pub use differ::{diff, Differ};
pub use rename::{
    confirm_field_renames, AcceptAll, Confirmer, DeclineAll, RenameCandidate, RenameDecision, RenameMap,
};
pub use validate::{check_operations, enforce, validate_index_columns, Validation};
