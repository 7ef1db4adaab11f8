//! Models module for schema_stride
//!
//! Where the desired schema comes from: annotated structs found on disk, or
//! any other source that can produce a project snapshot.

pub mod registry;

use crate::error::Result;
use crate::state::ProjectState;

// Re-export key types
pub use registry::{FieldAttrs, FieldInfo, ModelInfo, ModelRegistry};

/// Implemented by `#[derive(Model)]`
pub trait Model {
    const MODEL_NAME: &'static str;

    /// Table name declared with `#[stride(table = "...")]`, or the snake_case
    /// struct name
    fn db_table() -> String;
}

/// Produces the desired schema for the generate workflow
pub trait SchemaSource {
    fn extract(&self) -> Result<ProjectState>;
}

impl<F> SchemaSource for F
where
    F: Fn() -> Result<ProjectState>,
{
    fn extract(&self) -> Result<ProjectState> {
        self()
    }
}

/// A fixed snapshot
impl SchemaSource for ProjectState {
    fn extract(&self) -> Result<ProjectState> {
        Ok(self.clone())
    }
}
