//! Schema snapshot model
//!
//! Value types describing a project's schema: fields, models and the project as
//! a whole. Snapshots are built by extraction or by replaying migrations and are
//! never shared mutably.

pub mod field;
pub mod model;
pub mod options;
pub mod project;

pub use field::{backing_column, DefaultValue, FieldState, FieldType, Literal};
pub use model::{IndexDef, ModelMeta, ModelState};
pub use options::{FieldOptions, OptionKey};
pub use project::ProjectState;
