//! Workflow payload model
//!
//! The payload is the single unit of state threaded through every hub and
//! spoke step. Handlers receive it, map one remote response into it, and hand
//! it back to the orchestration layer.

pub mod connection;
pub mod status;
pub mod types;

pub use connection::{CatalogTableSource, Connection, ObjectStoreSource, WarehouseSource};
pub use status::{AssetStatus, RunStatus};
pub use types::{
    CatalogRef, ErrorSummary, Execution, RecipeRef, TaskType, ValidationError, WorkflowPayload,
};
