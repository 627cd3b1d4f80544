//! Data models for the database bridge.
//!
//! This module re-exports all model types used throughout the crate.

pub mod program;
pub mod query;

// Re-export commonly used types
pub use program::{ProgramDefinition, ProgramParam};
pub use query::{
    ColumnMetadata, DEFAULT_BUFFER_SIZE, MAX_BUFFER_SIZE, Record, Row, StatementKind,
    StatementState, StreamOptions, Value, to_record,
};
