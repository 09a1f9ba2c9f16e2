//! Shared types for the line-item editing buffer
//!
//! This crate holds the data model that crosses crate boundaries:
//! - `Value`: dynamic payload field value
//! - `Row`, `ServerRow`, `RowUid`: line items and their identities
//! - `RowState`, `RowView`: presentation-facing row projections
//! - Error enums for buffer, row commit, persistence and editor failures

pub mod error;
pub mod row;
pub mod value;

pub use error::{BufferError, EditorError, PersistenceError, RowError};
pub use row::{Payload, Row, RowState, RowUid, RowView, ServerRow};
pub use value::Value;
