//! Editable line-item reconciliation buffer
//!
//! This crate keeps an ordered list of line items editable while a remote
//! store stays the source of truth:
//! - `EditBuffer`: rows plus the dirty index sets (`modified`, `new`)
//! - `merge`: folds a server snapshot into a buffer without losing local edits
//! - `BatchCommitter` / `RetryCoordinator`: push dirty rows to a `LineItemStore`
//! - `PersistenceGuard`: mirrors unsaved work to a `KeyValueStore` for recovery
//! - `LineItemEditor`: the façade a presentation layer talks to

pub mod buffer;
pub mod commit;
pub mod config;
pub mod deadline;
pub mod editor;
pub mod merge;
pub mod persistence;
pub mod reorder;
pub mod retry;
pub mod storage;
pub mod testing;
pub mod traits;

pub use buffer::EditBuffer;
pub use commit::{AppliedOutcomes, BatchCommitter, CommitFailure, CommitPlan, RowOutcome};
pub use config::EditorConfig;
pub use editor::{CommitReport, LineItemEditor, SnapshotDisposition};
pub use merge::{merge, MergeConflict, MergeOutcome};
pub use persistence::{PersistenceGuard, RecoveryRecord, RecoverySnapshot};
pub use retry::RetryCoordinator;
pub use storage::{FileKeyValueStore, KeyValueStore, MemoryKeyValueStore};
pub use traits::{LineItemStore, MaybeSendSync, Result};

pub use linebuf_api::{
    BufferError, EditorError, Payload, PersistenceError, Row, RowError, RowState, RowUid, RowView,
    ServerRow, Value,
};
