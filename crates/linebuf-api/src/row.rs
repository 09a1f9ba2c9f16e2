//! Line-item rows and their identities

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::Value;

/// Named payload fields of a row
pub type Payload = HashMap<String, Value>;

/// Client-generated row identity.
///
/// Generated once when the row enters a buffer and never reused. It survives
/// reordering and edits and is the identity used for every cross-reference
/// that outlives a single synchronous step (merge, retry, persistence).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowUid(String);

impl RowUid {
    pub fn generate() -> Self {
        Self(format!("row-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RowUid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RowUid {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for RowUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One editable line item.
///
/// Dirtiness is not stored here; the owning buffer tracks it by index so that
/// reordering never touches row content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub uid: RowUid,
    /// Server-assigned id, `None` until the row has been created remotely
    pub id: Option<String>,
    pub payload: Payload,
}

impl Row {
    /// A row that has never been persisted
    pub fn draft(payload: Payload) -> Self {
        Self {
            uid: RowUid::generate(),
            id: None,
            payload,
        }
    }

    /// A row loaded from the server, given a fresh client identity
    pub fn from_server(server_row: ServerRow) -> Self {
        Self {
            uid: RowUid::generate(),
            id: Some(server_row.id),
            payload: server_row.payload,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.payload.get(field)
    }
}

/// Canonical row as returned by the remote store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRow {
    pub id: String,
    pub payload: Payload,
}

impl ServerRow {
    pub fn new(id: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

/// Sync state of a row as shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowState {
    Clean,
    Modified,
    New,
}

impl RowState {
    pub fn is_dirty(&self) -> bool {
        !matches!(self, RowState::Clean)
    }
}

/// Row at its current position together with its sync state
#[derive(Debug, Clone, PartialEq)]
pub struct RowView {
    pub index: usize,
    pub row: Row,
    pub state: RowState,
}
