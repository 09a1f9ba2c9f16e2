//! Crash recovery for unsaved edits
//!
//! While the buffer is dirty it is mirrored to a durable key-value store under
//! a key derived from the parent record. On mount the stored entry is offered
//! back to the user if it belongs to the same parent and is fresh enough;
//! anything else is discarded without prompting.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use linebuf_api::{PersistenceError, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::buffer::EditBuffer;
use crate::config::EditorConfig;
use crate::storage::KeyValueStore;

/// Serialized form of an in-progress edit session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryRecord {
    /// Parent identity, or the draft sentinel while the parent does not exist
    pub parent_id: String,
    pub rows: Vec<Row>,
    pub modified: Vec<usize>,
    #[serde(rename = "new")]
    pub new_rows: Vec<usize>,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl RecoveryRecord {
    pub fn capture(parent_id: impl Into<String>, buffer: &EditBuffer, timestamp: i64) -> Self {
        Self {
            parent_id: parent_id.into(),
            rows: buffer.rows().to_vec(),
            modified: buffer.modified_indices().iter().copied().collect(),
            new_rows: buffer.new_indices().iter().copied().collect(),
            timestamp,
        }
    }

    pub fn to_json(&self) -> Result<String, PersistenceError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, PersistenceError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Rebuild the buffer, rejecting records that break buffer invariants
    pub fn to_buffer(&self) -> Result<EditBuffer, linebuf_api::BufferError> {
        EditBuffer::from_parts(
            self.rows.clone(),
            self.modified.iter().copied().collect::<BTreeSet<_>>(),
            self.new_rows.iter().copied().collect::<BTreeSet<_>>(),
        )
    }
}

/// A stored session that passed validation and may be restored
#[derive(Debug, Clone)]
pub struct RecoverySnapshot {
    pub buffer: EditBuffer,
    pub saved_at: DateTime<Utc>,
}

pub struct PersistenceGuard {
    store: Arc<dyn KeyValueStore>,
    key_prefix: String,
    draft_key: String,
    max_age_ms: i64,
}

impl PersistenceGuard {
    pub fn new(store: Arc<dyn KeyValueStore>, config: &EditorConfig) -> Self {
        Self {
            store,
            key_prefix: config.storage_key_prefix.clone(),
            draft_key: config.draft_key.clone(),
            max_age_ms: config.recovery_max_age_ms,
        }
    }

    fn scope<'a>(&'a self, parent_id: Option<&'a str>) -> &'a str {
        parent_id.unwrap_or(self.draft_key.as_str())
    }

    /// Storage key for a parent (or the draft sentinel when there is none)
    pub fn key_for(&self, parent_id: Option<&str>) -> String {
        format!("{}:{}", self.key_prefix, self.scope(parent_id))
    }

    /// Write the buffer if it is dirty, otherwise drop the stored entry
    pub fn mirror(&self, parent_id: Option<&str>, buffer: &EditBuffer) -> Result<(), PersistenceError> {
        self.mirror_at(parent_id, buffer, Utc::now().timestamp_millis())
    }

    pub fn mirror_at(
        &self,
        parent_id: Option<&str>,
        buffer: &EditBuffer,
        now_ms: i64,
    ) -> Result<(), PersistenceError> {
        if !buffer.is_dirty() {
            return self.clear(parent_id);
        }
        let key = self.key_for(parent_id);
        let record = RecoveryRecord::capture(self.scope(parent_id), buffer, now_ms);
        self.store
            .set(&key, record.to_json()?)
            .map_err(storage_error)?;
        debug!(
            "[PersistenceGuard] Mirrored {} rows ({} modified, {} new) to '{}'",
            record.rows.len(),
            record.modified.len(),
            record.new_rows.len(),
            key
        );
        Ok(())
    }

    pub fn clear(&self, parent_id: Option<&str>) -> Result<(), PersistenceError> {
        let key = self.key_for(parent_id);
        self.store.remove(&key).map_err(storage_error)
    }

    /// Look for a restorable session for `parent_id`
    pub fn load_recovery(
        &self,
        parent_id: Option<&str>,
    ) -> Result<Option<RecoverySnapshot>, PersistenceError> {
        self.load_recovery_at(parent_id, Utc::now().timestamp_millis())
    }

    /// Same as `load_recovery` with an explicit clock. Entries that fail
    /// validation are removed and reported as absent.
    pub fn load_recovery_at(
        &self,
        parent_id: Option<&str>,
        now_ms: i64,
    ) -> Result<Option<RecoverySnapshot>, PersistenceError> {
        let key = self.key_for(parent_id);
        let Some(raw) = self.store.get(&key).map_err(storage_error)? else {
            return Ok(None);
        };

        let record = match RecoveryRecord::from_json(&raw) {
            Ok(record) => record,
            Err(e) => {
                warn!("[PersistenceGuard] Discarding unreadable entry '{}': {}", key, e);
                self.clear(parent_id)?;
                return Ok(None);
            }
        };

        let expected = self.scope(parent_id);
        if record.parent_id != expected {
            info!(
                "[PersistenceGuard] Discarding entry '{}': stored for parent '{}', expected '{}'",
                key, record.parent_id, expected
            );
            self.clear(parent_id)?;
            return Ok(None);
        }

        let age_ms = now_ms - record.timestamp;
        if age_ms >= self.max_age_ms {
            info!(
                "[PersistenceGuard] Discarding stale entry '{}' ({} ms old)",
                key, age_ms
            );
            self.clear(parent_id)?;
            return Ok(None);
        }

        let buffer = match record.to_buffer() {
            Ok(buffer) => buffer,
            Err(e) => {
                warn!("[PersistenceGuard] Discarding inconsistent entry '{}': {}", key, e);
                self.clear(parent_id)?;
                return Ok(None);
            }
        };

        let saved_at = Utc
            .timestamp_millis_opt(record.timestamp)
            .single()
            .unwrap_or_else(Utc::now);
        info!(
            "[PersistenceGuard] Found recoverable session '{}' with {} dirty rows",
            key,
            buffer.dirty_indices().len()
        );
        Ok(Some(RecoverySnapshot { buffer, saved_at }))
    }

    /// Re-key a stored session, used when a drafted parent gets its id
    pub fn move_entry(
        &self,
        from_parent: Option<&str>,
        to_parent: Option<&str>,
    ) -> Result<(), PersistenceError> {
        let from_key = self.key_for(from_parent);
        let to_key = self.key_for(to_parent);
        if from_key == to_key {
            return Ok(());
        }
        let Some(raw) = self.store.get(&from_key).map_err(storage_error)? else {
            return Ok(());
        };
        let mut record = RecoveryRecord::from_json(&raw)?;
        record.parent_id = self.scope(to_parent).to_string();
        self.store
            .set(&to_key, record.to_json()?)
            .map_err(storage_error)?;
        self.store.remove(&from_key).map_err(storage_error)?;
        debug!("[PersistenceGuard] Moved entry '{}' -> '{}'", from_key, to_key);
        Ok(())
    }
}

fn storage_error(e: Box<dyn std::error::Error + Send + Sync>) -> PersistenceError {
    PersistenceError::Storage {
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryKeyValueStore;
    use linebuf_api::{Payload, ServerRow, Value};

    const HOUR_MS: i64 = 60 * 60 * 1000;

    fn guard() -> (PersistenceGuard, MemoryKeyValueStore) {
        let store = MemoryKeyValueStore::new();
        let guard = PersistenceGuard::new(Arc::new(store.clone()), &EditorConfig::default());
        (guard, store)
    }

    fn dirty_buffer() -> EditBuffer {
        let mut buffer = EditBuffer::from_server_rows(vec![
            ServerRow::new("1", Payload::new()),
            ServerRow::new("2", Payload::new()),
        ]);
        buffer.set_field(1, "discount", Value::Integer(5)).unwrap();
        buffer.add_row(Payload::from([("comment".to_string(), Value::from("draft"))]));
        buffer
    }

    #[test]
    fn test_keys_are_derived_from_parent() {
        let (guard, _) = guard();
        assert_eq!(guard.key_for(Some("42")), "line-items-draft:42");
        assert_eq!(guard.key_for(None), "line-items-draft:new");
    }

    #[test]
    fn test_record_uses_documented_field_names() {
        let record = RecoveryRecord::capture("42", &dirty_buffer(), 1_000);
        let json: serde_json::Value = serde_json::from_str(&record.to_json().unwrap()).unwrap();
        assert_eq!(json["parentId"], "42");
        assert_eq!(json["modified"], serde_json::json!([1]));
        assert_eq!(json["new"], serde_json::json!([2]));
        assert_eq!(json["timestamp"], 1_000);
        assert_eq!(json["rows"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_round_trip_restores_buffer() {
        let (guard, _) = guard();
        let buffer = dirty_buffer();
        guard.mirror_at(Some("42"), &buffer, 10 * HOUR_MS).unwrap();

        let snapshot = guard
            .load_recovery_at(Some("42"), 12 * HOUR_MS)
            .unwrap()
            .expect("fresh entry should be offered");
        assert_eq!(snapshot.buffer, buffer);
        assert_eq!(snapshot.saved_at.timestamp_millis(), 10 * HOUR_MS);
    }

    #[test]
    fn test_clean_buffer_removes_entry() {
        let (guard, store) = guard();
        let mut buffer = dirty_buffer();
        guard.mirror(Some("42"), &buffer).unwrap();
        assert_eq!(store.len(), 1);

        buffer.remove_row(2).unwrap();
        buffer.clear_dirty(&[1]);
        guard.mirror(Some("42"), &buffer).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_stale_entry_is_discarded_silently() {
        let (guard, store) = guard();
        guard.mirror_at(Some("42"), &dirty_buffer(), 0).unwrap();

        let result = guard.load_recovery_at(Some("42"), 24 * HOUR_MS).unwrap();
        assert!(result.is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_foreign_parent_is_discarded() {
        let (guard, store) = guard();
        let record = RecoveryRecord::capture("99", &dirty_buffer(), 0);
        store
            .set(&guard.key_for(Some("42")), record.to_json().unwrap())
            .unwrap();

        assert!(guard.load_recovery_at(Some("42"), HOUR_MS).unwrap().is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_garbage_and_inconsistent_entries_are_discarded() {
        let (guard, store) = guard();
        let key = guard.key_for(Some("42"));

        store.set(&key, "not json".to_string()).unwrap();
        assert!(guard.load_recovery_at(Some("42"), 0).unwrap().is_none());
        assert!(store.is_empty());

        let mut record = RecoveryRecord::capture("42", &dirty_buffer(), 0);
        record.modified.push(17);
        store.set(&key, record.to_json().unwrap()).unwrap();
        assert!(guard.load_recovery_at(Some("42"), 0).unwrap().is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_missing_entry_is_noop() {
        let (guard, _) = guard();
        assert!(guard.load_recovery(Some("42")).unwrap().is_none());
    }

    #[test]
    fn test_move_entry_rekeys_draft() {
        let (guard, store) = guard();
        guard.mirror_at(None, &dirty_buffer(), 0).unwrap();

        guard.move_entry(None, Some("42")).unwrap();
        assert_eq!(store.keys(), vec!["line-items-draft:42".to_string()]);
        assert!(guard.load_recovery_at(Some("42"), HOUR_MS).unwrap().is_some());
    }
}
