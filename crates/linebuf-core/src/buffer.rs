//! Edit buffer: ordered rows plus dirtiness index sets
//!
//! The buffer is pure data. It performs no I/O and knows nothing about the
//! remote store; the editor mirrors it to durable storage after mutations.
//!
//! Invariants maintained by every operation:
//! - every index in `modified` and `new` is a valid index into `rows`
//! - a row without a server id is in `new`, a row with one never is
//! - `uid`s are unique within the buffer

use std::collections::{BTreeSet, HashSet};

use linebuf_api::{BufferError, Payload, Row, RowState, RowUid, RowView, ServerRow, Value};
use tracing::debug;

use crate::reorder::{move_element, remap_set};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EditBuffer {
    rows: Vec<Row>,
    modified: BTreeSet<usize>,
    new: BTreeSet<usize>,
}

impl EditBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clean buffer holding a server snapshot in server order
    pub fn from_server_rows(server_rows: Vec<ServerRow>) -> Self {
        Self {
            rows: server_rows.into_iter().map(Row::from_server).collect(),
            modified: BTreeSet::new(),
            new: BTreeSet::new(),
        }
    }

    /// Rebuild a buffer from its raw parts, checking every invariant
    pub fn from_parts(
        rows: Vec<Row>,
        modified: BTreeSet<usize>,
        new: BTreeSet<usize>,
    ) -> Result<Self, BufferError> {
        let invalid = |message: String| BufferError::InvalidSnapshot { message };

        if let Some(index) = modified.iter().chain(new.iter()).find(|&&i| i >= rows.len()) {
            return Err(invalid(format!(
                "dirty index {} outside of {} rows",
                index,
                rows.len()
            )));
        }

        if let Some(index) = modified.intersection(&new).next() {
            return Err(invalid(format!(
                "row {} is marked both modified and new",
                index
            )));
        }

        let mut seen = HashSet::new();
        for (index, row) in rows.iter().enumerate() {
            if !seen.insert(&row.uid) {
                return Err(invalid(format!("duplicate uid {}", row.uid)));
            }
            match (&row.id, new.contains(&index)) {
                (None, false) => {
                    return Err(invalid(format!(
                        "row {} has no server id but is not marked new",
                        index
                    )))
                }
                (Some(id), true) => {
                    return Err(invalid(format!(
                        "row {} is marked new but already has server id {}",
                        index, id
                    )))
                }
                _ => {}
            }
        }

        Ok(Self { rows, modified, new })
    }

    /// For callers that build the sets while walking the rows (merge)
    pub(crate) fn from_trusted_parts(
        rows: Vec<Row>,
        modified: BTreeSet<usize>,
        new: BTreeSet<usize>,
    ) -> Self {
        debug_assert!(modified.iter().chain(new.iter()).all(|&i| i < rows.len()));
        Self { rows, modified, new }
    }

    pub fn into_parts(self) -> (Vec<Row>, BTreeSet<usize>, BTreeSet<usize>) {
        (self.rows, self.modified, self.new)
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn row(&self, index: usize) -> Option<&Row> {
        self.rows.get(index)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn modified_indices(&self) -> &BTreeSet<usize> {
        &self.modified
    }

    pub fn new_indices(&self) -> &BTreeSet<usize> {
        &self.new
    }

    /// Whether anything is waiting to be synced
    pub fn is_dirty(&self) -> bool {
        !self.modified.is_empty() || !self.new.is_empty()
    }

    /// Union of `modified` and `new`, ascending
    pub fn dirty_indices(&self) -> BTreeSet<usize> {
        self.modified.union(&self.new).copied().collect()
    }

    pub fn dirty_uids(&self) -> BTreeSet<RowUid> {
        self.dirty_indices()
            .into_iter()
            .map(|i| self.rows[i].uid.clone())
            .collect()
    }

    pub fn index_of(&self, uid: &RowUid) -> Option<usize> {
        self.rows.iter().position(|row| &row.uid == uid)
    }

    pub fn state_of(&self, index: usize) -> Option<RowState> {
        if index >= self.rows.len() {
            None
        } else if self.new.contains(&index) {
            Some(RowState::New)
        } else if self.modified.contains(&index) {
            Some(RowState::Modified)
        } else {
            Some(RowState::Clean)
        }
    }

    pub fn views(&self) -> Vec<RowView> {
        self.rows
            .iter()
            .enumerate()
            .map(|(index, row)| RowView {
                index,
                row: row.clone(),
                state: self.state_of(index).unwrap_or(RowState::Clean),
            })
            .collect()
    }

    fn check_index(&self, index: usize) -> Result<(), BufferError> {
        if index < self.rows.len() {
            Ok(())
        } else {
            Err(BufferError::IndexOutOfBounds {
                index,
                len: self.rows.len(),
            })
        }
    }

    /// Write one payload field and mark the row modified (unless it is new)
    pub fn set_field(
        &mut self,
        index: usize,
        key: impl Into<String>,
        value: Value,
    ) -> Result<(), BufferError> {
        self.check_index(index)?;
        let key = key.into();
        if !value.is_finite() {
            return Err(BufferError::NonFiniteNumber { field: key });
        }
        self.rows[index].payload.insert(key, value);
        if !self.new.contains(&index) {
            self.modified.insert(index);
        }
        Ok(())
    }

    /// Append a never-persisted row and return its index
    pub fn add_row(&mut self, initial_payload: Payload) -> usize {
        self.rows.push(Row::draft(initial_payload));
        let index = self.rows.len() - 1;
        self.new.insert(index);
        debug!("[EditBuffer] Added row at index {}", index);
        index
    }

    /// Delete a row, shifting every later tracked index down by one
    pub fn remove_row(&mut self, index: usize) -> Result<Row, BufferError> {
        self.check_index(index)?;
        let row = self.rows.remove(index);
        self.modified = shift_down_after(&self.modified, index);
        self.new = shift_down_after(&self.new, index);
        Ok(row)
    }

    /// Mark rows as synced.
    ///
    /// A row that still lacks a server id stays in `new`: only `assign_id`
    /// can take a row out of `new`.
    pub fn clear_dirty(&mut self, indices: &[usize]) {
        for &index in indices {
            self.modified.remove(&index);
            let has_id = self.rows.get(index).is_some_and(|row| row.id.is_some());
            if has_id {
                self.new.remove(&index);
            } else if self.new.contains(&index) {
                debug!(
                    "[EditBuffer] Row {} has no server id yet, keeping it new",
                    index
                );
            }
        }
    }

    /// Record the server id of a freshly created row. The row leaves `new`.
    pub fn assign_id(&mut self, index: usize, id: impl Into<String>) -> Result<(), BufferError> {
        self.check_index(index)?;
        self.rows[index].id = Some(id.into());
        self.new.remove(&index);
        Ok(())
    }

    pub fn mark_modified(&mut self, index: usize) -> Result<(), BufferError> {
        self.check_index(index)?;
        if !self.new.contains(&index) {
            self.modified.insert(index);
        }
        Ok(())
    }

    /// Move a row and remap both dirtiness sets to follow the moved rows
    pub fn reorder(&mut self, old_index: usize, new_index: usize) -> Result<(), BufferError> {
        self.check_index(old_index)?;
        self.check_index(new_index)?;
        if old_index == new_index {
            return Ok(());
        }
        move_element(&mut self.rows, old_index, new_index);
        self.modified = remap_set(&self.modified, old_index, new_index);
        self.new = remap_set(&self.new, old_index, new_index);
        debug!("[EditBuffer] Moved row {} -> {}", old_index, new_index);
        Ok(())
    }
}

fn shift_down_after(set: &BTreeSet<usize>, removed: usize) -> BTreeSet<usize> {
    set.iter()
        .filter(|&&k| k != removed)
        .map(|&k| if k > removed { k - 1 } else { k })
        .collect()
}
