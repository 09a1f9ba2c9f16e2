//! Reconciliation of a fresh server snapshot with a possibly-dirty buffer
//!
//! Local dirty rows always win: they are carried over verbatim. Clean rows are
//! refreshed from the server. Rows created elsewhere are appended in server
//! order.
//!
//! A clean row whose id is missing from the snapshot is kept as-is. The
//! snapshot may be partial or the row may have been deleted upstream; keeping
//! it never loses visible state, at the price of the row resurfacing on the
//! next commit if it really was deleted. Every such row is reported as a
//! `MergeConflict`.

use std::collections::{BTreeSet, HashMap, HashSet};

use linebuf_api::{Row, RowUid, ServerRow};
use tracing::{debug, warn};

use crate::buffer::EditBuffer;

/// A clean local row whose server id was absent from the snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeConflict {
    pub uid: RowUid,
    pub id: String,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub buffer: EditBuffer,
    pub conflicts: Vec<MergeConflict>,
    /// Clean rows whose payload was replaced by the server version
    pub refreshed: usize,
    /// Server rows that had no local counterpart
    pub appended: usize,
}

/// How a local row entered the merged list
enum Carried {
    New,
    Modified,
    Clean,
}

/// Merge `server_rows` into `buffer` without discarding unsynced work.
///
/// Pure: the input buffer is not touched and no I/O happens.
pub fn merge(buffer: &EditBuffer, server_rows: &[ServerRow]) -> MergeOutcome {
    let server_index: HashMap<&str, &ServerRow> = server_rows
        .iter()
        .map(|row| (row.id.as_str(), row))
        .collect();
    let mut claimed: HashSet<&str> = HashSet::new();

    let mut merged: Vec<(Row, Carried)> = Vec::with_capacity(buffer.len() + server_rows.len());
    let mut conflicts = Vec::new();
    let mut refreshed = 0;

    for (index, row) in buffer.rows().iter().enumerate() {
        if buffer.new_indices().contains(&index) {
            merged.push((row.clone(), Carried::New));
        } else if buffer.modified_indices().contains(&index) {
            if let Some(id) = row.id.as_deref() {
                if let Some(server_row) = server_index.get(id) {
                    claimed.insert(server_row.id.as_str());
                }
            }
            merged.push((row.clone(), Carried::Modified));
        } else {
            match row.id.as_deref().and_then(|id| server_index.get(id)) {
                Some(server_row) => {
                    claimed.insert(server_row.id.as_str());
                    if row.payload != server_row.payload {
                        refreshed += 1;
                    }
                    merged.push((
                        Row {
                            uid: row.uid.clone(),
                            id: row.id.clone(),
                            payload: server_row.payload.clone(),
                        },
                        Carried::Clean,
                    ));
                }
                None => {
                    let id = row.id.clone().unwrap_or_default();
                    warn!(
                        "[ReconciliationMerger] Row {} (id {}) missing from server snapshot, keeping local copy",
                        row.uid, id
                    );
                    conflicts.push(MergeConflict {
                        uid: row.uid.clone(),
                        id,
                    });
                    merged.push((row.clone(), Carried::Clean));
                }
            }
        }
    }

    let mut appended = 0;
    for server_row in server_rows {
        if claimed.insert(server_row.id.as_str()) {
            merged.push((Row::from_server(server_row.clone()), Carried::Clean));
            appended += 1;
        }
    }

    let mut modified = BTreeSet::new();
    let mut new = BTreeSet::new();
    let mut rows = Vec::with_capacity(merged.len());
    for (index, (row, carried)) in merged.into_iter().enumerate() {
        match carried {
            Carried::New => {
                new.insert(index);
            }
            Carried::Modified => {
                modified.insert(index);
            }
            Carried::Clean => {}
        }
        rows.push(row);
    }

    debug!(
        "[ReconciliationMerger] Merged {} local rows with {} server rows: {} refreshed, {} appended, {} conflicts",
        buffer.len(),
        server_rows.len(),
        refreshed,
        appended,
        conflicts.len()
    );

    MergeOutcome {
        buffer: EditBuffer::from_trusted_parts(rows, modified, new),
        conflicts,
        refreshed,
        appended,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use linebuf_api::{Payload, Value};
    use proptest::prelude::*;

    fn payload(comment: &str) -> Payload {
        Payload::from([("comment".to_string(), Value::from(comment))])
    }

    fn server(id: &str, comment: &str) -> ServerRow {
        ServerRow::new(id, payload(comment))
    }

    fn ids(buffer: &EditBuffer) -> Vec<Option<String>> {
        buffer.rows().iter().map(|r| r.id.clone()).collect()
    }

    #[test]
    fn test_clean_rows_are_refreshed() {
        let buffer = EditBuffer::from_server_rows(vec![server("1", "a"), server("2", "b")]);
        let outcome = merge(&buffer, &[server("1", "a2"), server("2", "b")]);

        assert_eq!(outcome.refreshed, 1);
        assert_eq!(outcome.appended, 0);
        assert_eq!(outcome.buffer.row(0).unwrap().payload, payload("a2"));
        assert_eq!(outcome.buffer.row(0).unwrap().uid, buffer.row(0).unwrap().uid);
        assert!(!outcome.buffer.is_dirty());
    }

    #[test]
    fn test_modified_rows_win_over_server() {
        let mut buffer = EditBuffer::from_server_rows(vec![server("1", "a"), server("2", "b")]);
        buffer.set_field(1, "comment", "local edit".into()).unwrap();

        let outcome = merge(&buffer, &[server("1", "a"), server("2", "server edit")]);

        assert_eq!(outcome.buffer.len(), 2);
        assert_eq!(outcome.buffer.row(1).unwrap().payload, payload("local edit"));
        assert_eq!(outcome.buffer.modified_indices().len(), 1);
        assert!(outcome.buffer.modified_indices().contains(&1));
    }

    #[test]
    fn test_new_rows_kept_and_server_rows_appended() {
        let mut buffer = EditBuffer::from_server_rows(vec![server("1", "a")]);
        buffer.add_row(payload("draft"));

        let outcome = merge(&buffer, &[server("1", "a"), server("7", "from elsewhere")]);

        assert_eq!(
            ids(&outcome.buffer),
            vec![Some("1".to_string()), None, Some("7".to_string())]
        );
        assert_eq!(outcome.appended, 1);
        assert!(outcome.buffer.new_indices().contains(&1));
        assert_eq!(outcome.buffer.new_indices().len(), 1);
        assert!(outcome.buffer.modified_indices().is_empty());
    }

    #[test]
    fn test_missing_clean_row_is_kept_as_conflict() {
        let buffer = EditBuffer::from_server_rows(vec![server("1", "a"), server("2", "b")]);
        let outcome = merge(&buffer, &[server("2", "b")]);

        assert_eq!(outcome.buffer.len(), 2);
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].id, "1");
        assert_eq!(outcome.conflicts[0].uid, buffer.row(0).unwrap().uid);
        assert!(!outcome.buffer.is_dirty());
    }

    #[test]
    fn test_modified_row_claims_its_server_twin() {
        let mut buffer = EditBuffer::from_server_rows(vec![server("1", "a")]);
        buffer.set_field(0, "comment", "mine".into()).unwrap();

        let outcome = merge(&buffer, &[server("1", "theirs")]);
        assert_eq!(outcome.buffer.len(), 1);
        assert_eq!(outcome.appended, 0);
    }

    #[test]
    fn test_duplicate_server_ids_appended_once() {
        let buffer = EditBuffer::new();
        let outcome = merge(&buffer, &[server("5", "x"), server("5", "x")]);
        assert_eq!(outcome.buffer.len(), 1);
    }

    /// Local buffer built from a server snapshot with random edits applied
    fn buffer_strategy() -> impl Strategy<Value = EditBuffer> {
        (
            prop::collection::vec("[a-z]{0,4}", 0..8),
            prop::collection::vec((0usize..8, "[a-z]{1,4}"), 0..6),
            prop::collection::vec("[a-z]{1,4}", 0..3),
        )
            .prop_map(|(comments, edits, drafts)| {
                let server_rows = comments
                    .iter()
                    .enumerate()
                    .map(|(i, c)| server(&i.to_string(), c))
                    .collect();
                let mut buffer = EditBuffer::from_server_rows(server_rows);
                for (index, value) in edits {
                    if index < buffer.len() {
                        buffer.set_field(index, "comment", value.into()).unwrap();
                    }
                }
                for draft in drafts {
                    buffer.add_row(payload(&draft));
                }
                buffer
            })
    }

    fn snapshot_strategy() -> impl Strategy<Value = Vec<ServerRow>> {
        prop::collection::vec((0usize..12, "[a-z]{0,4}"), 0..10).prop_map(|rows| {
            let mut seen = HashSet::new();
            rows.into_iter()
                .filter(|(id, _)| seen.insert(*id))
                .map(|(id, c)| server(&id.to_string(), &c))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn merge_never_loses_dirty_rows(buffer in buffer_strategy(), snapshot in snapshot_strategy()) {
            let outcome = merge(&buffer, &snapshot);
            for index in buffer.dirty_indices() {
                let local = buffer.row(index).unwrap();
                let merged_index = outcome.buffer.index_of(&local.uid);
                prop_assert!(merged_index.is_some());
                let merged_index = merged_index.unwrap();
                prop_assert_eq!(&outcome.buffer.row(merged_index).unwrap().payload, &local.payload);
                prop_assert!(outcome.buffer.dirty_indices().contains(&merged_index));
            }
            prop_assert_eq!(outcome.buffer.dirty_uids(), buffer.dirty_uids());
        }

        #[test]
        fn merge_on_clean_buffer_matches_fresh_load(
            comments in prop::collection::vec("[a-z]{0,4}", 0..8),
            updated in prop::collection::vec("[a-z]{0,4}", 0..8),
            extra in prop::collection::vec("[a-z]{0,4}", 0..4),
        ) {
            let initial: Vec<ServerRow> = comments
                .iter()
                .enumerate()
                .map(|(i, c)| server(&i.to_string(), c))
                .collect();
            let buffer = EditBuffer::from_server_rows(initial.clone());

            // Same ids in the same order with fresh payloads, plus rows created elsewhere
            let mut snapshot: Vec<ServerRow> = initial
                .iter()
                .enumerate()
                .map(|(i, row)| server(&row.id, updated.get(i).map(String::as_str).unwrap_or("")))
                .collect();
            snapshot.extend(extra.iter().enumerate().map(|(i, c)| server(&format!("x{}", i), c)));

            let merged = merge(&buffer, &snapshot).buffer;
            let fresh = EditBuffer::from_server_rows(snapshot);

            let strip = |b: &EditBuffer| -> Vec<(Option<String>, Payload)> {
                b.rows().iter().map(|r| (r.id.clone(), r.payload.clone())).collect()
            };
            prop_assert_eq!(strip(&merged), strip(&fresh));
            prop_assert!(!merged.is_dirty());
        }
    }
}
