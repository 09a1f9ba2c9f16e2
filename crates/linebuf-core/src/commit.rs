//! Batch commit of dirty rows
//!
//! A commit runs in three phases so that no buffer borrow is held across a
//! network call:
//! 1. `plan` snapshots the dirty rows (by `uid`) and validates them locally
//! 2. `submit` talks to the remote store, one create-batch per chunk of new
//!    rows and one update + finalize per modified row
//! 3. `apply_outcomes` re-resolves every row by `uid` and updates dirtiness
//!
//! A create-batch failure fails every row of its chunk; nothing is partially
//! credited. Updates succeed or fail per row.

use std::sync::Arc;

use futures::future::join_all;
use linebuf_api::{EditorError, Payload, Row, RowError, RowUid};
use tracing::{debug, info, warn};

use crate::buffer::EditBuffer;
use crate::config::EditorConfig;
use crate::deadline::with_deadline;
use crate::traits::LineItemStore;

/// A row that could not be committed, as shown in the failure list
#[derive(Debug, Clone, PartialEq)]
pub struct CommitFailure {
    pub uid: RowUid,
    /// Position of the row when the failure list was last read
    pub index: usize,
    pub error: RowError,
    pub row: Row,
}

/// A row captured for sending
#[derive(Debug, Clone)]
pub struct Submission {
    pub uid: RowUid,
    pub id: Option<String>,
    /// Payload as it was when captured; compared again when the call settles
    pub payload: Payload,
}

impl Submission {
    pub(crate) fn capture(row: &Row) -> Self {
        Self {
            uid: row.uid.clone(),
            id: row.id.clone(),
            payload: row.payload.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CommitPlan {
    pub creates: Vec<Submission>,
    pub updates: Vec<Submission>,
    /// Rows rejected by local validation; never sent
    pub rejected: Vec<(RowUid, RowError)>,
}

impl CommitPlan {
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.rejected.is_empty()
    }

    pub fn row_count(&self) -> usize {
        self.creates.len() + self.updates.len() + self.rejected.len()
    }
}

/// Result of one row's remote round-trip
#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Created {
        uid: RowUid,
        id: String,
        submitted: Payload,
    },
    Updated {
        uid: RowUid,
        submitted: Payload,
    },
    Failed {
        uid: RowUid,
        error: RowError,
    },
}

/// Check the fields that must be filled in before a row may leave the client
pub fn validate_row(row: &Row, required_fields: &[String]) -> Result<(), RowError> {
    for field in required_fields {
        if row.get(field).map_or(true, |v| v.is_blank()) {
            return Err(RowError::Validation {
                field: field.clone(),
            });
        }
    }
    Ok(())
}

pub struct BatchCommitter {
    store: Arc<dyn LineItemStore>,
    config: EditorConfig,
}

impl BatchCommitter {
    pub fn new(store: Arc<dyn LineItemStore>, config: EditorConfig) -> Self {
        Self { store, config }
    }

    /// Partition dirty rows into creates and updates, validating each one.
    ///
    /// New rows need a parent to attach to; without one the whole commit is
    /// refused before anything is sent.
    pub fn plan(&self, parent_id: Option<&str>, buffer: &EditBuffer) -> Result<CommitPlan, EditorError> {
        let mut plan = CommitPlan::default();

        for index in buffer.dirty_indices() {
            let Some(row) = buffer.row(index) else {
                continue;
            };
            if row.id.is_none() && parent_id.is_none() {
                return Err(EditorError::MissingParent);
            }
            if let Err(error) = validate_row(row, &self.config.required_fields) {
                debug!(
                    "[BatchCommitter] Row {} rejected locally: {}",
                    row.uid, error
                );
                plan.rejected.push((row.uid.clone(), error));
                continue;
            }
            let submission = Submission::capture(row);
            if submission.id.is_none() {
                plan.creates.push(submission);
            } else {
                plan.updates.push(submission);
            }
        }

        Ok(plan)
    }

    /// Send a plan to the remote store. Chunks and updates run concurrently.
    #[tracing::instrument(
        name = "line_items.commit.submit",
        skip(self, plan),
        fields(creates = plan.creates.len(), updates = plan.updates.len())
    )]
    pub async fn submit(&self, parent_id: Option<&str>, plan: CommitPlan) -> Vec<RowOutcome> {
        let mut outcomes: Vec<RowOutcome> = plan
            .rejected
            .into_iter()
            .map(|(uid, error)| RowOutcome::Failed { uid, error })
            .collect();

        let parent_id = parent_id.unwrap_or_default();
        let chunk_size = self.config.effective_batch_size();
        let chunk_calls = plan
            .creates
            .chunks(chunk_size)
            .map(|chunk| self.create_chunk(parent_id, chunk.to_vec()));
        let update_calls = plan
            .updates
            .into_iter()
            .map(|submission| self.update_single(submission));

        let (chunk_results, update_results) =
            futures::future::join(join_all(chunk_calls), join_all(update_calls)).await;

        outcomes.extend(chunk_results.into_iter().flatten());
        outcomes.extend(update_results);

        let failed = outcomes
            .iter()
            .filter(|o| matches!(o, RowOutcome::Failed { .. }))
            .count();
        info!(
            "[BatchCommitter] Submitted {} rows, {} failed",
            outcomes.len(),
            failed
        );
        outcomes
    }

    async fn create_chunk(&self, parent_id: &str, chunk: Vec<Submission>) -> Vec<RowOutcome> {
        let payloads = chunk
            .iter()
            .map(|s| outgoing_payload(&s.payload, &self.config))
            .collect();

        let result = with_deadline(
            self.config.batch_timeout(),
            self.store.create_batch(parent_id, payloads),
        )
        .await
        .and_then(|ids| {
            if ids.len() == chunk.len() {
                Ok(ids)
            } else {
                Err(RowError::ServerRejection {
                    message: format!(
                        "create returned {} ids for {} rows",
                        ids.len(),
                        chunk.len()
                    ),
                })
            }
        });

        match result {
            Ok(ids) => chunk
                .into_iter()
                .zip(ids)
                .map(|(submission, id)| RowOutcome::Created {
                    uid: submission.uid,
                    id,
                    submitted: submission.payload,
                })
                .collect(),
            Err(error) => {
                warn!(
                    "[BatchCommitter] Create batch of {} rows failed: {}",
                    chunk.len(),
                    error
                );
                chunk
                    .into_iter()
                    .map(|submission| RowOutcome::Failed {
                        uid: submission.uid,
                        error: error.clone(),
                    })
                    .collect()
            }
        }
    }

    /// Create one row on its own, bounded by the single-row deadline
    pub async fn create_single(&self, parent_id: &str, submission: Submission) -> RowOutcome {
        let payload = outgoing_payload(&submission.payload, &self.config);
        let result = with_deadline(
            self.config.row_timeout(),
            self.store.create_batch(parent_id, vec![payload]),
        )
        .await;

        match result.map(|ids| ids.into_iter().next()) {
            Ok(Some(id)) => RowOutcome::Created {
                uid: submission.uid,
                id,
                submitted: submission.payload,
            },
            Ok(None) => RowOutcome::Failed {
                uid: submission.uid,
                error: RowError::ServerRejection {
                    message: "create returned no id".to_string(),
                },
            },
            Err(error) => {
                warn!("[BatchCommitter] Create of row {} failed: {}", submission.uid, error);
                RowOutcome::Failed {
                    uid: submission.uid,
                    error,
                }
            }
        }
    }

    /// Update then finalize one row, each call bounded by the single-row deadline
    pub async fn update_single(&self, submission: Submission) -> RowOutcome {
        let Some(id) = submission.id.clone() else {
            return RowOutcome::Failed {
                uid: submission.uid,
                error: RowError::ServerRejection {
                    message: "row has no server id".to_string(),
                },
            };
        };

        let payload = outgoing_payload(&submission.payload, &self.config);
        let timeout = self.config.row_timeout();
        let result = match with_deadline(timeout, self.store.update_row(&id, payload)).await {
            Ok(()) => with_deadline(timeout, self.store.finalize_row(&id)).await,
            Err(error) => Err(error),
        };

        match result {
            Ok(()) => RowOutcome::Updated {
                uid: submission.uid,
                submitted: submission.payload,
            },
            Err(error) => {
                warn!("[BatchCommitter] Update of row {} (id {}) failed: {}", submission.uid, id, error);
                RowOutcome::Failed {
                    uid: submission.uid,
                    error,
                }
            }
        }
    }
}

fn outgoing_payload(payload: &Payload, config: &EditorConfig) -> Payload {
    payload
        .iter()
        .filter(|(key, _)| !config.is_read_only(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// What folding outcomes into the buffer produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppliedOutcomes {
    pub failures: Vec<CommitFailure>,
    /// Server ids of rows created remotely after they were removed locally
    pub orphaned: Vec<String>,
}

/// Fold remote outcomes back into the buffer and build the failure list.
///
/// Rows are found by `uid`; rows removed while the calls were in flight are
/// skipped, and any that got created anyway are reported as orphans so the
/// caller can delete them. A row edited while in flight keeps (or gains)
/// `modified` even when its call succeeded, since the server only saw the
/// older payload.
pub fn apply_outcomes(buffer: &mut EditBuffer, outcomes: Vec<RowOutcome>) -> AppliedOutcomes {
    let mut failures = Vec::new();
    let mut orphaned = Vec::new();

    for outcome in outcomes {
        match outcome {
            RowOutcome::Created { uid, id, submitted } => {
                let Some(index) = buffer.index_of(&uid) else {
                    warn!(
                        "[BatchCommitter] Created row {} (id {}) was removed locally during commit",
                        uid, id
                    );
                    orphaned.push(id);
                    continue;
                };
                if buffer.assign_id(index, id).is_ok() {
                    buffer.clear_dirty(&[index]);
                    if buffer.row(index).map(|r| &r.payload) != Some(&submitted) {
                        let _ = buffer.mark_modified(index);
                    }
                }
            }
            RowOutcome::Updated { uid, submitted } => {
                let Some(index) = buffer.index_of(&uid) else {
                    continue;
                };
                if buffer.row(index).map(|r| &r.payload) == Some(&submitted) {
                    buffer.clear_dirty(&[index]);
                } else {
                    debug!(
                        "[BatchCommitter] Row {} changed while saving, keeping it modified",
                        uid
                    );
                }
            }
            RowOutcome::Failed { uid, error } => {
                let Some(index) = buffer.index_of(&uid) else {
                    continue;
                };
                if let Some(row) = buffer.row(index) {
                    failures.push(CommitFailure {
                        uid,
                        index,
                        error,
                        row: row.clone(),
                    });
                }
            }
        }
    }

    failures.sort_by_key(|f| f.index);
    AppliedOutcomes { failures, orphaned }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::Result;
    use async_trait::async_trait;
    use linebuf_api::{ServerRow, Value};
    use std::sync::Mutex;

    /// Records calls; fails create batches containing a row whose comment is "fail"
    #[derive(Default)]
    struct ScriptedStore {
        create_calls: Mutex<Vec<usize>>,
        update_calls: Mutex<Vec<String>>,
        finalize_calls: Mutex<Vec<String>>,
        next_id: Mutex<u64>,
    }

    #[async_trait]
    impl LineItemStore for ScriptedStore {
        async fn create_batch(&self, _parent_id: &str, rows: Vec<Payload>) -> Result<Vec<String>> {
            self.create_calls.lock().unwrap().push(rows.len());
            if rows
                .iter()
                .any(|r| r.get("comment") == Some(&Value::from("fail")))
            {
                return Err("HTTP 500".into());
            }
            let mut next = self.next_id.lock().unwrap();
            Ok(rows
                .iter()
                .map(|_| {
                    *next += 1;
                    format!("srv-{}", next)
                })
                .collect())
        }

        async fn update_row(&self, row_id: &str, payload: Payload) -> Result<()> {
            self.update_calls.lock().unwrap().push(row_id.to_string());
            if payload.get("comment") == Some(&Value::from("fail")) {
                return Err("HTTP 409".into());
            }
            Ok(())
        }

        async fn finalize_row(&self, row_id: &str) -> Result<()> {
            self.finalize_calls.lock().unwrap().push(row_id.to_string());
            Ok(())
        }

        async fn delete_row(&self, _row_id: &str) -> Result<()> {
            Ok(())
        }

        async fn list_rows(&self, _parent_id: &str) -> Result<Vec<ServerRow>> {
            Ok(Vec::new())
        }
    }

    fn comment(text: &str) -> Payload {
        Payload::from([("comment".to_string(), Value::from(text))])
    }

    fn committer(store: Arc<ScriptedStore>, config: EditorConfig) -> BatchCommitter {
        BatchCommitter::new(store, config)
    }

    #[test]
    fn test_validate_row() {
        let row = Row::draft(comment("x"));
        assert!(validate_row(&row, &[]).is_ok());
        assert_eq!(
            validate_row(&row, &["operation_id".to_string()]),
            Err(RowError::Validation {
                field: "operation_id".to_string()
            })
        );
    }

    #[test]
    fn test_plan_partitions_and_validates() {
        let store = Arc::new(ScriptedStore::default());
        let config = EditorConfig::default().with_required_fields(["comment"]);
        let committer = committer(store, config);

        let mut buffer = EditBuffer::from_server_rows(vec![
            ServerRow::new("1", comment("a")),
            ServerRow::new("2", comment("b")),
        ]);
        buffer.set_field(0, "discount", Value::Integer(3)).unwrap();
        buffer.add_row(comment("new"));
        buffer.add_row(Payload::new());

        let plan = committer.plan(Some("p"), &buffer).unwrap();
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.creates.len(), 1);
        assert_eq!(plan.rejected.len(), 1);
        assert_eq!(plan.rejected[0].0, buffer.row(3).unwrap().uid);
    }

    #[test]
    fn test_plan_without_parent_refuses_new_rows() {
        let committer = committer(Arc::new(ScriptedStore::default()), EditorConfig::default());
        let mut buffer = EditBuffer::new();
        buffer.add_row(comment("x"));

        assert!(matches!(
            committer.plan(None, &buffer),
            Err(EditorError::MissingParent)
        ));
    }

    #[tokio::test]
    async fn test_chunks_fail_independently() {
        let store = Arc::new(ScriptedStore::default());
        let config = EditorConfig {
            batch_size: 2,
            ..EditorConfig::default()
        };
        let committer = committer(store.clone(), config);

        let mut buffer = EditBuffer::new();
        for text in ["a", "b", "c", "fail", "e"] {
            buffer.add_row(comment(text));
        }

        let plan = committer.plan(Some("p"), &buffer).unwrap();
        let outcomes = committer.submit(Some("p"), plan).await;
        let failures = apply_outcomes(&mut buffer, outcomes).failures;

        let mut sizes = store.create_calls.lock().unwrap().clone();
        sizes.sort();
        assert_eq!(sizes, vec![1, 2, 2]);

        // Chunk {c, fail} failed as a whole
        let failed: Vec<usize> = failures.iter().map(|f| f.index).collect();
        assert_eq!(failed, vec![2, 3]);
        assert_eq!(
            buffer.new_indices().iter().copied().collect::<Vec<_>>(),
            vec![2, 3]
        );
        assert!(buffer.row(0).unwrap().id.is_some());
        assert!(buffer.row(4).unwrap().id.is_some());
    }

    #[tokio::test]
    async fn test_updates_call_finalize_and_fail_per_row() {
        let store = Arc::new(ScriptedStore::default());
        let committer = committer(store.clone(), EditorConfig::default());

        let mut buffer = EditBuffer::from_server_rows(vec![
            ServerRow::new("1", comment("a")),
            ServerRow::new("2", comment("b")),
        ]);
        buffer.set_field(0, "comment", "ok".into()).unwrap();
        buffer.set_field(1, "comment", "fail".into()).unwrap();

        let plan = committer.plan(Some("p"), &buffer).unwrap();
        let outcomes = committer.submit(Some("p"), plan).await;
        let failures = apply_outcomes(&mut buffer, outcomes).failures;

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].index, 1);
        assert_eq!(
            failures[0].error,
            RowError::ServerRejection {
                message: "HTTP 409".to_string()
            }
        );
        assert_eq!(*store.finalize_calls.lock().unwrap(), vec!["1".to_string()]);
        assert_eq!(
            buffer.modified_indices().iter().copied().collect::<Vec<_>>(),
            vec![1]
        );
    }

    #[tokio::test]
    async fn test_read_only_fields_are_not_sent() {
        #[derive(Default)]
        struct CapturingStore {
            sent: Mutex<Vec<Payload>>,
        }

        #[async_trait]
        impl LineItemStore for CapturingStore {
            async fn create_batch(&self, _p: &str, rows: Vec<Payload>) -> Result<Vec<String>> {
                let ids = (0..rows.len()).map(|i| i.to_string()).collect();
                self.sent.lock().unwrap().extend(rows);
                Ok(ids)
            }
            async fn update_row(&self, _id: &str, payload: Payload) -> Result<()> {
                self.sent.lock().unwrap().push(payload);
                Ok(())
            }
            async fn finalize_row(&self, _id: &str) -> Result<()> {
                Ok(())
            }
            async fn delete_row(&self, _id: &str) -> Result<()> {
                Ok(())
            }
            async fn list_rows(&self, _p: &str) -> Result<Vec<ServerRow>> {
                Ok(Vec::new())
            }
        }

        let store = Arc::new(CapturingStore::default());
        let config = EditorConfig::default().with_read_only_fields(["total_amount"]);
        let committer = BatchCommitter::new(store.clone(), config);

        let mut buffer = EditBuffer::from_server_rows(vec![ServerRow::new(
            "1",
            Payload::from([
                ("rate".to_string(), Value::Float(1.5)),
                ("total_amount".to_string(), Value::Float(99.0)),
            ]),
        )]);
        buffer.set_field(0, "rate", Value::Float(2.0)).unwrap();

        let plan = committer.plan(Some("p"), &buffer).unwrap();
        committer.submit(Some("p"), plan).await;

        let sent = store.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(!sent[0].contains_key("total_amount"));
        assert_eq!(sent[0].get("rate"), Some(&Value::Float(2.0)));
    }

    #[test]
    fn test_edit_during_flight_keeps_row_dirty() {
        let mut buffer = EditBuffer::from_server_rows(vec![ServerRow::new("1", comment("a"))]);
        buffer.set_field(0, "comment", "first".into()).unwrap();
        let new_index = buffer.add_row(comment("draft"));

        let update = Submission::capture(buffer.row(0).unwrap());
        let create = Submission::capture(buffer.row(new_index).unwrap());

        // The user keeps typing while the calls are in flight
        buffer.set_field(0, "comment", "second".into()).unwrap();
        buffer.set_field(new_index, "comment", "draft 2".into()).unwrap();

        let failures = apply_outcomes(
            &mut buffer,
            vec![
                RowOutcome::Updated {
                    uid: update.uid,
                    submitted: update.payload,
                },
                RowOutcome::Created {
                    uid: create.uid,
                    id: "9".to_string(),
                    submitted: create.payload,
                },
            ],
        )
        .failures;

        assert!(failures.is_empty());
        assert!(buffer.new_indices().is_empty());
        assert_eq!(
            buffer.modified_indices().iter().copied().collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert_eq!(buffer.row(1).unwrap().id.as_deref(), Some("9"));
    }

    #[test]
    fn test_row_removed_during_create_is_orphaned() {
        let mut buffer = EditBuffer::new();
        let index = buffer.add_row(comment("draft"));
        let create = Submission::capture(buffer.row(index).unwrap());
        buffer.remove_row(index).unwrap();

        let applied = apply_outcomes(
            &mut buffer,
            vec![RowOutcome::Created {
                uid: create.uid,
                id: "9".to_string(),
                submitted: create.payload,
            }],
        );

        assert!(applied.failures.is_empty());
        assert_eq!(applied.orphaned, vec!["9".to_string()]);
        assert!(buffer.is_empty());
    }
}
