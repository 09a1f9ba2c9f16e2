//! Retry of rows that failed a previous commit
//!
//! Retries always use single-row semantics: a row that was part of a failed
//! create-batch chunk is re-created on its own, never re-batched. Rows are
//! retried one at a time, in failure-list order.

use std::sync::Arc;

use linebuf_api::{EditorError, RowError};
use tracing::{debug, info};

use crate::buffer::EditBuffer;
use crate::commit::{validate_row, BatchCommitter, CommitFailure, RowOutcome, Submission};
use crate::config::EditorConfig;
use crate::traits::LineItemStore;

/// What a retry will do for one failure entry
#[derive(Debug, Clone)]
pub enum RetryItem {
    Send(Submission),
    /// Still fails local validation; reported again without a call
    Reject(Submission, RowError),
}

pub struct RetryCoordinator {
    committer: BatchCommitter,
    required_fields: Vec<String>,
}

impl RetryCoordinator {
    pub fn new(store: Arc<dyn LineItemStore>, config: EditorConfig) -> Self {
        Self {
            required_fields: config.required_fields.clone(),
            committer: BatchCommitter::new(store, config),
        }
    }

    /// Resolve failure entries against the current buffer by `uid`.
    ///
    /// Entries whose row is gone or no longer dirty are dropped; the current
    /// payload is what gets sent, not the one that failed.
    pub fn plan(
        &self,
        parent_id: Option<&str>,
        buffer: &EditBuffer,
        failures: &[CommitFailure],
    ) -> Result<Vec<RetryItem>, EditorError> {
        let dirty = buffer.dirty_indices();
        let mut items = Vec::with_capacity(failures.len());

        for failure in failures {
            let Some(index) = buffer.index_of(&failure.uid) else {
                debug!("[RetryCoordinator] Row {} no longer exists, skipping", failure.uid);
                continue;
            };
            if !dirty.contains(&index) {
                debug!("[RetryCoordinator] Row {} is already synced, skipping", failure.uid);
                continue;
            }
            let Some(row) = buffer.row(index) else {
                continue;
            };
            if row.id.is_none() && parent_id.is_none() {
                return Err(EditorError::MissingParent);
            }
            let submission = Submission::capture(row);
            match validate_row(row, &self.required_fields) {
                Ok(()) => items.push(RetryItem::Send(submission)),
                Err(error) => items.push(RetryItem::Reject(submission, error)),
            }
        }

        Ok(items)
    }

    /// Re-send each item on its own, sequentially
    #[tracing::instrument(name = "line_items.retry.submit", skip(self, items), fields(rows = items.len()))]
    pub async fn submit(&self, parent_id: Option<&str>, items: Vec<RetryItem>) -> Vec<RowOutcome> {
        let parent_id = parent_id.unwrap_or_default();
        let mut outcomes = Vec::with_capacity(items.len());

        for item in items {
            let outcome = match item {
                RetryItem::Reject(submission, error) => RowOutcome::Failed {
                    uid: submission.uid,
                    error,
                },
                RetryItem::Send(submission) if submission.id.is_none() => {
                    self.committer.create_single(parent_id, submission).await
                }
                RetryItem::Send(submission) => self.committer.update_single(submission).await,
            };
            outcomes.push(outcome);
        }

        let failed = outcomes
            .iter()
            .filter(|o| matches!(o, RowOutcome::Failed { .. }))
            .count();
        info!(
            "[RetryCoordinator] Retried {} rows, {} still failing",
            outcomes.len(),
            failed
        );
        outcomes
    }
}
