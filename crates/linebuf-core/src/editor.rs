//! Presentation-facing line-item editor
//!
//! `LineItemEditor` owns the edit buffer and wires the components together:
//! - row mutations go through `EditBuffer` and are mirrored by `PersistenceGuard`
//! - `commit_all` / `retry_failed` run `BatchCommitter` / `RetryCoordinator`
//! - server snapshots are merged by `merge`, or queued while a commit is in flight
//!
//! State lives behind a mutex that is never held across an await. Only one
//! commit or retry may be in flight; the flag is cleared even if the commit
//! future is dropped mid-flight, and a snapshot queued meanwhile is applied
//! then.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use linebuf_api::{BufferError, EditorError, Payload, Row, RowUid, RowView, ServerRow, Value};
use tracing::{debug, info, warn};

use crate::buffer::EditBuffer;
use crate::commit::{apply_outcomes, BatchCommitter, CommitFailure};
use crate::config::EditorConfig;
use crate::deadline::with_deadline;
use crate::merge::{merge, MergeConflict};
use crate::persistence::{PersistenceGuard, RecoverySnapshot};
use crate::retry::RetryCoordinator;
use crate::storage::KeyValueStore;
use crate::traits::LineItemStore;

/// Result of a commit or retry run
#[derive(Debug, Clone, Default)]
pub struct CommitReport {
    /// Rows confirmed by the server in this run
    pub succeeded: usize,
    pub failures: Vec<CommitFailure>,
    /// Everything was saved; the caller should reload from the server
    pub needs_refresh: bool,
}

/// What happened to a server snapshot handed to the editor
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotDisposition {
    Applied { conflicts: Vec<MergeConflict> },
    /// A commit is in flight; the snapshot is applied once it settles
    Queued,
}

struct EditorState {
    parent_id: Option<String>,
    buffer: EditBuffer,
    failures: Vec<CommitFailure>,
    committing: bool,
    queued_snapshot: Option<Vec<ServerRow>>,
    conflicts: Vec<MergeConflict>,
    pending_recovery: Option<RecoverySnapshot>,
}

pub struct LineItemEditor {
    store: Arc<dyn LineItemStore>,
    guard: PersistenceGuard,
    committer: BatchCommitter,
    retry: RetryCoordinator,
    config: EditorConfig,
    state: Mutex<EditorState>,
}

/// Ends a commit run however it ends. A run dropped before it settled still
/// applies the snapshot queued while it was in flight.
struct InFlight<'a> {
    editor: &'a LineItemEditor,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = self.editor.lock();
        if !state.committing {
            return;
        }
        state.committing = false;
        if let Some(snapshot) = state.queued_snapshot.take() {
            debug!("[LineItemEditor] Commit abandoned, applying queued snapshot");
            self.editor.apply_merge(&mut state, &snapshot);
        }
    }
}

impl LineItemEditor {
    /// Editor over an already loaded buffer. No recovery lookup happens.
    pub fn new(
        store: Arc<dyn LineItemStore>,
        kv_store: Arc<dyn KeyValueStore>,
        config: EditorConfig,
        parent_id: Option<String>,
        buffer: EditBuffer,
    ) -> Self {
        Self {
            guard: PersistenceGuard::new(kv_store, &config),
            committer: BatchCommitter::new(store.clone(), config.clone()),
            retry: RetryCoordinator::new(store.clone(), config.clone()),
            store,
            config,
            state: Mutex::new(EditorState {
                parent_id,
                buffer,
                failures: Vec::new(),
                committing: false,
                queued_snapshot: None,
                conflicts: Vec::new(),
                pending_recovery: None,
            }),
        }
    }

    /// Load the rows of `parent_id` and look for a recoverable session.
    ///
    /// A valid stored session is not applied; it is offered through
    /// `pending_recovery` until `restore_recovery` or `discard_recovery`.
    #[tracing::instrument(name = "line_items.mount", skip(store, kv_store, config))]
    pub async fn mount(
        store: Arc<dyn LineItemStore>,
        kv_store: Arc<dyn KeyValueStore>,
        config: EditorConfig,
        parent_id: Option<String>,
    ) -> Result<Self, EditorError> {
        let buffer = match parent_id.as_deref() {
            Some(parent) => {
                let rows = with_deadline(config.row_timeout(), store.list_rows(parent))
                    .await
                    .map_err(|e| EditorError::Remote {
                        message: e.to_string(),
                    })?;
                EditBuffer::from_server_rows(rows)
            }
            None => EditBuffer::new(),
        };

        let editor = Self::new(store, kv_store, config, parent_id, buffer);
        let recovery = editor.guard.load_recovery(editor.parent_id().as_deref())?;
        if recovery.is_some() {
            info!("[LineItemEditor] Unsaved edits found, offering recovery");
        }
        editor.lock().pending_recovery = recovery;
        Ok(editor)
    }

    fn lock(&self) -> MutexGuard<'_, EditorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mirror the buffer to durable storage. Failures are logged, never raised:
    /// losing the recovery copy must not block editing.
    fn mirror(&self, state: &EditorState) {
        if let Err(e) = self.guard.mirror(state.parent_id.as_deref(), &state.buffer) {
            warn!("[LineItemEditor] Failed to mirror edits: {}", e);
        }
    }

    pub fn parent_id(&self) -> Option<String> {
        self.lock().parent_id.clone()
    }

    /// Attach the buffer to a newly created parent record
    pub fn set_parent_id(&self, parent_id: impl Into<String>) -> Result<(), EditorError> {
        let parent_id = parent_id.into();
        let mut state = self.lock();
        self.guard
            .move_entry(state.parent_id.as_deref(), Some(parent_id.as_str()))?;
        state.parent_id = Some(parent_id);
        Ok(())
    }

    pub fn get_rows(&self) -> Vec<RowView> {
        self.lock().buffer.views()
    }

    pub fn row_count(&self) -> usize {
        self.lock().buffer.len()
    }

    /// Copy of the current buffer, for inspection
    pub fn buffer(&self) -> EditBuffer {
        self.lock().buffer.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.lock().buffer.is_dirty()
    }

    pub fn is_committing(&self) -> bool {
        self.lock().committing
    }

    pub fn set_field(
        &self,
        index: usize,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<(), EditorError> {
        let key = key.into();
        if self.config.is_read_only(&key) {
            return Err(BufferError::ReadOnlyField { field: key }.into());
        }
        let mut state = self.lock();
        state.buffer.set_field(index, key, value.into())?;
        self.mirror(&state);
        Ok(())
    }

    pub fn add_row(&self) -> usize {
        self.add_row_with(Payload::new())
    }

    pub fn add_row_with(&self, initial_payload: Payload) -> usize {
        let mut state = self.lock();
        let index = state.buffer.add_row(initial_payload);
        self.mirror(&state);
        index
    }

    pub fn reorder(&self, old_index: usize, new_index: usize) -> Result<(), EditorError> {
        let mut state = self.lock();
        state.buffer.reorder(old_index, new_index)?;
        self.mirror(&state);
        Ok(())
    }

    /// Remove a row locally, then delete it remotely if it was ever saved.
    ///
    /// The local removal stands even if the remote delete fails; the error is
    /// returned so the caller can tell the user.
    #[tracing::instrument(name = "line_items.remove_row", skip(self))]
    pub async fn remove_row(&self, index: usize) -> Result<Row, EditorError> {
        let row = {
            let mut state = self.lock();
            let row = state.buffer.remove_row(index)?;
            state.failures.retain(|f| f.uid != row.uid);
            self.mirror(&state);
            row
        };

        if let Some(id) = row.id.as_deref() {
            with_deadline(self.config.row_timeout(), self.store.delete_row(id))
                .await
                .map_err(|e| {
                    warn!("[LineItemEditor] Remote delete of row {} failed: {}", id, e);
                    EditorError::Remote {
                        message: e.to_string(),
                    }
                })?;
            debug!("[LineItemEditor] Deleted row {} remotely", id);
        }
        Ok(row)
    }

    /// Save every dirty row.
    ///
    /// Row-level errors end up in the failure list. Top-level errors (already
    /// committing, missing parent) abort before any call is made.
    #[tracing::instrument(name = "line_items.commit_all", skip(self))]
    pub async fn commit_all(&self) -> Result<CommitReport, EditorError> {
        let (parent_id, plan) = {
            let mut state = self.lock();
            if state.committing {
                debug!("[LineItemEditor] commit_all ignored, a commit is in flight");
                return Err(EditorError::AlreadyCommitting);
            }
            let plan = self
                .committer
                .plan(state.parent_id.as_deref(), &state.buffer)?;
            if plan.is_empty() {
                return Ok(CommitReport::default());
            }
            state.committing = true;
            (state.parent_id.clone(), plan)
        };
        let in_flight = InFlight { editor: self };

        let attempted = plan.row_count();
        info!("[LineItemEditor] Committing {} rows", attempted);
        let outcomes = self.committer.submit(parent_id.as_deref(), plan).await;

        let (report, orphaned) = {
            let mut state = self.lock();
            let before = state.buffer.dirty_uids();
            let applied = apply_outcomes(&mut state.buffer, outcomes);
            let saved = Self::saved_since(&before, &state.buffer);
            let still_failing = applied.failures.len();
            let report = self.settle(&mut state, attempted, still_failing, applied.failures, &saved);
            (report, applied.orphaned)
        };
        drop(in_flight);

        self.delete_orphans(orphaned).await;
        Ok(report)
    }

    /// Re-send only the rows in the failure list, one at a time
    #[tracing::instrument(name = "line_items.retry_failed", skip(self))]
    pub async fn retry_failed(&self) -> Result<CommitReport, EditorError> {
        self.retry_where(|_| true).await
    }

    /// Re-send a single failed row; other failure entries are left alone
    #[tracing::instrument(name = "line_items.retry_failure", skip(self))]
    pub async fn retry_failure(&self, uid: &RowUid) -> Result<CommitReport, EditorError> {
        self.retry_where(|failure| &failure.uid == uid).await
    }

    async fn retry_where<F>(&self, selected: F) -> Result<CommitReport, EditorError>
    where
        F: Fn(&CommitFailure) -> bool,
    {
        let (parent_id, items, retried) = {
            let mut state = self.lock();
            if state.committing {
                return Err(EditorError::AlreadyCommitting);
            }
            let (chosen, untouched): (Vec<CommitFailure>, Vec<CommitFailure>) =
                state.failures.iter().cloned().partition(|f| selected(f));
            let items = self
                .retry
                .plan(state.parent_id.as_deref(), &state.buffer, &chosen)?;
            if items.is_empty() {
                state.failures = untouched;
                self.mirror(&state);
                return Ok(CommitReport {
                    failures: state.failures.clone(),
                    needs_refresh: !state.buffer.is_dirty(),
                    ..CommitReport::default()
                });
            }
            state.committing = true;
            let retried: BTreeSet<RowUid> = chosen.into_iter().map(|f| f.uid).collect();
            (state.parent_id.clone(), items, retried)
        };
        let in_flight = InFlight { editor: self };

        let attempted = items.len();
        let outcomes = self.retry.submit(parent_id.as_deref(), items).await;

        let (report, orphaned) = {
            let mut state = self.lock();
            let before = state.buffer.dirty_uids();
            let applied = apply_outcomes(&mut state.buffer, outcomes);
            let saved = Self::saved_since(&before, &state.buffer);
            let still_failing = applied.failures.len();

            // Entries outside this retry as they stand now; they may have
            // been dismissed or pruned while the calls were in flight
            let mut failures = applied.failures;
            failures.extend(
                state
                    .failures
                    .iter()
                    .filter(|f| !retried.contains(&f.uid))
                    .cloned(),
            );
            let report = self.settle(&mut state, attempted, still_failing, failures, &saved);
            (report, applied.orphaned)
        };
        drop(in_flight);

        self.delete_orphans(orphaned).await;
        Ok(report)
    }

    /// Rows that were dirty before a run and are clean after it
    fn saved_since(before: &BTreeSet<RowUid>, buffer: &EditBuffer) -> BTreeSet<RowUid> {
        before.difference(&buffer.dirty_uids()).cloned().collect()
    }

    /// Delete rows created remotely after the user removed them locally
    async fn delete_orphans(&self, orphaned: Vec<String>) {
        for id in orphaned {
            match with_deadline(self.config.row_timeout(), self.store.delete_row(&id)).await {
                Ok(()) => debug!("[LineItemEditor] Deleted orphaned row {} remotely", id),
                Err(e) => warn!(
                    "[LineItemEditor] Failed to delete orphaned row {}: {}",
                    id, e
                ),
            }
        }
    }

    /// Record the outcome of a run, update storage and apply a queued snapshot
    fn settle(
        &self,
        state: &mut EditorState,
        attempted: usize,
        still_failing: usize,
        failures: Vec<CommitFailure>,
        saved: &BTreeSet<RowUid>,
    ) -> CommitReport {
        state.committing = false;
        state.failures = failures.clone();

        // Clears the stored entry once nothing is dirty, keeps it otherwise
        self.mirror(state);

        if let Some(snapshot) = state.queued_snapshot.take() {
            debug!("[LineItemEditor] Applying snapshot queued during commit");
            // The snapshot predates this run's writes: rows saved by the run
            // are carried like dirty rows so the older payload cannot win
            for index in Self::resolve(&state.buffer, saved) {
                let _ = state.buffer.mark_modified(index);
            }
            self.apply_merge(state, &snapshot);
            let indices = Self::resolve(&state.buffer, saved);
            state.buffer.clear_dirty(&indices);
            self.mirror(state);
        }

        let report = CommitReport {
            succeeded: attempted.saturating_sub(still_failing),
            needs_refresh: failures.is_empty(),
            failures,
        };
        info!(
            "[LineItemEditor] Run settled: {} succeeded, {} failed",
            report.succeeded,
            report.failures.len()
        );
        report
    }

    fn resolve(buffer: &EditBuffer, uids: &BTreeSet<RowUid>) -> Vec<usize> {
        uids.iter().filter_map(|uid| buffer.index_of(uid)).collect()
    }

    fn apply_merge(&self, state: &mut EditorState, server_rows: &[ServerRow]) -> Vec<MergeConflict> {
        let outcome = merge(&state.buffer, server_rows);
        state.buffer = outcome.buffer;
        for conflict in &outcome.conflicts {
            if !state.conflicts.contains(conflict) {
                state.conflicts.push(conflict.clone());
            }
        }
        // Conflicts only concern rows that are still present
        let buffer = &state.buffer;
        state.conflicts.retain(|c| buffer.index_of(&c.uid).is_some());
        self.mirror(state);
        outcome.conflicts
    }

    /// Merge a fresh server snapshot, or queue it while a commit is in flight
    pub fn apply_server_snapshot(&self, server_rows: Vec<ServerRow>) -> SnapshotDisposition {
        let mut state = self.lock();
        if state.committing {
            debug!(
                "[LineItemEditor] Queueing snapshot of {} rows until commit settles",
                server_rows.len()
            );
            state.queued_snapshot = Some(server_rows);
            return SnapshotDisposition::Queued;
        }
        // Anything still queued is older than this snapshot
        state.queued_snapshot = None;
        let conflicts = self.apply_merge(&mut state, &server_rows);
        SnapshotDisposition::Applied { conflicts }
    }

    /// Fetch the parent's rows from the server and merge them
    pub async fn refresh(&self) -> Result<SnapshotDisposition, EditorError> {
        let Some(parent_id) = self.parent_id() else {
            return Err(EditorError::MissingParent);
        };
        let rows = with_deadline(self.config.row_timeout(), self.store.list_rows(&parent_id))
            .await
            .map_err(|e| EditorError::Remote {
                message: e.to_string(),
            })?;
        Ok(self.apply_server_snapshot(rows))
    }

    /// Failure entries with indices and rows re-resolved against the buffer
    pub fn failure_list(&self) -> Vec<CommitFailure> {
        let state = self.lock();
        state
            .failures
            .iter()
            .filter_map(|failure| {
                let index = state.buffer.index_of(&failure.uid)?;
                let row = state.buffer.row(index)?.clone();
                Some(CommitFailure {
                    uid: failure.uid.clone(),
                    index,
                    error: failure.error.clone(),
                    row,
                })
            })
            .collect()
    }

    /// Drop a failure entry without touching the row's dirtiness
    pub fn dismiss_failure(&self, uid: &RowUid) -> bool {
        let mut state = self.lock();
        let before = state.failures.len();
        state.failures.retain(|f| &f.uid != uid);
        state.failures.len() != before
    }

    /// Clean rows whose ids went missing from a server snapshot and were kept
    pub fn merge_conflicts(&self) -> Vec<MergeConflict> {
        self.lock().conflicts.clone()
    }

    /// When the stored session was saved, if one is waiting for a decision
    pub fn pending_recovery(&self) -> Option<DateTime<Utc>> {
        self.lock().pending_recovery.as_ref().map(|r| r.saved_at)
    }

    /// Replace the buffer with the stored session. Returns false if there was none.
    pub fn restore_recovery(&self) -> bool {
        let mut state = self.lock();
        let Some(snapshot) = state.pending_recovery.take() else {
            return false;
        };
        info!(
            "[LineItemEditor] Restoring {} rows from recovery entry",
            snapshot.buffer.len()
        );
        state.buffer = snapshot.buffer;
        state.failures.clear();
        self.mirror(&state);
        true
    }

    /// Forget the stored session
    pub fn discard_recovery(&self) -> Result<(), EditorError> {
        let mut state = self.lock();
        state.pending_recovery = None;
        self.guard.clear(state.parent_id.as_deref())?;
        // Edits made since mount are still worth keeping
        self.mirror(&state);
        Ok(())
    }
}
