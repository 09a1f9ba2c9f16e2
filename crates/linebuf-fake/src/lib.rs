//! In-memory line-item store for tests and offline demos
//!
//! `FakeLineItemStore` implements `LineItemStore` on top of a map of parent id
//! to rows:
//! - writes go to the map and are emitted on a broadcast channel
//! - failures and latency can be scripted per operation
//! - every call is recorded, so tests can assert on what was sent

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use linebuf_api::{Payload, ServerRow, Value};
use linebuf_core::{LineItemStore, Result};
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOperation {
    CreateBatch,
    UpdateRow,
    FinalizeRow,
    DeleteRow,
    ListRows,
}

/// One recorded call
#[derive(Debug, Clone, PartialEq)]
pub struct FakeCall {
    pub operation: FakeOperation,
    /// Parent id for create/list, row id otherwise
    pub target: String,
    /// Payloads carried by the call, empty for finalize/delete/list
    pub payloads: Vec<Payload>,
}

/// Write observed by the fake, as seen by subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum FakeChange {
    Created { parent_id: String, ids: Vec<String> },
    Updated { id: String },
    Finalized { id: String },
    Deleted { id: String },
}

/// Payloads carrying `field == value` are rejected by create and update
#[derive(Debug, Clone)]
struct PayloadRule {
    field: String,
    value: Value,
    message: String,
}

#[derive(Default)]
struct FakeState {
    rows: HashMap<String, Vec<ServerRow>>,
    finalized: Vec<String>,
    calls: Vec<FakeCall>,
    fail_next: HashMap<FakeOperation, VecDeque<String>>,
    latency: HashMap<FakeOperation, Duration>,
    rejections: Vec<PayloadRule>,
}

impl FakeState {
    fn find_row_mut(&mut self, row_id: &str) -> Option<&mut ServerRow> {
        self.rows
            .values_mut()
            .flat_map(|rows| rows.iter_mut())
            .find(|row| row.id == row_id)
    }

    fn rejection_for(&self, payload: &Payload) -> Option<String> {
        self.rejections
            .iter()
            .find(|rule| payload.get(&rule.field) == Some(&rule.value))
            .map(|rule| rule.message.clone())
    }
}

/// Fake remote store, cheap to clone; clones share state
#[derive(Clone)]
pub struct FakeLineItemStore {
    state: Arc<Mutex<FakeState>>,
    next_id: Arc<AtomicU64>,
    change_tx: broadcast::Sender<FakeChange>,
}

impl Default for FakeLineItemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeLineItemStore {
    pub fn new() -> Self {
        let (change_tx, _) = broadcast::channel(1000);
        Self {
            state: Arc::new(Mutex::new(FakeState::default())),
            next_id: Arc::new(AtomicU64::new(1)),
            change_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FakeChange> {
        self.change_tx.subscribe()
    }

    fn emit_change(&self, change: FakeChange) {
        // No receivers is fine
        let _ = self.change_tx.send(change);
    }

    fn allocate_id(&self) -> String {
        format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Put rows on the server as if another client created them
    pub fn seed(&self, parent_id: &str, payloads: Vec<Payload>) -> Vec<String> {
        let rows: Vec<ServerRow> = payloads
            .into_iter()
            .map(|payload| ServerRow::new(self.allocate_id(), payload))
            .collect();
        let ids = rows.iter().map(|r| r.id.clone()).collect();
        self.lock()
            .rows
            .entry(parent_id.to_string())
            .or_default()
            .extend(rows);
        ids
    }

    /// Change a row behind the editor's back
    pub fn external_update(&self, row_id: &str, payload: Payload) -> bool {
        let updated = match self.lock().find_row_mut(row_id) {
            Some(row) => {
                row.payload = payload;
                true
            }
            None => false,
        };
        if updated {
            self.emit_change(FakeChange::Updated {
                id: row_id.to_string(),
            });
        }
        updated
    }

    /// Delete a row behind the editor's back
    pub fn external_delete(&self, row_id: &str) -> bool {
        let removed = remove_row(&mut self.lock(), row_id);
        if removed {
            self.emit_change(FakeChange::Deleted {
                id: row_id.to_string(),
            });
        }
        removed
    }

    /// Current server rows of a parent
    pub fn snapshot(&self, parent_id: &str) -> Vec<ServerRow> {
        self.lock().rows.get(parent_id).cloned().unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<FakeCall> {
        self.lock().calls.clone()
    }

    pub fn calls_of(&self, operation: FakeOperation) -> Vec<FakeCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn is_finalized(&self, row_id: &str) -> bool {
        self.lock().finalized.iter().any(|id| id == row_id)
    }

    /// Fail the next call of `operation` with `message`. Stacks.
    pub fn fail_next(&self, operation: FakeOperation, message: impl Into<String>) {
        self.lock()
            .fail_next
            .entry(operation)
            .or_default()
            .push_back(message.into());
    }

    /// Reject every create or update carrying `field == value`
    pub fn reject_payloads_with(
        &self,
        field: impl Into<String>,
        value: impl Into<Value>,
        message: impl Into<String>,
    ) {
        self.lock().rejections.push(PayloadRule {
            field: field.into(),
            value: value.into(),
            message: message.into(),
        });
    }

    pub fn clear_rejections(&self) {
        self.lock().rejections.clear();
    }

    /// Delay every call of `operation`, e.g. to trip a deadline
    pub fn set_latency(&self, operation: FakeOperation, latency: Duration) {
        self.lock().latency.insert(operation, latency);
    }

    pub fn clear_latency(&self) {
        self.lock().latency.clear();
    }

    /// Record the call, wait out any latency, then pop a scripted failure
    async fn enter(&self, call: FakeCall) -> Result<()> {
        let operation = call.operation;
        let latency = {
            let mut state = self.lock();
            state.calls.push(call);
            state.latency.get(&operation).copied()
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let scripted = self
            .lock()
            .fail_next
            .get_mut(&operation)
            .and_then(|queue| queue.pop_front());
        match scripted {
            Some(message) => {
                debug!("[FakeLineItemStore] Scripted failure for {:?}: {}", operation, message);
                Err(anyhow!(message).into())
            }
            None => Ok(()),
        }
    }
}

fn remove_row(state: &mut FakeState, row_id: &str) -> bool {
    for rows in state.rows.values_mut() {
        if let Some(pos) = rows.iter().position(|r| r.id == row_id) {
            rows.remove(pos);
            return true;
        }
    }
    false
}

#[async_trait]
impl LineItemStore for FakeLineItemStore {
    async fn create_batch(&self, parent_id: &str, rows: Vec<Payload>) -> Result<Vec<String>> {
        self.enter(FakeCall {
            operation: FakeOperation::CreateBatch,
            target: parent_id.to_string(),
            payloads: rows.clone(),
        })
        .await?;

        let ids = {
            let mut state = self.lock();
            if let Some(message) = rows.iter().find_map(|p| state.rejection_for(p)) {
                return Err(anyhow!(message).into());
            }
            let created: Vec<ServerRow> = rows
                .into_iter()
                .map(|payload| ServerRow::new(self.allocate_id(), payload))
                .collect();
            let ids: Vec<String> = created.iter().map(|r| r.id.clone()).collect();
            state
                .rows
                .entry(parent_id.to_string())
                .or_default()
                .extend(created);
            ids
        };

        debug!("[FakeLineItemStore] Created {} rows under {}", ids.len(), parent_id);
        self.emit_change(FakeChange::Created {
            parent_id: parent_id.to_string(),
            ids: ids.clone(),
        });
        Ok(ids)
    }

    async fn update_row(&self, row_id: &str, payload: Payload) -> Result<()> {
        self.enter(FakeCall {
            operation: FakeOperation::UpdateRow,
            target: row_id.to_string(),
            payloads: vec![payload.clone()],
        })
        .await?;

        {
            let mut state = self.lock();
            if let Some(message) = state.rejection_for(&payload) {
                return Err(anyhow!(message).into());
            }
            let Some(row) = state.find_row_mut(row_id) else {
                return Err(anyhow!("Row not found: {}", row_id).into());
            };
            row.payload = payload;
            state.finalized.retain(|id| id != row_id);
        }

        self.emit_change(FakeChange::Updated {
            id: row_id.to_string(),
        });
        Ok(())
    }

    async fn finalize_row(&self, row_id: &str) -> Result<()> {
        self.enter(FakeCall {
            operation: FakeOperation::FinalizeRow,
            target: row_id.to_string(),
            payloads: Vec::new(),
        })
        .await?;

        {
            let mut state = self.lock();
            if state.find_row_mut(row_id).is_none() {
                return Err(anyhow!("Row not found: {}", row_id).into());
            }
            state.finalized.push(row_id.to_string());
        }

        self.emit_change(FakeChange::Finalized {
            id: row_id.to_string(),
        });
        Ok(())
    }

    async fn delete_row(&self, row_id: &str) -> Result<()> {
        self.enter(FakeCall {
            operation: FakeOperation::DeleteRow,
            target: row_id.to_string(),
            payloads: Vec::new(),
        })
        .await?;

        if !remove_row(&mut self.lock(), row_id) {
            return Err(anyhow!("Row not found: {}", row_id).into());
        }
        self.emit_change(FakeChange::Deleted {
            id: row_id.to_string(),
        });
        Ok(())
    }

    async fn list_rows(&self, parent_id: &str) -> Result<Vec<ServerRow>> {
        self.enter(FakeCall {
            operation: FakeOperation::ListRows,
            target: parent_id.to_string(),
            payloads: Vec::new(),
        })
        .await?;
        Ok(self.snapshot(parent_id))
    }
}
