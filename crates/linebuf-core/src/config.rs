//! Editor configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a line-item editor
///
/// Loadable from YAML or JSON; every field has a default so partial
/// documents are accepted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorConfig {
    /// Number of new rows sent per create-batch call
    pub batch_size: usize,
    /// Deadline for one create-batch call
    pub batch_timeout_ms: u64,
    /// Deadline for each single-row call (update, finalize, delete, retry)
    pub row_timeout_ms: u64,
    /// Recovery entries older than this are discarded without prompting
    pub recovery_max_age_ms: i64,
    /// Prefix of the durable store key for recovery entries
    pub storage_key_prefix: String,
    /// Key suffix used while the parent record does not exist yet
    pub draft_key: String,
    /// Fields that must be non-blank before a row may be sent
    pub required_fields: Vec<String>,
    /// Server-computed fields: never edited locally, never sent
    pub read_only_fields: Vec<String>,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_timeout_ms: 30_000,
            row_timeout_ms: 15_000,
            recovery_max_age_ms: 24 * 60 * 60 * 1000,
            storage_key_prefix: "line-items-draft".to_string(),
            draft_key: "new".to_string(),
            required_fields: Vec::new(),
            read_only_fields: Vec::new(),
        }
    }
}

impl EditorConfig {
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn row_timeout(&self) -> Duration {
        Duration::from_millis(self.row_timeout_ms)
    }

    /// Chunk size, never below one
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.max(1)
    }

    pub fn is_read_only(&self, field: &str) -> bool {
        self.read_only_fields.iter().any(|f| f == field)
    }

    pub fn with_required_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_read_only_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.read_only_fields = fields.into_iter().map(Into::into).collect();
        self
    }
}
