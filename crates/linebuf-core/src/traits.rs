//! Seams to the outside world
//!
//! The remote line-item store is consumed through `LineItemStore`. It is
//! designed to be backed by an HTTP client in production and by
//! `linebuf-fake` in tests.

use async_trait::async_trait;
use linebuf_api::{Payload, ServerRow};

// Define Result type using Send + Sync for error
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

// Define MaybeSendSync trait alias for WASM compatibility
#[cfg(not(target_arch = "wasm32"))]
pub trait MaybeSendSync: Send + Sync {}
#[cfg(not(target_arch = "wasm32"))]
impl<T: Send + Sync + ?Sized> MaybeSendSync for T {}

#[cfg(target_arch = "wasm32")]
pub trait MaybeSendSync {}
#[cfg(target_arch = "wasm32")]
impl<T: ?Sized> MaybeSendSync for T {}

/// Remote store holding the line items of a parent record.
///
/// The server is the source of truth. None of these calls report partial
/// results: a call either succeeds for everything it carried or fails.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait LineItemStore: MaybeSendSync {
    /// Create all rows in one call. Returns the server ids in input order.
    async fn create_batch(&self, parent_id: &str, rows: Vec<Payload>) -> Result<Vec<String>>;

    async fn update_row(&self, row_id: &str, payload: Payload) -> Result<()>;

    /// Server-side validation step that follows every update
    async fn finalize_row(&self, row_id: &str) -> Result<()>;

    async fn delete_row(&self, row_id: &str) -> Result<()>;

    /// Current canonical rows of a parent, in display order
    async fn list_rows(&self, parent_id: &str) -> Result<Vec<ServerRow>>;
}
