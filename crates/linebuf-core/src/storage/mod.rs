//! Durable key-value storage for recovery entries
//!
//! Writes are synchronous: mirroring happens inside the same step as the
//! buffer mutation that triggered it.

pub mod file;
pub mod memory;

pub use file::FileKeyValueStore;
pub use memory::MemoryKeyValueStore;

use crate::traits::{MaybeSendSync, Result};

/// Generic string key-value store (browser local storage, a file, a test map)
pub trait KeyValueStore: MaybeSendSync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: String) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}
