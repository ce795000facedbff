//! Byte-level storage underneath the revisioned store.

use crate::Result;
use bytes::Bytes;

/// Ordered byte key-value store. Values written by `RevisionedStore` carry
/// their revision envelope; this layer does not interpret them.
pub trait KVStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Removing a missing key is not an error
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Every entry whose key starts with `prefix`, in ascending key order
    fn scan(&self, prefix: &[u8]) -> Result<Vec<(Bytes, Bytes)>>;

    /// Open a write transaction. Only one can be open at a time.
    fn transaction(&self) -> Result<Box<dyn Transaction>>;
}

/// A write transaction. Reads see the transaction's own writes; dropping it
/// without `commit` discards them.
pub trait Transaction: Send {
    fn get(&self, key: &[u8]) -> Result<Option<Bytes>>;

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    fn delete(&mut self, key: &[u8]) -> Result<()>;

    fn commit(self: Box<Self>) -> Result<()>;

    fn rollback(self: Box<Self>) -> Result<()>;
}
