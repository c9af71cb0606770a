//! Abstract object store trait.
//!
//! Every store must implement [`ObjectStore`].  The trait uses manually
//! desugared async methods (pinned boxed futures) so it can be used as a
//! trait object behind `Arc<dyn ObjectStore>`.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use crate::errors::StoreError;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// The persisted unit: an encoded state blob plus free-form annotations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateObject {
    /// Namespace part of the key.
    pub namespace: String,
    /// Name part of the key.
    pub name: String,
    /// Encoded state bytes, `None` until the first write.
    pub payload: Option<Bytes>,
    /// Metadata; four reserved keys carry the lock.
    pub annotations: BTreeMap<String, String>,
    /// Store-specific revision as last read. Echoed back on update by
    /// stores that understand it.
    pub resource_version: Option<String>,
    /// Store-native representation as last read, so an update can keep
    /// fields this crate does not model. Stores that have none leave it
    /// `None`.
    pub retained: Option<serde_json::Value>,
}

impl StateObject {
    /// An empty object for `(namespace, name)`, used when nothing is stored yet.
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            ..Self::default()
        }
    }
}

/// Async last-write-wins object store contract.
pub trait ObjectStore: Send + Sync + 'static {
    /// Fetch the object, or `StoreError::NotFound`.
    fn get<'a>(&'a self, namespace: &'a str, name: &'a str) -> StoreFuture<'a, StateObject>;

    /// Create a new object. Fails if one already exists under the key.
    fn create(&self, object: StateObject) -> StoreFuture<'_, StateObject>;

    /// Replace an existing object. Fails with `NotFound` if it is absent.
    fn update(&self, object: StateObject) -> StoreFuture<'_, StateObject>;

    /// Delete the object, or `StoreError::NotFound`.
    fn delete<'a>(&'a self, namespace: &'a str, name: &'a str) -> StoreFuture<'a, ()>;
}
