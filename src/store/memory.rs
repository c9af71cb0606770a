//! In-memory object store.
//!
//! Objects are held in a `tokio::sync::RwLock<HashMap<...>>` keyed by
//! `(namespace, name)`.  Nothing survives a restart; this store is meant
//! for development and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::http::StatusCode;

use super::backend::{ObjectStore, StateObject, StoreFuture};
use crate::errors::{CollaboratorError, StoreError};

type Key = (String, String);

/// In-memory last-write-wins store.
#[derive(Default)]
pub struct MemoryStore {
    objects: tokio::sync::RwLock<HashMap<Key, StateObject>>,
    /// Monotonic counter handed out as `resource_version`.
    revision: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    #[cfg(test)]
    pub(crate) async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    fn stamp(&self, mut object: StateObject) -> StateObject {
        let revision = self.revision.fetch_add(1, Ordering::Relaxed) + 1;
        object.resource_version = Some(revision.to_string());
        object
    }
}

fn not_found(namespace: &str, name: &str) -> StoreError {
    StoreError::NotFound {
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

impl ObjectStore for MemoryStore {
    fn get<'a>(&'a self, namespace: &'a str, name: &'a str) -> StoreFuture<'a, StateObject> {
        Box::pin(async move {
            let objects = self.objects.read().await;
            objects
                .get(&(namespace.to_string(), name.to_string()))
                .cloned()
                .ok_or_else(|| not_found(namespace, name))
        })
    }

    fn create(&self, object: StateObject) -> StoreFuture<'_, StateObject> {
        Box::pin(async move {
            let mut objects = self.objects.write().await;
            let key = (object.namespace.clone(), object.name.clone());
            if objects.contains_key(&key) {
                return Err(StoreError::from(CollaboratorError::with_status(
                    StatusCode::CONFLICT,
                    format!("state object {}/{} already exists", key.0, key.1),
                )));
            }
            let stored = self.stamp(object);
            objects.insert(key, stored.clone());
            Ok(stored)
        })
    }

    fn update(&self, object: StateObject) -> StoreFuture<'_, StateObject> {
        Box::pin(async move {
            let mut objects = self.objects.write().await;
            let key = (object.namespace.clone(), object.name.clone());
            if !objects.contains_key(&key) {
                return Err(not_found(&key.0, &key.1));
            }
            let stored = self.stamp(object);
            objects.insert(key, stored.clone());
            Ok(stored)
        })
    }

    fn delete<'a>(&'a self, namespace: &'a str, name: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut objects = self.objects.write().await;
            objects
                .remove(&(namespace.to_string(), name.to_string()))
                .map(|_| ())
                .ok_or_else(|| not_found(namespace, name))
        })
    }
}
