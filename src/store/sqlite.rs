//! SQLite object store.
//!
//! State objects live in one table inside a single SQLite database, with
//! annotations kept as a JSON text column.  This store is useful for
//! single-node deployments outside Kubernetes.
//!
//! Because `rusqlite::Connection` is `!Send`, it is wrapped in a
//! `std::sync::Mutex` behind an `Arc` and every database operation runs
//! on `tokio::task::spawn_blocking`.

use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use axum::http::StatusCode;

use super::backend::{ObjectStore, StateObject, StoreFuture};
use crate::errors::{CollaboratorError, StoreError};

/// SQLite-backed state object store.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at `db_path` and initialise
    /// the table.
    ///
    /// Configures WAL journal mode and a 5-second busy timeout.
    pub fn new(db_path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(db_path)?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA busy_timeout=5000;\
             PRAGMA synchronous=NORMAL;",
        )?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS state_objects (\
                 namespace   TEXT NOT NULL,\
                 name        TEXT NOT NULL,\
                 payload     BLOB,\
                 annotations TEXT NOT NULL DEFAULT '{}',\
                 revision    INTEGER NOT NULL DEFAULT 1,\
                 PRIMARY KEY (namespace, name)\
             );",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|e| CollaboratorError::transport(format!("Mutex poisoned: {e}")))?;
            f(&conn)
        })
        .await
        .map_err(|e| CollaboratorError::transport(format!("sqlite task failed: {e}")))?
    }
}

fn sql_error(e: rusqlite::Error) -> StoreError {
    CollaboratorError::transport(format!("sqlite: {e}")).into()
}

fn encode_annotations(annotations: &BTreeMap<String, String>) -> Result<String, StoreError> {
    serde_json::to_string(annotations)
        .map_err(|e| CollaboratorError::transport(format!("encode annotations: {e}")).into())
}

fn read_object(conn: &Connection, namespace: &str, name: &str) -> Result<Option<StateObject>, StoreError> {
    let row = conn
        .query_row(
            "SELECT payload, annotations, revision FROM state_objects \
             WHERE namespace = ?1 AND name = ?2",
            params![namespace, name],
            |row| {
                let payload: Option<Vec<u8>> = row.get(0)?;
                let annotations: String = row.get(1)?;
                let revision: i64 = row.get(2)?;
                Ok((payload, annotations, revision))
            },
        )
        .optional()
        .map_err(sql_error)?;

    let Some((payload, annotations, revision)) = row else {
        return Ok(None);
    };
    let annotations: BTreeMap<String, String> = serde_json::from_str(&annotations)
        .map_err(|e| CollaboratorError::transport(format!("decode annotations: {e}")))?;

    Ok(Some(StateObject {
        namespace: namespace.to_string(),
        name: name.to_string(),
        payload: payload.map(Bytes::from),
        annotations,
        resource_version: Some(revision.to_string()),
        retained: None,
    }))
}

fn not_found(namespace: &str, name: &str) -> StoreError {
    StoreError::NotFound {
        namespace: namespace.to_string(),
        name: name.to_string(),
    }
}

impl ObjectStore for SqliteStore {
    fn get<'a>(&'a self, namespace: &'a str, name: &'a str) -> StoreFuture<'a, StateObject> {
        let (ns, n) = (namespace.to_string(), name.to_string());
        Box::pin(async move {
            self.with_conn(move |conn| {
                read_object(conn, &ns, &n)?.ok_or_else(|| not_found(&ns, &n))
            })
            .await
        })
    }

    fn create(&self, object: StateObject) -> StoreFuture<'_, StateObject> {
        Box::pin(async move {
            self.with_conn(move |conn| {
                let annotations = encode_annotations(&object.annotations)?;
                let inserted = conn
                    .execute(
                        "INSERT OR IGNORE INTO state_objects (namespace, name, payload, annotations) \
                         VALUES (?1, ?2, ?3, ?4)",
                        params![
                            object.namespace,
                            object.name,
                            object.payload.as_deref(),
                            annotations
                        ],
                    )
                    .map_err(sql_error)?;
                if inserted == 0 {
                    return Err(CollaboratorError::with_status(
                        StatusCode::CONFLICT,
                        format!(
                            "state object {}/{} already exists",
                            object.namespace, object.name
                        ),
                    )
                    .into());
                }
                read_object(conn, &object.namespace, &object.name)?
                    .ok_or_else(|| not_found(&object.namespace, &object.name))
            })
            .await
        })
    }

    fn update(&self, object: StateObject) -> StoreFuture<'_, StateObject> {
        Box::pin(async move {
            self.with_conn(move |conn| {
                let annotations = encode_annotations(&object.annotations)?;
                let updated = conn
                    .execute(
                        "UPDATE state_objects SET payload = ?3, annotations = ?4, revision = revision + 1 \
                         WHERE namespace = ?1 AND name = ?2",
                        params![
                            object.namespace,
                            object.name,
                            object.payload.as_deref(),
                            annotations
                        ],
                    )
                    .map_err(sql_error)?;
                if updated == 0 {
                    return Err(not_found(&object.namespace, &object.name));
                }
                read_object(conn, &object.namespace, &object.name)?
                    .ok_or_else(|| not_found(&object.namespace, &object.name))
            })
            .await
        })
    }

    fn delete<'a>(&'a self, namespace: &'a str, name: &'a str) -> StoreFuture<'a, ()> {
        let (ns, n) = (namespace.to_string(), name.to_string());
        Box::pin(async move {
            self.with_conn(move |conn| {
                let deleted = conn
                    .execute(
                        "DELETE FROM state_objects WHERE namespace = ?1 AND name = ?2",
                        params![ns, n],
                    )
                    .map_err(sql_error)?;
                if deleted == 0 {
                    Err(not_found(&ns, &n))
                } else {
                    Ok(())
                }
            })
            .await
        })
    }
}
