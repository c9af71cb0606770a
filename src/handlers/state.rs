//! Per-method state handlers.
//!
//! Each handler receives the snapshot fetched by [`super::dispatch`] and
//! commits at most one store write.  Lock checks run against that
//! snapshot.  The ConfigMap store echoes the snapshot's resource version,
//! so the API server rejects an update that raced another writer; the
//! local stores are last-write-wins.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tracing::{debug, info, warn};

use super::StateRequest;
use crate::authz::{self, Action};
use crate::errors::{BackendError, StoreError};
use crate::lock::{self, LockConflict, LockRecord, LockState};
use crate::metrics::LOCK_CONFLICTS_TOTAL;
use crate::store::backend::StateObject;
use crate::AppState;

/// GET: return the decoded payload, or an empty 200 when nothing is stored.
pub fn get_state(state: &AppState, request: StateRequest) -> Result<Response, BackendError> {
    let payload = match request.object.payload {
        Some(stored) if !stored.is_empty() => stored,
        _ => return Ok(StatusCode::OK.into_response()),
    };
    let raw = state.codec.decode(&payload).map_err(|e| {
        warn!(
            "failed to decode state {}/{}: {}",
            request.namespace, request.name, e
        );
        e
    })?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        raw,
    )
        .into_response())
}

/// POST: replace the payload, creating the object if needed.
pub async fn write_state(state: &AppState, request: StateRequest) -> Result<Response, BackendError> {
    let StateRequest {
        namespace,
        name,
        identity,
        mut object,
        exists,
        lock_token,
        body,
        ..
    } = request;

    authz::authorize(
        state.authorizer.as_ref(),
        &identity,
        &namespace,
        &name,
        Action::upsert(exists),
    )
    .await?;

    let current = LockState::from_annotations(&object.annotations);
    lock::guard_write(lock_token.as_deref(), &current).map_err(|c| conflict("write", &namespace, &name, c))?;

    let encoded = state.codec.encode(&body)?;
    object.payload = Some(Bytes::from(encoded));

    persist(state, object, exists).await?;
    info!(user = %identity.username, "wrote state {}/{}", namespace, name);
    Ok(StatusCode::OK.into_response())
}

/// DELETE: remove the object. Deleting something already gone succeeds.
pub async fn delete_state(state: &AppState, request: StateRequest) -> Result<Response, BackendError> {
    let StateRequest {
        namespace,
        name,
        identity,
        object,
        lock_token,
        ..
    } = request;

    authz::authorize(
        state.authorizer.as_ref(),
        &identity,
        &namespace,
        &name,
        Action::Delete,
    )
    .await?;

    let current = LockState::from_annotations(&object.annotations);
    lock::guard_write(lock_token.as_deref(), &current).map_err(|c| conflict("delete", &namespace, &name, c))?;

    match state.store.delete(&namespace, &name).await {
        Ok(()) => {
            info!(user = %identity.username, "deleted state {}/{}", namespace, name);
        }
        Err(StoreError::NotFound { .. }) => {
            debug!("state {}/{} already absent", namespace, name);
        }
        Err(e) => {
            warn!("failed to delete state {}/{}: {}", namespace, name, e);
            return Err(e.into());
        }
    }
    Ok(StatusCode::OK.into_response())
}

/// LOCK: take the lock, creating an empty object if needed.
pub async fn lock_state(state: &AppState, request: StateRequest) -> Result<Response, BackendError> {
    let StateRequest {
        namespace,
        name,
        identity,
        mut object,
        exists,
        body,
        ..
    } = request;

    authz::authorize(
        state.authorizer.as_ref(),
        &identity,
        &namespace,
        &name,
        Action::upsert(exists),
    )
    .await?;

    let requested = parse_lock_record(&body)?;
    let current = LockState::from_annotations(&object.annotations);
    let next = lock::acquire(requested, &current).map_err(|c| conflict("lock", &namespace, &name, c))?;
    next.apply_to(&mut object.annotations);

    persist(state, object, exists).await?;
    info!(
        user = %identity.username,
        lock_id = next.id(),
        "locked state {}/{}",
        namespace,
        name
    );
    Ok(StatusCode::OK.into_response())
}

/// UNLOCK: release the lock. The object must already exist.
///
/// An empty body is a force unlock, honoured only when the configuration
/// allows it.
pub async fn unlock_state(state: &AppState, request: StateRequest) -> Result<Response, BackendError> {
    let StateRequest {
        namespace,
        name,
        identity,
        mut object,
        exists,
        body,
        ..
    } = request;

    if !exists {
        return Err(BackendError::NotFound);
    }

    authz::authorize(
        state.authorizer.as_ref(),
        &identity,
        &namespace,
        &name,
        Action::Update,
    )
    .await?;

    let requested = if body.is_empty() {
        None
    } else {
        Some(parse_lock_record(&body)?)
    };
    let current = LockState::from_annotations(&object.annotations);
    let next = lock::release(
        requested.as_ref(),
        &current,
        state.config.locking.allow_force_unlock,
    )
    .map_err(|c| conflict("unlock", &namespace, &name, c))?;
    next.apply_to(&mut object.annotations);

    persist(state, object, true).await?;
    info!(
        user = %identity.username,
        forced = requested.is_none(),
        "unlocked state {}/{}",
        namespace,
        name
    );
    Ok(StatusCode::OK.into_response())
}

fn parse_lock_record(body: &[u8]) -> Result<LockRecord, BackendError> {
    serde_json::from_slice(body).map_err(|e| BackendError::MalformedBody(e.to_string()))
}

/// Create the object when it was absent from the snapshot, else update it.
async fn persist(state: &AppState, object: StateObject, exists: bool) -> Result<(), BackendError> {
    let (namespace, name) = (object.namespace.clone(), object.name.clone());
    let result = if exists {
        state.store.update(object).await
    } else {
        state.store.create(object).await
    };
    result.map(|_| ()).map_err(|e| {
        warn!("failed to store state {}/{}: {}", namespace, name, e);
        BackendError::from(e)
    })
}

/// Lock conflicts are normal protocol traffic, so they log at debug.
fn conflict(operation: &'static str, namespace: &str, name: &str, conflict: LockConflict) -> BackendError {
    debug!(
        holder = %conflict.0.id,
        "state {}/{} is locked",
        namespace,
        name
    );
    metrics::counter!(LOCK_CONFLICTS_TOTAL, "operation" => operation).increment(1);
    conflict.into()
}
