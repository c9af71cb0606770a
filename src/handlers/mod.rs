//! Request dispatch for the state protocol.
//!
//! Every request runs the same prologue: identity gate, body read, path
//! parse, baseline `get` permission check, object fetch.  The body is
//! buffered only after the caller is authenticated.  Only then is the
//! method inspected and handed to the matching handler in [`state`].
//! The `get` check comes before anything that depends on the object so a
//! caller without read access learns nothing about whether it exists.

pub mod state;

use axum::body::Body;
use axum::extract::FromRequest;
use axum::http::{Method, Request, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use percent_encoding::percent_decode_str;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::auth::{self, Identity};
use crate::authz::{self, Action};
use crate::errors::{BackendError, StoreError};
use crate::store::backend::StateObject;
use crate::AppState;

/// Extension method Terraform uses to take a lock.
pub const METHOD_LOCK: &str = "LOCK";
/// Extension method Terraform uses to release a lock.
pub const METHOD_UNLOCK: &str = "UNLOCK";

/// The five protocol operations, plus everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Get,
    Write,
    Delete,
    Lock,
    Unlock,
    Other,
}

impl Operation {
    pub fn from_method(method: &Method) -> Self {
        match method.as_str() {
            "GET" => Operation::Get,
            "POST" => Operation::Write,
            "DELETE" => Operation::Delete,
            METHOD_LOCK => Operation::Lock,
            METHOD_UNLOCK => Operation::Unlock,
            _ => Operation::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::Write => "write",
            Operation::Delete => "delete",
            Operation::Lock => "lock",
            Operation::Unlock => "unlock",
            Operation::Other => "other",
        }
    }
}

/// Everything a handler needs, gathered by the dispatch prologue.
#[derive(Debug)]
pub struct StateRequest {
    pub namespace: String,
    pub name: String,
    pub identity: Identity,
    /// Snapshot fetched at the top of the request; a fresh empty object
    /// when nothing is stored.
    pub object: StateObject,
    pub exists: bool,
    /// Lock token from the `ID` query parameter.
    pub lock_token: Option<String>,
    pub body: Bytes,
}

/// Split `/<namespace>/<name>` into its two decoded segments.
///
/// Any other shape, including empty segments or a trailing slash, is
/// rejected.
pub fn parse_state_path(path: &str) -> Option<(String, String)> {
    let trimmed = path.strip_prefix('/')?;
    let mut segments = trimmed.split('/');
    let namespace = segments.next()?;
    let name = segments.next()?;
    if segments.next().is_some() || namespace.is_empty() || name.is_empty() {
        return None;
    }
    let decode = |s: &str| percent_decode_str(s).decode_utf8().ok().map(|c| c.into_owned());
    let (namespace, name) = (decode(namespace)?, decode(name)?);
    if namespace.is_empty() || name.is_empty() || namespace.contains('/') || name.contains('/') {
        return None;
    }
    Some((namespace, name))
}

/// Parse a raw query string into a map, percent-decoding keys and values.
pub fn parse_query(raw: Option<&str>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(qs) = raw {
        for part in qs.split('&') {
            if let Some((k, v)) = part.split_once('=') {
                let decoded_k = percent_decode_str(k).decode_utf8_lossy().into_owned();
                let decoded_v = percent_decode_str(v).decode_utf8_lossy().into_owned();
                map.entry(decoded_k).or_insert(decoded_v);
            } else if !part.is_empty() {
                let decoded = percent_decode_str(part).decode_utf8_lossy().into_owned();
                map.entry(decoded).or_insert_with(String::new);
            }
        }
    }
    map
}

/// Run one state request to its terminal response.
pub async fn dispatch(state: &AppState, request: Request<Body>) -> Result<Response, BackendError> {
    let (parts, body) = request.into_parts();
    let identity =
        auth::authenticate(state.identity.as_ref(), &state.config.auth.realm, &parts.headers)
            .await?;

    let method = parts.method.clone();
    let uri = parts.uri.clone();
    debug!(user = %identity.username, method = %method, path = uri.path(), "state request");

    let body = read_body(Request::from_parts(parts, body)).await?;

    let (namespace, name) = parse_state_path(uri.path()).ok_or(BackendError::NotFound)?;

    authz::authorize(
        state.authorizer.as_ref(),
        &identity,
        &namespace,
        &name,
        Action::Get,
    )
    .await?;

    let (object, exists) = match state.store.get(&namespace, &name).await {
        Ok(object) => (object, true),
        Err(StoreError::NotFound { .. }) => (StateObject::new(&namespace, &name), false),
        Err(e) => {
            warn!("failed to get state object {}/{}: {}", namespace, name, e);
            return Err(e.into());
        }
    };

    let lock_token = parse_query(uri.query()).remove("ID");

    let request = StateRequest {
        namespace,
        name,
        identity,
        object,
        exists,
        lock_token,
        body,
    };

    match Operation::from_method(&method) {
        Operation::Get => state::get_state(state, request),
        Operation::Write => state::write_state(state, request).await,
        Operation::Delete => state::delete_state(state, request).await,
        Operation::Lock => state::lock_state(state, request).await,
        Operation::Unlock => state::unlock_state(state, request).await,
        Operation::Other => Err(BackendError::NotFound),
    }
}

/// Buffer the request body, honouring the router's body limit.
async fn read_body(request: Request<Body>) -> Result<Bytes, BackendError> {
    Bytes::from_request(request, &()).await.map_err(|rejection| {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            BackendError::PayloadTooLarge
        } else {
            BackendError::MalformedBody(rejection.body_text())
        }
    })
}
