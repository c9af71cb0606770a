//! End-to-end tests of the state protocol, driving the router in-process.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{json, Value};
use tower::ServiceExt;

use tfstate_backend::auth::{Identity, StaticTokenProvider};
use tfstate_backend::authz::{Action, Authorizer, DecideFuture, StaticPolicy};
use tfstate_backend::codec::StateCodec;
use tfstate_backend::config::{Config, PolicyRule, StaticToken};
use tfstate_backend::errors::{CollaboratorError, StoreError};
use tfstate_backend::lock::{LOCK_ANNOTATIONS, ANNOTATION_LOCK_ID};
use tfstate_backend::server::app;
use tfstate_backend::store::backend::{ObjectStore, StateObject, StoreFuture};
use tfstate_backend::store::memory::MemoryStore;
use tfstate_backend::AppState;

const ADMIN_TOKEN: &str = "admin-token";
const READER_TOKEN: &str = "reader-token";
const OUTSIDER_TOKEN: &str = "outsider-token";

fn token(token: &str, username: &str, groups: &[&str]) -> StaticToken {
    StaticToken {
        token: token.to_string(),
        username: username.to_string(),
        uid: format!("uid-{username}"),
        groups: groups.iter().map(|g| g.to_string()).collect(),
    }
}

fn rule(groups: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        users: Vec::new(),
        groups: groups.iter().map(|g| g.to_string()).collect(),
        namespaces: vec!["*".to_string()],
        verbs: verbs.iter().map(|v| v.to_string()).collect(),
    }
}

struct Harness {
    router: Router,
    store: Arc<dyn ObjectStore>,
}

impl Harness {
    fn new() -> Self {
        Self::with(Config::default(), Arc::new(MemoryStore::new()))
    }

    fn with(config: Config, store: Arc<dyn ObjectStore>) -> Self {
        let policy = StaticPolicy::new(vec![
            rule(&["admins"], &["*"]),
            rule(&["readers"], &["get"]),
        ]);
        Self::with_authorizer(config, store, Arc::new(policy))
    }

    fn with_authorizer(
        config: Config,
        store: Arc<dyn ObjectStore>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        let state = AppState {
            codec: StateCodec::new(config.state.compress, config.state.minify),
            store: store.clone(),
            identity: Arc::new(StaticTokenProvider::new(vec![
                token(ADMIN_TOKEN, "alice", &["admins"]),
                token(READER_TOKEN, "bob", &["readers"]),
                token(OUTSIDER_TOKEN, "eve", &[]),
            ])),
            authorizer,
            config,
        };
        Self {
            router: app(Arc::new(state)),
            store,
        }
    }

    async fn send(&self, method: &str, uri: &str, token: Option<&str>, body: &str) -> Response {
        let mut builder = Request::builder()
            .method(Method::from_bytes(method.as_bytes()).unwrap())
            .uri(uri);
        if let Some(token) = token {
            let credential = STANDARD.encode(format!("terraform:{token}"));
            builder = builder.header(header::AUTHORIZATION, format!("Basic {credential}"));
        }
        let request = builder.body(Body::from(body.to_string())).unwrap();
        self.router.clone().oneshot(request).await.unwrap()
    }

    async fn admin(&self, method: &str, uri: &str, body: &str) -> Response {
        self.send(method, uri, Some(ADMIN_TOKEN), body).await
    }

    async fn stored(&self) -> Option<StateObject> {
        self.store.get("infra", "network").await.ok()
    }
}

async fn body_bytes(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

#[tokio::test]
async fn unauthenticated_requests_get_challenge_everywhere() {
    let h = Harness::new();
    for (method, uri) in [
        ("GET", "/infra/network"),
        ("POST", "/infra/network"),
        ("DELETE", "/infra/network"),
        ("LOCK", "/infra/network"),
        ("UNLOCK", "/infra/network"),
        ("PUT", "/infra/network"),
        ("GET", "/"),
        ("GET", "/healthz"),
        ("GET", "/metrics"),
        ("GET", "/a/b/c"),
    ] {
        let response = h.send(method, uri, None, "").await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{method} {uri}");
        assert_eq!(
            response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            "Basic realm=\"Terraform\""
        );
    }
}

#[tokio::test]
async fn unknown_token_is_forbidden() {
    let h = Harness::new();
    let response = h.send("GET", "/infra/network", Some("nope"), "").await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn malformed_paths_are_not_found() {
    let h = Harness::new();
    for uri in ["/", "/infra", "/infra/", "/infra/network/", "/a/b/c"] {
        let response = h.admin("GET", uri, "").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{uri}");
    }
}

#[tokio::test]
async fn unknown_method_is_not_found() {
    let h = Harness::new();
    let response = h.admin("PUT", "/infra/network", "{}").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(h.stored().await.is_none());
}

#[tokio::test]
async fn get_missing_object_is_empty_ok() {
    let h = Harness::new();
    let response = h.admin("GET", "/infra/network", "").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_bytes(response).await.is_empty());
}

#[tokio::test]
async fn write_then_read_round_trips() {
    let h = Harness::new();
    let response = h.admin("POST", "/infra/network", r#"{"version":4}"#).await;
    assert_eq!(response.status(), StatusCode::OK);

    // Stored gzip compressed.
    let stored = h.stored().await.unwrap();
    assert_eq!(&stored.payload.unwrap()[..2], &[0x1f, 0x8b]);

    let response = h.admin("GET", "/infra/network", "").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"version": 4}));
}

#[tokio::test]
async fn minified_write_reads_back_parse_equivalent() {
    let mut config = Config::default();
    config.state.minify = true;
    let h = Harness::with(config, Arc::new(MemoryStore::new()));

    let original = "{\n  \"version\": 4,\n  \"resources\": [ {\"a\": 1} ]\n}\n";
    h.admin("POST", "/infra/network", original).await;
    let body = body_bytes(h.admin("GET", "/infra/network", "").await).await;
    assert_ne!(body, original.as_bytes());
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed, serde_json::from_str::<Value>(original).unwrap());
}

#[tokio::test]
async fn lock_conflict_returns_current_holder() {
    let h = Harness::new();
    let response = h
        .admin("LOCK", "/infra/network", r#"{"ID":"abc","Operation":"apply"}"#)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let before = h.stored().await.unwrap();

    let response = h
        .admin("LOCK", "/infra/network", r#"{"ID":"xyz","Operation":"plan"}"#)
        .await;
    assert_eq!(response.status(), StatusCode::LOCKED);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/json"
    );
    assert_eq!(
        body_bytes(response).await,
        br#"{"ID":"abc","Operation":"apply","Info":"","Who":""}"#.to_vec()
    );

    let after = h.stored().await.unwrap();
    assert_eq!(after.annotations, before.annotations);
    assert_eq!(after.resource_version, before.resource_version);
}

#[tokio::test]
async fn relock_by_holder_refreshes_fields() {
    let h = Harness::new();
    for operation in ["plan", "apply", "apply"] {
        let body = json!({"ID": "abc", "Operation": operation, "Who": "alice@ci"}).to_string();
        let response = h.admin("LOCK", "/infra/network", &body).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = h.admin("LOCK", "/infra/network", r#"{"ID":"other"}"#).await;
    assert_eq!(
        body_json(response).await,
        json!({"ID": "abc", "Operation": "apply", "Info": "", "Who": "alice@ci"})
    );
}

#[tokio::test]
async fn unlock_mismatch_conflicts_without_mutation() {
    let h = Harness::new();
    h.admin("LOCK", "/infra/network", r#"{"ID":"abc","Operation":"apply"}"#)
        .await;
    let before = h.stored().await.unwrap();

    let response = h.admin("UNLOCK", "/infra/network", r#"{"ID":"xyz"}"#).await;
    assert_eq!(response.status(), StatusCode::LOCKED);
    assert_eq!(body_json(response).await["ID"], "abc");
    assert_eq!(h.stored().await.unwrap().annotations, before.annotations);
}

#[tokio::test]
async fn unlock_then_write_with_empty_token() {
    let h = Harness::new();
    h.admin("LOCK", "/infra/network", r#"{"ID":"abc","Operation":"apply"}"#)
        .await;

    let response = h.admin("UNLOCK", "/infra/network", r#"{"ID":"abc"}"#).await;
    assert_eq!(response.status(), StatusCode::OK);
    let stored = h.stored().await.unwrap();
    for key in LOCK_ANNOTATIONS {
        assert!(!stored.annotations.contains_key(key), "{key} still present");
    }

    let response = h.admin("POST", "/infra/network?ID=", r#"{"version":4}"#).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn write_guard_requires_holder_token() {
    let h = Harness::new();
    h.admin("POST", "/infra/network", r#"{"serial":1}"#).await;
    h.admin("LOCK", "/infra/network", r#"{"ID":"abc","Operation":"apply"}"#)
        .await;

    for uri in ["/infra/network", "/infra/network?ID=", "/infra/network?ID=xyz"] {
        let response = h.admin("POST", uri, r#"{"serial":2}"#).await;
        assert_eq!(response.status(), StatusCode::LOCKED, "POST {uri}");
        let response = h.admin("DELETE", uri, "").await;
        assert_eq!(response.status(), StatusCode::LOCKED, "DELETE {uri}");
    }
    let body = body_json(h.admin("GET", "/infra/network", "").await).await;
    assert_eq!(body, json!({"serial": 1}));

    let response = h.admin("POST", "/infra/network?ID=abc", r#"{"serial":2}"#).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(h.admin("GET", "/infra/network", "").await).await;
    assert_eq!(body, json!({"serial": 2}));

    let response = h.admin("DELETE", "/infra/network?ID=abc", "").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(h.stored().await.is_none());
}

#[tokio::test]
async fn delete_missing_object_succeeds() {
    let h = Harness::new();
    let response = h.admin("DELETE", "/infra/network", "").await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unlock_missing_object_is_not_found() {
    let h = Harness::new();
    let response = h.admin("UNLOCK", "/infra/network", r#"{"ID":"abc"}"#).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(h.stored().await.is_none());
}

#[tokio::test]
async fn lock_creates_placeholder_object() {
    let h = Harness::new();
    h.admin("LOCK", "/infra/network", r#"{"ID":"abc"}"#).await;
    let stored = h.stored().await.unwrap();
    assert!(stored.payload.is_none());
    assert_eq!(
        stored.annotations.get(ANNOTATION_LOCK_ID).map(String::as_str),
        Some("abc")
    );

    // A placeholder reads back as empty state.
    let response = h.admin("GET", "/infra/network", "").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_bytes(response).await.is_empty());
}

#[tokio::test]
async fn malformed_lock_body_is_server_error() {
    let h = Harness::new();
    for body in ["", "not json", "[1,2]"] {
        let response = h.admin("LOCK", "/infra/network", body).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR, "{body:?}");
    }
    assert!(h.stored().await.is_none());
}

#[tokio::test]
async fn force_unlock_without_body() {
    let h = Harness::new();
    h.admin("LOCK", "/infra/network", r#"{"ID":"abc"}"#).await;
    let response = h.admin("UNLOCK", "/infra/network", "").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(h.stored().await.unwrap().annotations.is_empty());
}

#[tokio::test]
async fn force_unlock_can_be_disabled() {
    let mut config = Config::default();
    config.locking.allow_force_unlock = false;
    let h = Harness::with(config, Arc::new(MemoryStore::new()));

    h.admin("LOCK", "/infra/network", r#"{"ID":"abc"}"#).await;
    let response = h.admin("UNLOCK", "/infra/network", "").await;
    assert_eq!(response.status(), StatusCode::LOCKED);
    assert_eq!(body_json(response).await["ID"], "abc");
}

#[tokio::test]
async fn reader_can_get_but_not_mutate() {
    let h = Harness::new();
    h.admin("POST", "/infra/network", r#"{"version":4}"#).await;

    let response = h.send("GET", "/infra/network", Some(READER_TOKEN), "").await;
    assert_eq!(response.status(), StatusCode::OK);

    for (method, body) in [
        ("POST", "{}"),
        ("DELETE", ""),
        ("LOCK", r#"{"ID":"r"}"#),
        ("UNLOCK", r#"{"ID":"r"}"#),
    ] {
        let response = h.send(method, "/infra/network", Some(READER_TOKEN), body).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN, "{method}");
    }
}

#[tokio::test]
async fn read_denial_hides_existence() {
    let h = Harness::new();
    h.admin("POST", "/infra/network", r#"{"version":4}"#).await;

    // Same answer for an existing and a missing object, for every method.
    for uri in ["/infra/network", "/infra/missing"] {
        for method in ["GET", "POST", "DELETE", "LOCK", "UNLOCK", "PUT"] {
            let response = h.send(method, uri, Some(OUTSIDER_TOKEN), "").await;
            assert_eq!(response.status(), StatusCode::FORBIDDEN, "{method} {uri}");
        }
    }
}

/// Store whose every call fails with a fixed collaborator error.
struct BrokenStore(CollaboratorError);

impl ObjectStore for BrokenStore {
    fn get<'a>(&'a self, _namespace: &'a str, _name: &'a str) -> StoreFuture<'a, StateObject> {
        let err = self.0.clone();
        Box::pin(async move { Err(StoreError::Collaborator(err)) })
    }

    fn create(&self, _object: StateObject) -> StoreFuture<'_, StateObject> {
        let err = self.0.clone();
        Box::pin(async move { Err(StoreError::Collaborator(err)) })
    }

    fn update(&self, _object: StateObject) -> StoreFuture<'_, StateObject> {
        let err = self.0.clone();
        Box::pin(async move { Err(StoreError::Collaborator(err)) })
    }

    fn delete<'a>(&'a self, _namespace: &'a str, _name: &'a str) -> StoreFuture<'a, ()> {
        let err = self.0.clone();
        Box::pin(async move { Err(StoreError::Collaborator(err)) })
    }
}

#[tokio::test]
async fn store_status_is_forwarded() {
    let h = Harness::with(
        Config::default(),
        Arc::new(BrokenStore(CollaboratorError::with_status(
            StatusCode::TOO_MANY_REQUESTS,
            "slow down",
        ))),
    );
    let response = h.admin("GET", "/infra/network", "").await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body_bytes(response).await, b"slow down".to_vec());
}

#[tokio::test]
async fn store_transport_failure_is_500() {
    let h = Harness::with(
        Config::default(),
        Arc::new(BrokenStore(CollaboratorError::transport("connection refused"))),
    );
    let response = h.admin("GET", "/infra/network", "").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

/// Authorizer that cannot reach its policy service.
struct FailingAuthorizer(CollaboratorError);

impl Authorizer for FailingAuthorizer {
    fn decide<'a>(
        &'a self,
        _identity: &'a Identity,
        _namespace: &'a str,
        _name: &'a str,
        _action: Action,
    ) -> DecideFuture<'a> {
        let err = self.0.clone();
        Box::pin(async move { Err(err) })
    }
}

#[tokio::test]
async fn authorizer_status_is_forwarded() {
    let h = Harness::with_authorizer(
        Config::default(),
        Arc::new(MemoryStore::new()),
        Arc::new(FailingAuthorizer(CollaboratorError::with_status(
            StatusCode::TOO_MANY_REQUESTS,
            "slow down",
        ))),
    );
    let response = h.admin("POST", "/infra/network", r#"{"version":4}"#).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body_bytes(response).await, b"slow down".to_vec());
    assert!(h.stored().await.is_none());
}

#[tokio::test]
async fn authorizer_transport_failure_is_500() {
    let h = Harness::with_authorizer(
        Config::default(),
        Arc::new(MemoryStore::new()),
        Arc::new(FailingAuthorizer(CollaboratorError::transport("connection refused"))),
    );
    let response = h.admin("GET", "/infra/network", "").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body_bytes(response).await.is_empty());
}

#[tokio::test]
async fn oversized_body_is_read_only_after_authentication() {
    let mut config = Config::default();
    config.server.max_body_size = 16;
    let h = Harness::with(config, Arc::new(MemoryStore::new()));
    let body = format!(r#"{{"padding":"{}"}}"#, "x".repeat(64));

    let response = h.send("POST", "/infra/network", None, &body).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));

    let response = h.send("POST", "/infra/network", Some("nope"), &body).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = h.admin("POST", "/infra/network", &body).await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert!(h.stored().await.is_none());
}

#[tokio::test]
async fn percent_encoded_segments_address_the_same_object() {
    let h = Harness::new();
    h.admin("POST", "/infra/my%20state", r#"{"version":4}"#).await;
    assert!(h.store.get("infra", "my state").await.is_ok());
}
