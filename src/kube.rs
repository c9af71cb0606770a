//! Kubernetes API client.
//!
//! A small `reqwest` client for the three API groups this backend talks
//! to: `authentication.k8s.io` (TokenReview), `authorization.k8s.io`
//! (SubjectAccessReview) and core `v1` ConfigMaps (see
//! [`crate::store::kubernetes`]).  Non-2xx answers are decoded as a
//! Kubernetes `Status` so their code and message reach the client.

use axum::http::StatusCode;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

use crate::auth::{Identity, IdentityProvider, ValidateFuture};
use crate::authz::{Action, Authorizer, DecideFuture, RESOURCE};
use crate::config::KubernetesConfig;
use crate::errors::CollaboratorError;

/// Where the client's own bearer token comes from.
#[derive(Debug, Clone)]
enum TokenSource {
    /// Re-read on every call so rotated service account tokens are picked up.
    File(PathBuf),
    Static(String),
}

/// Authenticated HTTP client for the Kubernetes API server.
#[derive(Debug, Clone)]
pub struct KubeClient {
    http: reqwest::Client,
    base_url: String,
    token: TokenSource,
}

/// A Kubernetes `Status` object, as returned with API errors.
#[derive(Debug, Default, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    message: String,
}

impl KubeClient {
    /// Build a client from configuration, failing if the service account
    /// token or CA bundle cannot be read.
    pub fn from_config(config: &KubernetesConfig) -> anyhow::Result<Self> {
        let base_url = config.resolve_api_server()?;

        let token_path = PathBuf::from(&config.token_file);
        std::fs::metadata(&token_path).map_err(|e| {
            anyhow::anyhow!("failed to read token file {}: {e}", token_path.display())
        })?;

        let mut builder =
            reqwest::Client::builder().timeout(Duration::from_secs(config.timeout_seconds));
        if config.insecure_skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        } else if std::path::Path::new(&config.ca_file).exists() {
            let pem = std::fs::read(&config.ca_file)?;
            for cert in reqwest::Certificate::from_pem_bundle(&pem)? {
                builder = builder.add_root_certificate(cert);
            }
        }
        let http = builder
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {e}"))?;

        info!("Kubernetes API client initialized: server={}", base_url);

        Ok(Self {
            http,
            base_url,
            token: TokenSource::File(token_path),
        })
    }

    /// Client with a fixed bearer token and no TLS customisation.
    pub fn with_token(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: TokenSource::Static(token.into()),
        }
    }

    async fn bearer(&self) -> Result<String, CollaboratorError> {
        match &self.token {
            TokenSource::Static(token) => Ok(token.clone()),
            TokenSource::File(path) => tokio::fs::read_to_string(path)
                .await
                .map(|t| t.trim().to_string())
                .map_err(|e| {
                    CollaboratorError::transport(format!(
                        "failed to read token file {}: {e}",
                        path.display()
                    ))
                }),
        }
    }

    /// Start a request against `path` (which must begin with `/`).
    pub async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, CollaboratorError> {
        let token = self.bearer().await?;
        debug!("kubernetes {} {}", method, path);
        Ok(self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(token))
    }

    /// Send a request and decode a JSON success body.
    pub async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, CollaboratorError> {
        let response = check_status(request.send().await?).await?;
        Ok(response.json::<T>().await?)
    }

    /// POST `body` to `path` and decode the JSON answer.
    pub async fn create<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, CollaboratorError> {
        let request = self.request(Method::POST, path).await?.json(body);
        self.send_json(request).await
    }
}

/// Turn a non-2xx response into a `CollaboratorError` carrying the status.
pub async fn check_status(response: Response) -> Result<Response, CollaboratorError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let http_status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    let parsed: ApiStatus = serde_json::from_str(&text).unwrap_or_default();
    let code = if parsed.code != 0 { parsed.code } else { http_status };
    let message = if parsed.message.is_empty() { text } else { parsed.message };
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    Err(CollaboratorError::with_status(status, message))
}

// -- TokenReview ----------------------------------------------------------------

const TOKEN_REVIEW_PATH: &str = "/apis/authentication.k8s.io/v1/tokenreviews";

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct TokenReview {
    #[serde(default)]
    api_version: String,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    spec: TokenReviewSpec,
    #[serde(default)]
    status: TokenReviewStatus,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct TokenReviewSpec {
    #[serde(default)]
    token: String,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct TokenReviewStatus {
    #[serde(default)]
    authenticated: bool,
    #[serde(default)]
    user: UserInfo,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct UserInfo {
    #[serde(default)]
    username: String,
    #[serde(default)]
    uid: String,
    #[serde(default)]
    groups: Vec<String>,
}

/// Identity provider that delegates to the API server's TokenReview.
pub struct TokenReviewProvider {
    client: KubeClient,
}

impl TokenReviewProvider {
    pub fn new(client: KubeClient) -> Self {
        Self { client }
    }
}

impl IdentityProvider for TokenReviewProvider {
    fn validate<'a>(&'a self, token: &'a str) -> ValidateFuture<'a> {
        Box::pin(async move {
            let review = TokenReview {
                api_version: "authentication.k8s.io/v1".into(),
                kind: "TokenReview".into(),
                spec: TokenReviewSpec {
                    token: token.to_string(),
                },
                status: TokenReviewStatus::default(),
            };
            let answer: TokenReview = self.client.create(TOKEN_REVIEW_PATH, &review).await?;
            if !answer.status.authenticated {
                return Ok(None);
            }
            let user = answer.status.user;
            Ok(Some(Identity {
                username: user.username,
                uid: user.uid,
                groups: user.groups,
            }))
        })
    }
}

// -- SubjectAccessReview --------------------------------------------------------

const SUBJECT_ACCESS_REVIEW_PATH: &str = "/apis/authorization.k8s.io/v1/subjectaccessreviews";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubjectAccessReview<'a> {
    api_version: &'static str,
    kind: &'static str,
    spec: SubjectAccessReviewSpec<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubjectAccessReviewSpec<'a> {
    user: &'a str,
    uid: &'a str,
    groups: &'a [String],
    resource_attributes: ResourceAttributes<'a>,
}

#[derive(Debug, Serialize)]
struct ResourceAttributes<'a> {
    resource: &'static str,
    namespace: &'a str,
    name: &'a str,
    verb: &'static str,
}

#[derive(Debug, Deserialize)]
struct SubjectAccessReviewAnswer {
    #[serde(default)]
    status: SubjectAccessReviewStatus,
}

#[derive(Debug, Default, Deserialize)]
struct SubjectAccessReviewStatus {
    #[serde(default)]
    allowed: bool,
}

/// Authorizer that delegates to the API server's SubjectAccessReview.
pub struct SubjectAccessReviewAuthorizer {
    client: KubeClient,
}

impl SubjectAccessReviewAuthorizer {
    pub fn new(client: KubeClient) -> Self {
        Self { client }
    }
}

impl Authorizer for SubjectAccessReviewAuthorizer {
    fn decide<'a>(
        &'a self,
        identity: &'a Identity,
        namespace: &'a str,
        name: &'a str,
        action: Action,
    ) -> DecideFuture<'a> {
        Box::pin(async move {
            let review = SubjectAccessReview {
                api_version: "authorization.k8s.io/v1",
                kind: "SubjectAccessReview",
                spec: SubjectAccessReviewSpec {
                    user: &identity.username,
                    uid: &identity.uid,
                    groups: &identity.groups,
                    resource_attributes: ResourceAttributes {
                        resource: RESOURCE,
                        namespace,
                        name,
                        verb: action.as_str(),
                    },
                },
            };
            let answer: SubjectAccessReviewAnswer =
                self.client.create(SUBJECT_ACCESS_REVIEW_PATH, &review).await?;
            Ok(answer.status.allowed)
        })
    }
}
