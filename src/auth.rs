//! Identity gate.
//!
//! Terraform's `http` backend sends HTTP Basic credentials.  The username
//! is ignored; the password is a bearer token handed verbatim to an
//! [`IdentityProvider`], which either resolves it to an [`Identity`] or
//! rejects it.  The gate fails closed: anything other than a positive
//! answer ends the request.

use axum::http::{header, HeaderMap};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::future::Future;
use std::pin::Pin;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::config::StaticToken;
use crate::errors::{BackendError, CollaboratorError};

/// The authenticated caller, valid for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub username: String,
    pub uid: String,
    pub groups: Vec<String>,
}

/// Boxed future returned by [`IdentityProvider::validate`].
pub type ValidateFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<Identity>, CollaboratorError>> + Send + 'a>>;

/// External token validation.
pub trait IdentityProvider: Send + Sync + 'static {
    /// Resolve `token` to an identity. `Ok(None)` means the provider
    /// answered and did not authenticate the token.
    fn validate<'a>(&'a self, token: &'a str) -> ValidateFuture<'a>;
}

/// Credentials carried in an `Authorization: Basic` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

/// Parse the `Authorization` header as HTTP Basic.
///
/// Returns `None` when the header is absent, uses another scheme, or is
/// not valid `base64(user:password)`.
pub fn basic_credentials(headers: &HeaderMap) -> Option<BasicCredentials> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, encoded) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some(BasicCredentials {
        username: username.to_string(),
        password: password.to_string(),
    })
}

/// Run the identity gate for one request.
///
/// - no usable credential: `AuthenticationMissing` (401 with challenge)
/// - provider rejects the token: `AuthenticationRejected` (403)
/// - provider call fails: `Collaborator`, status forwarded when known
pub async fn authenticate(
    provider: &dyn IdentityProvider,
    realm: &str,
    headers: &HeaderMap,
) -> Result<Identity, BackendError> {
    let token = match basic_credentials(headers) {
        Some(creds) if !creds.password.is_empty() => creds.password,
        _ => {
            return Err(BackendError::AuthenticationMissing {
                realm: realm.to_string(),
            })
        }
    };

    match provider.validate(&token).await {
        Ok(Some(identity)) => {
            debug!(user = %identity.username, "authenticated");
            Ok(identity)
        }
        Ok(None) => Err(BackendError::AuthenticationRejected),
        Err(e) => {
            warn!("failed to validate authentication token: {}", e);
            Err(BackendError::Collaborator(e))
        }
    }
}

/// Identity provider backed by a fixed token list from configuration.
pub struct StaticTokenProvider {
    tokens: Vec<StaticToken>,
}

impl StaticTokenProvider {
    pub fn new(tokens: Vec<StaticToken>) -> Self {
        Self { tokens }
    }
}

impl IdentityProvider for StaticTokenProvider {
    fn validate<'a>(&'a self, token: &'a str) -> ValidateFuture<'a> {
        // Compare against every entry so timing does not reveal which one matched.
        let mut found: Option<&StaticToken> = None;
        for entry in &self.tokens {
            if bool::from(entry.token.as_bytes().ct_eq(token.as_bytes())) && found.is_none() {
                found = Some(entry);
            }
        }
        let identity = found.map(|entry| Identity {
            username: entry.username.clone(),
            uid: entry.uid.clone(),
            groups: entry.groups.clone(),
        });
        Box::pin(async move { Ok(identity) })
    }
}
