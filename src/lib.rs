//! tfstate-backend library: a Terraform `http` remote state backend.
//!
//! State objects are addressed as `/<namespace>/<name>`, stored gzip
//! compressed in a pluggable object store, and guarded by an advisory lock
//! kept in the object's own annotations.  Authentication and authorization
//! are delegated to external collaborators, by default the Kubernetes
//! TokenReview and SubjectAccessReview APIs.

use std::sync::Arc;

pub mod auth;
pub mod authz;
pub mod backend_config;
pub mod codec;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod kube;
pub mod lock;
pub mod metrics;
pub mod server;
pub mod store;

use crate::auth::{IdentityProvider, StaticTokenProvider};
use crate::authz::{Authorizer, StaticPolicy};
use crate::codec::StateCodec;
use crate::config::Config;
use crate::kube::{KubeClient, SubjectAccessReviewAuthorizer, TokenReviewProvider};
use crate::store::backend::ObjectStore;
use crate::store::kubernetes::ConfigMapStore;
use crate::store::memory::MemoryStore;
use crate::store::sqlite::SqliteStore;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// Payload transform applied on write and reversed on read.
    pub codec: StateCodec,
    /// Where state objects live.
    pub store: Arc<dyn ObjectStore>,
    /// Token validation.
    pub identity: Arc<dyn IdentityProvider>,
    /// Permission checks.
    pub authorizer: Arc<dyn Authorizer>,
}

impl AppState {
    /// Build the collaborators named in `config`.
    ///
    /// A Kubernetes client is only constructed when some collaborator needs
    /// one, so purely local setups run outside a cluster.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let needs_kube = config.auth.provider == "kubernetes"
            || config.authorization.provider == "kubernetes"
            || config.store.backend == "kubernetes";
        let kube = if needs_kube {
            Some(KubeClient::from_config(&config.kubernetes)?)
        } else {
            None
        };
        let kube_client = || {
            kube.clone()
                .ok_or_else(|| anyhow::anyhow!("kubernetes client not configured"))
        };

        let store: Arc<dyn ObjectStore> = match config.store.backend.as_str() {
            "kubernetes" => Arc::new(ConfigMapStore::new(
                kube_client()?,
                config.state.data_key.clone(),
            )),
            "memory" => Arc::new(MemoryStore::new()),
            "sqlite" => {
                let path = &config.store.sqlite.path;
                if let Some(parent) = std::path::Path::new(path).parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Arc::new(SqliteStore::new(path)?)
            }
            other => anyhow::bail!("unknown store.backend '{other}'"),
        };

        let identity: Arc<dyn IdentityProvider> = match config.auth.provider.as_str() {
            "kubernetes" => Arc::new(TokenReviewProvider::new(kube_client()?)),
            "static" => Arc::new(StaticTokenProvider::new(config.auth.tokens.clone())),
            other => anyhow::bail!("unknown auth.provider '{other}'"),
        };

        let authorizer: Arc<dyn Authorizer> = match config.authorization.provider.as_str() {
            "kubernetes" => Arc::new(SubjectAccessReviewAuthorizer::new(kube_client()?)),
            "static" => Arc::new(StaticPolicy::new(config.authorization.rules.clone())),
            other => anyhow::bail!("unknown authorization.provider '{other}'"),
        };

        Ok(Self {
            codec: StateCodec::new(config.state.compress, config.state.minify),
            config,
            store,
            identity,
            authorizer,
        })
    }
}
