//! Permission gate.
//!
//! Every action on a state object is checked against an external
//! [`Authorizer`] as one of four verbs on a ConfigMap-like resource.  The
//! dispatcher alone decides which verb an HTTP request needs.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use tracing::warn;

use crate::auth::Identity;
use crate::config::PolicyRule;
use crate::errors::{BackendError, CollaboratorError};

/// Resource kind presented to the authorizer.
pub const RESOURCE: &str = "configmaps";

/// Resource verb checked by the authorizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Get,
    Create,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Get => "get",
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }

    /// Verb for a write that creates the object if it is absent.
    pub fn upsert(exists: bool) -> Self {
        if exists {
            Action::Update
        } else {
            Action::Create
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Boxed future returned by [`Authorizer::decide`].
pub type DecideFuture<'a> = Pin<Box<dyn Future<Output = Result<bool, CollaboratorError>> + Send + 'a>>;

/// External policy decision point.
pub trait Authorizer: Send + Sync + 'static {
    /// Whether `identity` may perform `action` on `namespace/name`.
    fn decide<'a>(
        &'a self,
        identity: &'a Identity,
        namespace: &'a str,
        name: &'a str,
        action: Action,
    ) -> DecideFuture<'a>;
}

/// Run the permission gate for one action.
pub async fn authorize(
    authorizer: &dyn Authorizer,
    identity: &Identity,
    namespace: &str,
    name: &str,
    action: Action,
) -> Result<(), BackendError> {
    match authorizer.decide(identity, namespace, name, action).await {
        Ok(true) => Ok(()),
        Ok(false) => Err(BackendError::AuthorizationDenied {
            action,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }),
        Err(e) => {
            warn!("failed to check authorization for {} {}/{}: {}", action, namespace, name, e);
            Err(BackendError::Collaborator(e))
        }
    }
}

/// Authorizer backed by an allow-list from configuration.
///
/// A request is allowed when any rule matches the user (by name or
/// group), the namespace and the verb.  No rules means deny everything.
pub struct StaticPolicy {
    rules: Vec<PolicyRule>,
}

impl StaticPolicy {
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        Self { rules }
    }

    fn allows(&self, identity: &Identity, namespace: &str, action: Action) -> bool {
        self.rules.iter().any(|rule| {
            let subject = matches_any(&rule.users, &identity.username)
                || identity.groups.iter().any(|g| matches_any(&rule.groups, g));
            subject
                && matches_any(&rule.namespaces, namespace)
                && matches_any(&rule.verbs, action.as_str())
        })
    }
}

fn matches_any(patterns: &[String], value: &str) -> bool {
    patterns.iter().any(|p| p == "*" || p == value)
}

impl Authorizer for StaticPolicy {
    fn decide<'a>(
        &'a self,
        identity: &'a Identity,
        namespace: &'a str,
        _name: &'a str,
        action: Action,
    ) -> DecideFuture<'a> {
        let allowed = self.allows(identity, namespace, action);
        Box::pin(async move { Ok(allowed) })
    }
}
