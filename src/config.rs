//! Configuration loading and types for the state backend.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! system: networking, state encoding, locking policy, authentication,
//! authorization, the object store and the Kubernetes API connection.
//! Every field has a default, so an empty file is a valid configuration.

use anyhow::Context;
use serde::Deserialize;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Encoding applied to state payloads before storage.
    #[serde(default)]
    pub state: StateConfig,

    /// Lock protocol policy.
    #[serde(default)]
    pub locking: LockingConfig,

    /// Identity gate settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Permission gate settings.
    #[serde(default)]
    pub authorization: AuthorizationConfig,

    /// Object store settings.
    #[serde(default)]
    pub store: StoreConfig,

    /// Kubernetes API connection, shared by every kubernetes-backed collaborator.
    #[serde(default)]
    pub kubernetes: KubernetesConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings (metrics + health probe listener).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    /// Maximum accepted request body in bytes.
    #[serde(default = "default_max_body_size")]
    pub max_body_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
            max_body_size: default_max_body_size(),
        }
    }
}

/// State payload encoding.
///
/// These flags are not recorded alongside the data, so they must stay the
/// same for the lifetime of every stored object.
#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    /// Gzip the payload at maximum compression.
    #[serde(default = "default_true")]
    pub compress: bool,

    /// Strip insignificant JSON whitespace before compressing.
    #[serde(default)]
    pub minify: bool,

    /// Key under which the payload is stored in a ConfigMap's `binaryData`.
    #[serde(default = "default_data_key")]
    pub data_key: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            compress: true,
            minify: false,
            data_key: default_data_key(),
        }
    }
}

/// Lock protocol policy.
#[derive(Debug, Clone, Deserialize)]
pub struct LockingConfig {
    /// Whether an UNLOCK carrying no lock body clears a lock held by anyone.
    #[serde(default = "default_true")]
    pub allow_force_unlock: bool,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            allow_force_unlock: true,
        }
    }
}

/// Identity gate configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Realm advertised in the `WWW-Authenticate` challenge.
    #[serde(default = "default_realm")]
    pub realm: String,

    /// Provider: `kubernetes` (TokenReview) or `static`.
    #[serde(default = "default_kubernetes")]
    pub provider: String,

    /// Tokens accepted by the `static` provider.
    #[serde(default)]
    pub tokens: Vec<StaticToken>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            realm: default_realm(),
            provider: default_kubernetes(),
            tokens: Vec::new(),
        }
    }
}

/// A bearer token and the identity it authenticates as.
#[derive(Debug, Clone, Deserialize)]
pub struct StaticToken {
    pub token: String,
    pub username: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Permission gate configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorizationConfig {
    /// Provider: `kubernetes` (SubjectAccessReview) or `static`.
    #[serde(default = "default_kubernetes")]
    pub provider: String,

    /// Rules evaluated by the `static` provider. Any matching rule allows.
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            provider: default_kubernetes(),
            rules: Vec::new(),
        }
    }
}

/// One allow rule. `"*"` in any list matches everything.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyRule {
    #[serde(default)]
    pub users: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default = "wildcard")]
    pub namespaces: Vec<String>,
    #[serde(default = "wildcard")]
    pub verbs: Vec<String>,
}

/// Object store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Backend type: `kubernetes`, `memory` or `sqlite`.
    #[serde(default = "default_kubernetes")]
    pub backend: String,

    /// SQLite-specific configuration.
    #[serde(default)]
    pub sqlite: SqliteConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_kubernetes(),
            sqlite: SqliteConfig::default(),
        }
    }
}

/// SQLite store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_sqlite_path")]
    pub path: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: default_sqlite_path(),
        }
    }
}

/// Kubernetes API connection.
///
/// Defaults target the in-cluster service account.
#[derive(Debug, Clone, Deserialize)]
pub struct KubernetesConfig {
    /// API server base URL. Empty means derive from `KUBERNETES_SERVICE_HOST`.
    #[serde(default)]
    pub api_server: String,

    /// File holding the bearer token used to call the API server.
    #[serde(default = "default_token_file")]
    pub token_file: String,

    /// PEM bundle used to verify the API server certificate.
    #[serde(default = "default_ca_file")]
    pub ca_file: String,

    /// Disable TLS verification of the API server.
    #[serde(default)]
    pub insecure_skip_tls_verify: bool,

    /// Per-call timeout in seconds.
    #[serde(default = "default_kube_timeout")]
    pub timeout_seconds: u64,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            api_server: String::new(),
            token_file: default_token_file(),
            ca_file: default_ca_file(),
            insecure_skip_tls_verify: false,
            timeout_seconds: default_kube_timeout(),
        }
    }
}

impl KubernetesConfig {
    /// Resolve the API server URL, falling back to the in-cluster service env.
    pub fn resolve_api_server(&self) -> anyhow::Result<String> {
        if !self.api_server.is_empty() {
            return Ok(self.api_server.trim_end_matches('/').to_string());
        }
        let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
            anyhow::anyhow!(
                "kubernetes.api_server is not set and KUBERNETES_SERVICE_HOST is undefined"
            )
        })?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into());
        if host.contains(':') {
            Ok(format!("https://[{host}]:{port}"))
        } else {
            Ok(format!("https://{host}:{port}"))
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
///
/// Metrics and the health probe are served on a separate listener so the
/// state listener stays fully behind authentication.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,

    /// Admin listener address. Empty disables the admin listener.
    #[serde(default = "default_admin_listen")]
    pub listen: String,
}

impl ObservabilityConfig {
    /// Whether `/healthz` and `/metrics` get a listener of their own.
    pub fn admin_listener_enabled(&self) -> bool {
        !self.listen.trim().is_empty()
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics: true,
            listen: default_admin_listen(),
        }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn wildcard() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8443
}

fn default_shutdown_timeout() -> u64 {
    60
}

fn default_max_body_size() -> usize {
    64 * 1024 * 1024
}

fn default_data_key() -> String {
    "tfstate".to_string()
}

fn default_realm() -> String {
    "Terraform".to_string()
}

fn default_kubernetes() -> String {
    "kubernetes".to_string()
}

fn default_sqlite_path() -> String {
    "./data/state.db".to_string()
}

fn default_token_file() -> String {
    "/var/run/secrets/kubernetes.io/serviceaccount/token".to_string()
}

fn default_ca_file() -> String {
    "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt".to_string()
}

fn default_kube_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_admin_listen() -> String {
    "0.0.0.0:9090".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    parse_config(&contents)
}

/// Parse configuration from YAML text. An empty document yields defaults.
pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.server.port, 8443);
        assert!(config.state.compress);
        assert!(!config.state.minify);
        assert_eq!(config.state.data_key, "tfstate");
        assert!(config.locking.allow_force_unlock);
        assert_eq!(config.auth.provider, "kubernetes");
        assert_eq!(config.store.backend, "kubernetes");
    }

    #[test]
    fn test_static_sections() {
        let yaml = r#"
state:
  compress: false
  minify: true
auth:
  provider: static
  tokens:
    - token: s3cr3t
      username: alice
      groups: [ops]
authorization:
  provider: static
  rules:
    - groups: [ops]
      verbs: [get, update]
store:
  backend: sqlite
  sqlite:
    path: /tmp/state.db
"#;
        let config = parse_config(yaml).unwrap();
        assert!(!config.state.compress);
        assert!(config.state.minify);
        assert_eq!(config.auth.tokens.len(), 1);
        assert_eq!(config.auth.tokens[0].username, "alice");
        assert_eq!(config.auth.tokens[0].uid, "");
        let rule = &config.authorization.rules[0];
        assert_eq!(rule.namespaces, vec!["*".to_string()]);
        assert_eq!(rule.verbs, vec!["get".to_string(), "update".to_string()]);
        assert_eq!(config.store.sqlite.path, "/tmp/state.db");
    }

    #[test]
    fn test_explicit_api_server_trims_slash() {
        let kube = KubernetesConfig {
            api_server: "https://10.0.0.1:6443/".into(),
            ..KubernetesConfig::default()
        };
        assert_eq!(kube.resolve_api_server().unwrap(), "https://10.0.0.1:6443");
    }

    #[test]
    fn test_invalid_yaml_is_error() {
        assert!(parse_config("server: [unclosed").is_err());
    }

    #[test]
    fn test_missing_config_file_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.yaml");
        let err = load_config(&path).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("absent.yaml"), "{message}");
    }

    #[test]
    fn test_empty_admin_listen_disables_listener() {
        let config = parse_config("observability:\n  listen: \"\"\n").unwrap();
        assert!(!config.observability.admin_listener_enabled());
        assert!(Config::default().observability.admin_listener_enabled());
    }

    #[test]
    fn test_example_config_parses() {
        let config = parse_config(include_str!("../tfstate-backend.example.yaml")).unwrap();
        assert_eq!(config.server.port, 8443);
        assert_eq!(config.store.backend, "kubernetes");
        assert!(config.locking.allow_force_unlock);
        assert_eq!(config.observability.listen, "0.0.0.0:9090");
    }
}
