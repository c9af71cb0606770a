//! Terraform `http` backend configuration file rendering.
//!
//! Used by the `tfstate-backend-config` binary, typically as an init
//! container: it turns the pod's service account token into a partial
//! backend configuration that `terraform init -backend-config=<file>` can
//! consume.

use anyhow::Context;
use std::fmt::Write as _;
use std::path::Path;

/// Default location of the pod's service account token.
pub const DEFAULT_TOKEN_FILE: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Username written to the file. The server ignores it.
pub const USERNAME: &str = "terraform";

/// Inputs for one generated file.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// State URL, used for the read, lock and unlock addresses alike.
    pub address: String,
    /// Bearer token sent as the basic-auth password.
    pub token: String,
    pub skip_cert_verification: bool,
}

impl BackendConfig {
    /// Build from a URL and raw token file contents. Surrounding whitespace
    /// is trimmed from the token.
    pub fn new(address: &reqwest::Url, token_contents: &str) -> Self {
        Self {
            address: address.to_string(),
            token: token_contents.trim().to_string(),
            skip_cert_verification: true,
        }
    }

    /// Render the HCL attribute file.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "address = {}", quote(&self.address));
        let _ = writeln!(out, "lock_address = {}", quote(&self.address));
        let _ = writeln!(out, "unlock_address = {}", quote(&self.address));
        let _ = writeln!(
            out,
            "username = {} # Value is unused, only password (token) is used for authentication",
            quote(USERNAME)
        );
        let _ = writeln!(out, "password = {}", quote(&self.token));
        let _ = writeln!(
            out,
            "skip_cert_verification = {}",
            quote(if self.skip_cert_verification { "true" } else { "false" })
        );
        out
    }
}

/// Quote an HCL string literal.
fn quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            // `${` and `%{` open template sequences unless doubled.
            '$' | '%' if chars.peek() == Some(&'{') => {
                quoted.push(c);
                quoted.push(c);
            }
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

/// Write `contents` to `path` as a read-only (0444) file, replacing any
/// existing file.
pub fn write_read_only(path: &Path, contents: &str) -> anyhow::Result<()> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("failed to replace {}", path.display()))?;
    }
    std::fs::write(path, contents)
        .with_context(|| format!("failed to write generated file {}", path.display()))?;
    set_read_only(path)
}

#[cfg(unix)]
fn set_read_only(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o444))
        .with_context(|| format!("failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn set_read_only(path: &Path) -> anyhow::Result<()> {
    let mut permissions = std::fs::metadata(path)?.permissions();
    permissions.set_readonly(true);
    std::fs::set_permissions(path, permissions)
        .with_context(|| format!("failed to set permissions on {}", path.display()))
}
