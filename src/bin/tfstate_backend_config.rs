//! tfstate-backend-config -- write a Terraform `http` backend config file
//! from the pod's service account token.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use tfstate_backend::backend_config::{write_read_only, BackendConfig, DEFAULT_TOKEN_FILE};

/// Command-line arguments for the config generator.
#[derive(Parser, Debug)]
#[command(
    name = "tfstate-backend-config",
    version,
    about = "Generate a Terraform http backend config file"
)]
struct Cli {
    /// Path to the generated output file.
    #[arg(long)]
    output_file: PathBuf,

    /// The address of the Terraform backend REST endpoint.
    #[arg(long, value_parser = parse_url)]
    http_backend_address: reqwest::Url,

    /// Bearer token file; its trimmed contents become the password.
    #[arg(long, default_value = DEFAULT_TOKEN_FILE)]
    token_file: PathBuf,
}

fn parse_url(s: &str) -> Result<reqwest::Url, String> {
    reqwest::Url::parse(s.trim()).map_err(|e| format!("failed to parse URL {s:?}: {e}"))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let token = std::fs::read_to_string(&cli.token_file).with_context(|| {
        format!(
            "failed to read service account token {}",
            cli.token_file.display()
        )
    })?;

    let rendered = BackendConfig::new(&cli.http_backend_address, &token).render();
    write_read_only(&cli.output_file, &rendered)?;

    tracing::info!(
        "Wrote backend config for {} to {}",
        cli.http_backend_address,
        cli.output_file.display()
    );
    Ok(())
}
