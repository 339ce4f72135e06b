use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use metamcp_core::{MemoryRepository, Repository};
use metamcp_server::cli::{Cli, Commands};
use metamcp_server::config::SeedConfig;
use metamcp_server::http_transport::{serve_gateway, HttpSecurityConfig};
use metamcp_server::installer::PackageInstaller;
use metamcp_server::GatewayContext;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("metamcp=info,rmcp=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            bind,
            config,
            auth_token,
            endpoint_tokens,
            tls_cert,
            tls_key,
            cors_origins,
        } => {
            let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
            if let Some(path) = config {
                SeedConfig::load(&path)?.apply(&repo).await?;
            }
            let mut tokens = HashMap::new();
            for raw in endpoint_tokens {
                let (endpoint, token) = raw
                    .split_once('=')
                    .ok_or_else(|| anyhow!("--endpoint-token expects ENDPOINT=TOKEN, got '{raw}'"))?;
                tokens.insert(endpoint.to_string(), token.to_string());
            }
            let ctx = GatewayContext::from_env(repo);
            let security = HttpSecurityConfig {
                gateway_token: auth_token,
                endpoint_tokens: tokens,
                tls_cert,
                tls_key,
                cors_origins,
            };
            serve_gateway(ctx, &bind, security).await
        }
        Commands::Install { manager, package } => {
            let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
            let installer = PackageInstaller::new(repo);
            let record = installer.install(manager.into(), &package, None).await?;
            if record.success {
                println!("installed {}", record.package_name);
            } else {
                eprintln!("install failed:\n{}", record.output);
                std::process::exit(1);
            }
            Ok(())
        }
    }
}
