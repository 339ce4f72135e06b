//! Command-line interface for the `metamcp` binary.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use metamcp_core::PackageManager;

/// Package manager choices for `metamcp install`.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum InstallManager {
    Npm,
    Apt,
    Pip,
    Uv,
}

impl From<InstallManager> for PackageManager {
    fn from(manager: InstallManager) -> Self {
        match manager {
            InstallManager::Npm => PackageManager::Npm,
            InstallManager::Apt => PackageManager::Apt,
            InstallManager::Pip => PackageManager::Pip,
            InstallManager::Uv => PackageManager::Uv,
        }
    }
}

/// MetaMCP gateway.
#[derive(Debug, Parser)]
#[command(
    name = "metamcp",
    about = "Aggregate upstream MCP servers into namespace endpoints"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Serve the configured namespaces over SSE and Streamable HTTP.
    Serve {
        /// Socket address to bind.
        #[arg(long, default_value = "127.0.0.1:12008")]
        bind: String,
        /// JSON seed config with servers and namespaces.
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
        /// Gateway-wide bearer token downstream clients may present.
        #[arg(long, env = "METAMCP_AUTH_TOKEN")]
        auth_token: Option<String>,
        /// Per-namespace bearer token as ENDPOINT=TOKEN (repeatable). An
        /// endpoint with a token admits only that token or the gateway-wide
        /// one.
        #[arg(long = "endpoint-token", value_name = "ENDPOINT=TOKEN")]
        endpoint_tokens: Vec<String>,
        /// TLS certificate (PEM). Requires --tls-key.
        #[arg(long, value_name = "FILE", requires = "tls_key")]
        tls_cert: Option<PathBuf>,
        /// TLS private key (PEM). Requires --tls-cert.
        #[arg(long, value_name = "FILE", requires = "tls_cert")]
        tls_key: Option<PathBuf>,
        /// Allowed CORS origin (repeatable; "*" for any).
        #[arg(long = "cors-origin", value_name = "ORIGIN")]
        cors_origins: Vec<String>,
    },
    /// Install an upstream server package (gated by METAMCP_INSTALL_ENABLED).
    Install {
        /// Package manager to use.
        #[arg(value_enum)]
        manager: InstallManager,
        /// Package name ([A-Za-z0-9@/._-] only).
        package: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_parses_with_defaults() {
        let cli = Cli::try_parse_from(["metamcp", "serve"]).unwrap();
        match cli.command {
            Commands::Serve { bind, config, .. } => {
                assert_eq!(bind, "127.0.0.1:12008");
                assert!(config.is_none());
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn tls_flags_must_come_in_pairs() {
        let result = Cli::try_parse_from(["metamcp", "serve", "--tls-cert", "cert.pem"]);
        assert!(result.is_err());
    }

    #[test]
    fn endpoint_tokens_are_repeatable() {
        let cli = Cli::try_parse_from([
            "metamcp",
            "serve",
            "--endpoint-token",
            "dev=dev-secret",
            "--endpoint-token",
            "prod=prod-secret",
        ])
        .unwrap();
        match cli.command {
            Commands::Serve { endpoint_tokens, .. } => {
                assert_eq!(endpoint_tokens, vec!["dev=dev-secret", "prod=prod-secret"]);
            }
            _ => panic!("expected serve"),
        }
    }

    #[test]
    fn install_parses_manager_and_package() {
        let cli = Cli::try_parse_from(["metamcp", "install", "npm", "left-pad"]).unwrap();
        match cli.command {
            Commands::Install { manager, package } => {
                assert!(matches!(manager, InstallManager::Npm));
                assert_eq!(package, "left-pad");
            }
            _ => panic!("expected install"),
        }
    }
}
