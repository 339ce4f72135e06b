//! Optional package-install helper.
//!
//! Lets an operator install upstream server packages (`npm`, `apt`, `pip`,
//! `uv`) through the gateway. Refuses to run unless
//! `METAMCP_INSTALL_ENABLED` is truthy, validates package names against a
//! conservative character class, and appends every attempt to the audit
//! trail. Nothing in the gateway ever reads the audit back.

use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use metamcp_core::{GatewayError, PackageInstallRecord, PackageManager, Repository, Result};

fn is_valid_package_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '@' | '/' | '.' | '_' | '-'))
}

fn command_for(manager: PackageManager, package: &str) -> (String, Vec<String>) {
    match manager {
        PackageManager::Npm => (
            "npm".into(),
            vec!["install".into(), "-g".into(), package.into()],
        ),
        PackageManager::Apt => (
            "apt-get".into(),
            vec!["install".into(), "-y".into(), package.into()],
        ),
        PackageManager::Pip => ("pip".into(), vec!["install".into(), package.into()]),
        PackageManager::Uv => (
            "uv".into(),
            vec!["pip".into(), "install".into(), package.into()],
        ),
    }
}

/// Runs gated package installs and records them.
pub struct PackageInstaller {
    repo: Arc<dyn Repository>,
}

impl PackageInstaller {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        Self { repo }
    }

    pub async fn install(
        &self,
        manager: PackageManager,
        package: &str,
        user_id: Option<Uuid>,
    ) -> Result<PackageInstallRecord> {
        if !metamcp_state::env_install_enabled() {
            return Err(GatewayError::Authorization(
                "package installs are disabled; set METAMCP_INSTALL_ENABLED=1 to allow them"
                    .into(),
            ));
        }
        if !is_valid_package_name(package) {
            return Err(GatewayError::Validation(format!(
                "invalid package name '{package}': only [A-Za-z0-9@/._-] is allowed"
            )));
        }

        let (program, args) = command_for(manager, package);
        let command_line = format!("{program} {}", args.join(" "));
        info!(
            target: "metamcp::installer",
            manager = manager.label(),
            package,
            "running package install"
        );

        let output = tokio::process::Command::new(&program)
            .args(&args)
            .output()
            .await
            .map_err(|e| GatewayError::Internal(format!("spawn '{command_line}': {e}")))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.stderr.is_empty() {
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
        }
        let success = output.status.success();
        if !success {
            warn!(
                target: "metamcp::installer",
                manager = manager.label(),
                package,
                status = %output.status,
                "package install failed"
            );
        }

        let record = PackageInstallRecord {
            uuid: Uuid::new_v4(),
            manager,
            package_name: package.to_string(),
            command: command_line,
            output: combined,
            success,
            user_id,
            created_at: OffsetDateTime::now_utc(),
        };
        self.repo.append_install_record(record.clone()).await?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metamcp_core::MemoryRepository;
    use metamcp_test_utils::{env_guard, set_env_var};

    #[test]
    fn package_name_character_class() {
        assert!(is_valid_package_name("@modelcontextprotocol/server-filesystem"));
        assert!(is_valid_package_name("requests"));
        assert!(is_valid_package_name("ruff-0.4.1"));
        assert!(!is_valid_package_name(""));
        assert!(!is_valid_package_name("pkg; rm -rf /"));
        assert!(!is_valid_package_name("pkg name"));
        assert!(!is_valid_package_name("pkg&&true"));
    }

    #[test]
    fn commands_match_each_manager() {
        let (program, args) = command_for(PackageManager::Npm, "left-pad");
        assert_eq!(program, "npm");
        assert_eq!(args, vec!["install", "-g", "left-pad"]);

        let (program, args) = command_for(PackageManager::Uv, "httpx");
        assert_eq!(program, "uv");
        assert_eq!(args, vec!["pip", "install", "httpx"]);

        let (program, _) = command_for(PackageManager::Apt, "jq");
        assert_eq!(program, "apt-get");

        let (program, _) = command_for(PackageManager::Pip, "httpx");
        assert_eq!(program, "pip");
    }

    #[tokio::test]
    async fn install_refuses_without_the_env_gate() {
        let _serial = env_guard();
        let _gate = set_env_var("METAMCP_INSTALL_ENABLED", None);
        let installer = PackageInstaller::new(Arc::new(MemoryRepository::new()));

        let err = installer
            .install(PackageManager::Npm, "left-pad", None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Authorization(_)));
    }

    #[tokio::test]
    async fn install_rejects_hostile_names_before_spawning() {
        let _serial = env_guard();
        let _gate = set_env_var("METAMCP_INSTALL_ENABLED", Some("1"));
        let installer = PackageInstaller::new(Arc::new(MemoryRepository::new()));

        let err = installer
            .install(PackageManager::Pip, "pkg; rm -rf /", None)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }
}
