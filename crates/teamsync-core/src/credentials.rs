//! Credentials for the source and target instances.
//!
//! The source side is configured from environment files (`local.env` in the
//! working directory, then `~/supervisely.env`). The target side comes from
//! a `target.env` file that may be stored in the source team's files, or is
//! entered by the user.

use crate::config::{Instance, PathsConfig};
use crate::platform::{HttpPlatform, PlatformApi};
use crate::{Result, SyncError};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const SOURCE_ADDRESS_VAR: &str = "SERVER_ADDRESS";
pub const SOURCE_TOKEN_VAR: &str = "API_TOKEN";
pub const TEAM_ID_VAR: &str = "TEAM_ID";
/// Path of `target.env` inside the team files.
pub const TARGET_FILE_VAR: &str = "FILE";
pub const TARGET_TOKEN_VAR: &str = "TARGET_API_TOKEN";
pub const TARGET_ADDRESS_VAR: &str = "TARGET_SERVER_ADDRESS";

/// Shown when the target rejects the address/key pair.
pub const TARGET_CONNECTION_FAILED: &str =
    "The connection to the Target API failed, check the key.";

/// Shown when the target address cannot be reached at all.
pub const TARGET_UNREACHABLE: &str =
    "The Target instance could not be reached, check the address.";

/// Address and API key of one instance.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub address: String,
    pub api_key: String,
}

impl Credentials {
    /// `address` may be an instance name (`Assets`, `Dev`, `App`) or a URL.
    pub fn new(address: &str, api_key: impl Into<String>) -> Self {
        Self {
            address: Instance::resolve_address(address),
            api_key: api_key.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Source-side settings read from the environment.
#[derive(Debug, Clone)]
pub struct SourceEnv {
    pub credentials: Credentials,
    pub team_id: Option<i64>,
    /// Team-files path of `target.env`, when provided.
    pub target_file: Option<String>,
}

/// Load `local.env` from `work_dir` and `~/supervisely.env` into the
/// process environment. Variables already set are kept.
pub fn load_env_files(work_dir: &Path) {
    let mut candidates = vec![work_dir.join(PathsConfig::LOCAL_ENV_FILE_NAME)];
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join(PathsConfig::HOME_ENV_FILE_NAME));
    }

    for path in candidates {
        match dotenvy::from_path(&path) {
            Ok(()) => debug!("Loaded environment from {}", path.display()),
            Err(e) if e.not_found() => debug!("No environment file at {}", path.display()),
            Err(e) => warn!("Failed to load {}: {}", path.display(), e),
        }
    }
}

/// Read source credentials from the process environment.
pub fn source_from_env() -> Result<SourceEnv> {
    let address = required_var(SOURCE_ADDRESS_VAR)?;
    let api_key = required_var(SOURCE_TOKEN_VAR)?;

    let team_id = match std::env::var(TEAM_ID_VAR) {
        Ok(value) => Some(value.trim().parse::<i64>().map_err(|e| SyncError::Config {
            message: format!("{} is not a valid team id: {}", TEAM_ID_VAR, e),
        })?),
        Err(_) => None,
    };

    Ok(SourceEnv {
        credentials: Credentials::new(&address, api_key),
        team_id,
        target_file: std::env::var(TARGET_FILE_VAR).ok().filter(|v| !v.is_empty()),
    })
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| SyncError::Config {
            message: format!("Environment variable {} is not set", name),
        })
}

/// Parse a `target.env` file without touching the process environment.
///
/// Returns `None` when either variable is missing.
pub fn target_from_env_file(path: &Path) -> Result<Option<Credentials>> {
    let iter = dotenvy::from_path_iter(path).map_err(|e| SyncError::Config {
        message: format!("Failed to read {}: {}", path.display(), e),
    })?;

    let mut vars = HashMap::new();
    for item in iter {
        let (key, value) = item.map_err(|e| SyncError::Config {
            message: format!("Failed to parse {}: {}", path.display(), e),
        })?;
        vars.insert(key, value);
    }

    match (vars.get(TARGET_ADDRESS_VAR), vars.get(TARGET_TOKEN_VAR)) {
        (Some(address), Some(token)) if !token.trim().is_empty() => {
            Ok(Some(Credentials::new(address, token.clone())))
        }
        _ => Ok(None),
    }
}

/// Fetch `target.env` from the source team files into `work_dir` and parse
/// it. Any failure means no preset credentials.
pub async fn target_from_team_files(
    source: &dyn PlatformApi,
    team_id: i64,
    remote_path: &str,
    work_dir: &Path,
) -> Option<Credentials> {
    let local: PathBuf = work_dir.join(PathsConfig::TARGET_ENV_FILE_NAME);
    let loaded: Result<Option<Credentials>> = async {
        source
            .download_team_file(team_id, remote_path, &local)
            .await?;
        info!("Target API key file was downloaded to {}.", local.display());
        target_from_env_file(&local)
    }
    .await;

    match loaded {
        Ok(Some(credentials)) => {
            info!("Target API key and instance were loaded from the team files.");
            Some(credentials)
        }
        Ok(None) | Err(_) => {
            info!("No file with Target API key was provided, starting in input mode.");
            None
        }
    }
}

/// Verify a target with one authenticated call.
///
/// A rejected key and an unreachable address map to different user-facing
/// messages; both are [`SyncError::Connection`].
pub async fn verify_target(target: &dyn PlatformApi) -> Result<()> {
    match target.check_connection().await {
        Ok(()) => {
            info!("Connected to target instance {}.", target.address());
            Ok(())
        }
        Err(e) => {
            warn!("Target connection check failed: {}", e);
            let message = if e.is_auth_failure() {
                TARGET_CONNECTION_FAILED
            } else {
                TARGET_UNREACHABLE
            };
            Err(SyncError::Connection {
                address: target.address().to_string(),
                message: message.to_string(),
            })
        }
    }
}

/// Build a client for the target and verify it.
pub async fn connect_target(credentials: &Credentials) -> Result<HttpPlatform> {
    let platform =
        HttpPlatform::new(&credentials.address, &credentials.api_key).map_err(|e| {
            warn!("Target client could not be created: {}", e);
            SyncError::Connection {
                address: credentials.address.clone(),
                message: TARGET_CONNECTION_FAILED.to_string(),
            }
        })?;
    verify_target(&platform).await?;
    Ok(platform)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::MemoryPlatform;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_credentials_resolve_instance_name() {
        let creds = Credentials::new("Dev", "secret-key");
        assert_eq!(creds.address, "https://dev.supervise.ly/");
        assert!(!format!("{:?}", creds).contains("secret-key"));

        let creds = Credentials::new("https://custom.example/", "k");
        assert_eq!(creds.address, "https://custom.example/");
    }

    #[test]
    fn test_target_env_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("target.env");
        fs::write(
            &path,
            "TARGET_SERVER_ADDRESS=\"https://assets.supervise.ly/\"\nTARGET_API_TOKEN=abc123\n",
        )
        .unwrap();

        let creds = target_from_env_file(&path).unwrap().unwrap();
        assert_eq!(creds.address, "https://assets.supervise.ly/");
        assert_eq!(creds.api_key, "abc123");
    }

    #[test]
    fn test_target_env_file_missing_token() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("target.env");
        fs::write(&path, "TARGET_SERVER_ADDRESS=https://assets.supervise.ly/\n").unwrap();
        assert!(target_from_env_file(&path).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_target_from_team_files() {
        let dir = TempDir::new().unwrap();
        let source = MemoryPlatform::new("memory://source");
        let team = source.add_team("team");
        source.put_team_file(
            team.id,
            "/keys/target.env",
            b"TARGET_SERVER_ADDRESS=App\nTARGET_API_TOKEN=secret\n".to_vec(),
        );

        let creds = target_from_team_files(&source, team.id, "/keys/target.env", dir.path())
            .await
            .unwrap();
        assert_eq!(creds.address, "https://app.supervise.ly/");
        assert!(dir.path().join("target.env").exists());

        let missing =
            target_from_team_files(&source, team.id, "/keys/other.env", dir.path()).await;
        assert!(missing.is_none());
    }

    fn connection_message(err: SyncError) -> String {
        match err {
            SyncError::Connection { message, .. } => message,
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_verify_target_accepts_valid_key() {
        let target = MemoryPlatform::new("memory://target");
        verify_target(&target).await.unwrap();
    }

    #[tokio::test]
    async fn test_verify_target_rejected_key() {
        let target = MemoryPlatform::rejecting_key("memory://target");
        let err = verify_target(&target).await.unwrap_err();
        assert!(err.is_user_facing());
        assert_eq!(connection_message(err), TARGET_CONNECTION_FAILED);
    }

    #[tokio::test]
    async fn test_verify_target_unreachable_address() {
        let target = MemoryPlatform::unreachable("memory://nowhere");
        let err = verify_target(&target).await.unwrap_err();
        assert_eq!(connection_message(err), TARGET_UNREACHABLE);
    }

    #[tokio::test]
    async fn test_connect_target_rejects_empty_key() {
        let err = connect_target(&Credentials::new("App", "  ")).await.unwrap_err();
        assert_eq!(connection_message(err), TARGET_CONNECTION_FAILED);
    }
}
