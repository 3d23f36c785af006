//! Configuration management.
//!
//! Configuration merges, in increasing priority: built-in defaults, a TOML
//! file (`~/.config/pipeflow/config.toml`), `PIPEFLOW_*` environment
//! variables, and CLI flags applied by the binary.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// pipeflow server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub fs: FsConfig,

    #[serde(default)]
    pub reclaim: ReclaimConfig,
}

/// Listen address for the API transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database; defaults to the data directory.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

/// Logical-filesystem configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsConfig {
    /// Root directory backing local filesystems.
    #[serde(default = "default_fs_root")]
    pub root: PathBuf,

    /// Host/port the filesystem server is reachable on (for image prep).
    #[serde(default = "default_host")]
    pub server_host: String,

    #[serde(default = "default_fs_port")]
    pub server_port: u16,

    /// Where a run's yaml is read from when the request names no source.
    #[serde(default = "default_run_yaml_path")]
    pub default_run_yaml_path: String,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            root: default_fs_root(),
            server_host: default_host(),
            server_port: default_fs_port(),
            default_run_yaml_path: default_run_yaml_path(),
        }
    }
}

fn default_fs_root() -> PathBuf {
    PathBuf::from("./pfs")
}

fn default_fs_port() -> u16 {
    8999
}

fn default_run_yaml_path() -> String {
    "./run.yaml".to_string()
}

/// Terminal-run reclamation, enforced by an external janitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReclaimConfig {
    /// Whether finished jobs are cleaned up at all.
    #[serde(default)]
    pub clean_job: bool,

    /// Keep failed jobs around for debugging.
    #[serde(default)]
    pub skip_clean_failed_job: bool,

    /// Seconds a terminal run's jobs are kept before reclamation.
    #[serde(default = "default_job_ttl_seconds")]
    pub job_ttl_seconds: i64,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            clean_job: false,
            skip_clean_failed_job: false,
            job_ttl_seconds: default_job_ttl_seconds(),
        }
    }
}

fn default_job_ttl_seconds() -> i64 {
    600
}

impl Config {
    /// Load configuration from default locations.
    pub fn load() -> Self {
        let mut config = Self::default();
        let path = Self::config_dir().join("config.toml");
        if let Ok(loaded) = Self::load_from_path(&path) {
            config = loaded;
        }
        config.apply_env_overrides();
        config
    }

    /// Get the data directory.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("pipeflow"))
            .unwrap_or_else(|| PathBuf::from(".pipeflow"))
    }

    /// Get the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("pipeflow"))
            .unwrap_or_else(|| PathBuf::from(".pipeflow"))
    }

    /// Effective database path.
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("pipeflow.db"))
    }

    fn load_from_path(path: &Path) -> std::result::Result<Self, ()> {
        let content = std::fs::read_to_string(path).map_err(|_| ())?;
        toml::from_str(&content).map_err(|_| ())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("PIPEFLOW_SERVER_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("PIPEFLOW_SERVER_PORT") {
            if let Ok(parsed) = port.parse() {
                self.server.port = parsed;
            }
        }
        if let Ok(path) = std::env::var("PIPEFLOW_DATABASE_PATH") {
            self.storage.database_path = Some(PathBuf::from(path));
        }
        if let Ok(root) = std::env::var("PIPEFLOW_FS_ROOT") {
            self.fs.root = PathBuf::from(root);
        }
        if let Ok(ttl) = std::env::var("PIPEFLOW_JOB_TTL_SECONDS") {
            if let Ok(parsed) = ttl.parse() {
                self.reclaim.job_ttl_seconds = parsed;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.fs.default_run_yaml_path, "./run.yaml");
        assert_eq!(config.reclaim.job_ttl_seconds, 600);
        assert!(!config.reclaim.clean_job);
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
[server]
port = 9090

[reclaim]
clean_job = true
job_ttl_seconds = 120
"#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "127.0.0.1");
        assert!(config.reclaim.clean_job);
        assert_eq!(config.reclaim.job_ttl_seconds, 120);
    }
}
