//! kiln.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::InstanceTemplate;

/// Environment variable naming an alternative config file.
pub const CONFIG_ENV: &str = "KILN_CONFIG";

/// Environment variable overriding `[api].key`.
pub const API_KEY_ENV: &str = "KILN_API_KEY";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KilnConfig {
    pub api: ApiConfig,
    pub state: StateConfig,
    pub polling: PollingConfig,
    pub releases: ReleasesConfig,
    pub kubeconfig: KubeconfigConfig,
    pub template: InstanceTemplate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    pub url: String,
    pub namespace: String,
    pub key: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:13000".to_string(),
            namespace: "system".to_string(),
            key: None,
        }
    }
}

/// Where cluster records and version caches live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackend {
    /// Namespace metadata on the remote API.
    #[default]
    Api,
    /// A local redb file.
    Local,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StateConfig {
    pub backend: StateBackend,
    /// Path of the redb file for the `local` backend.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollingConfig {
    pub boot_interval_secs: u64,
    pub operation_interval_secs: u64,
    pub deletion_interval_secs: u64,
    pub network_interval_secs: u64,
    /// Seconds after which the metallb pods are assumed to be scheduled.
    pub settle_secs: u64,
    /// Upper bound on any single wait. Unbounded when absent.
    pub deadline_secs: Option<u64>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            boot_interval_secs: 5,
            operation_interval_secs: 1,
            deletion_interval_secs: 1,
            network_interval_secs: 1,
            settle_secs: 5,
            deadline_secs: None,
        }
    }
}

impl PollingConfig {
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReleasesConfig {
    pub k3s_channels_url: String,
    pub longhorn_releases_url: String,
    pub longhorn_pages: u32,
    pub cache_ttl_secs: u64,
    pub user_agent: String,
}

impl Default for ReleasesConfig {
    fn default() -> Self {
        Self {
            k3s_channels_url: "https://update.k3s.io/v1-release/channels".to_string(),
            longhorn_releases_url: "https://api.github.com/repos/longhorn/longhorn/releases"
                .to_string(),
            longhorn_pages: 5,
            cache_ttl_secs: 24 * 3600,
            user_agent: concat!("kiln/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KubeconfigConfig {
    /// Overrides `$KUBECONFIG` / `~/.kube/config`.
    pub path: Option<PathBuf>,
}

impl KilnConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: KilnConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from `path`, `$KILN_CONFIG`, or `~/.kiln/config.toml`, in that
    /// order. A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .or_else(|| home_dir().map(|h| h.join(".kiln").join("config.toml")));

        let mut config = match path {
            Some(p) if p.exists() => Self::from_file(&p)?,
            _ => Self::default(),
        };
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            config.api.key = Some(key);
        }
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Path of the local redb state file, defaulting under `~/.kiln`.
    pub fn state_path(&self) -> anyhow::Result<PathBuf> {
        match &self.state.path {
            Some(path) => Ok(path.clone()),
            None => default_state_path(home_dir()),
        }
    }
}

fn default_state_path(home: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let home = home.ok_or_else(|| {
        anyhow::anyhow!("cannot place the local state file: $HOME is not set; set [state] path")
    })?;
    Ok(home.join(".kiln").join("state.redb"))
}

/// The user's home directory. Unset or empty `$HOME` yields `None`.
pub fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let toml_str = r#"
[api]
url = "https://cloud.example.com/api"
namespace = "team1"
"#;
        let config: KilnConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.api.url, "https://cloud.example.com/api");
        assert_eq!(config.api.namespace, "team1");
        assert_eq!(config.state.backend, StateBackend::Api);
        assert_eq!(config.polling.boot_interval_secs, 5);
        assert_eq!(config.releases.cache_ttl_secs, 86_400);
        assert_eq!(config.template.base_image, "debian:12");
    }

    #[test]
    fn test_local_backend_and_deadline() {
        let toml_str = r#"
[state]
backend = "local"
path = "/tmp/kiln.redb"

[polling]
deadline_secs = 900

[template]
cpus = 4
"#;
        let config: KilnConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.state.backend, StateBackend::Local);
        assert_eq!(config.state_path().unwrap(), PathBuf::from("/tmp/kiln.redb"));
        assert_eq!(config.polling.deadline(), Some(Duration::from_secs(900)));
        assert_eq!(config.template.cpus, 4);
        assert_eq!(config.template.memory_mb, 2048);
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = KilnConfig::default();
        config.api.namespace = "ops".to_string();
        std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

        let loaded = KilnConfig::from_file(&path).unwrap();
        assert_eq!(loaded.api.namespace, "ops");
    }

    #[test]
    fn test_state_path_requires_a_home() {
        let err = default_state_path(None).unwrap_err();
        assert!(err.to_string().contains("[state] path"));

        let path = default_state_path(Some(PathBuf::from("/home/ops"))).unwrap();
        assert_eq!(path, PathBuf::from("/home/ops/.kiln/state.redb"));
    }
}
