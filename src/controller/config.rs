use crate::controller::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use tracing::trace;

fn default_server_id() -> String {
    "netweave".to_string()
}

fn default_cache_enabled() -> bool {
    true
}

fn default_status_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// The `{ServerID}` segment of every per-host broker topic.
    #[serde(default = "default_server_id")]
    pub server_id: String,
    #[serde(default = "default_cache_enabled")]
    pub cache_enabled: bool,
    /// Seconds between server-status housekeeping passes.
    #[serde(default = "default_status_interval")]
    pub status_interval_secs: u64,
    #[serde(default)]
    pub is_pro: bool,
    #[serde(default)]
    pub license_error: String,
    #[serde(default)]
    pub trial_end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_on_trial_license: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_id: default_server_id(),
            cache_enabled: default_cache_enabled(),
            status_interval_secs: default_status_interval(),
            is_pro: false,
            license_error: String::new(),
            trial_end_date: None,
            is_on_trial_license: false,
        }
    }
}

impl ServerConfig {
    pub fn load_or_generate(path: &str) -> Result<Self, Error> {
        let config = if std::path::Path::new(path).exists() {
            trace!("Config file exists, loading from {}", path);
            let content = fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            trace!("Config file does not exist, generating new one");
            let config = ServerConfig::default();
            let content = toml::to_string_pretty(&config)?;

            fs::write(path, "")?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mut perms = fs::metadata(path)?.permissions();
                perms.set_mode(0o600);
                fs::set_permissions(path, perms)?;
            }

            fs::write(path, &content)?;
            trace!("Wrote config file to {}", path);

            config
        };

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn generates_default_config_when_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let path = path.to_str().unwrap();

        let config = ServerConfig::load_or_generate(path).unwrap();
        assert_eq!(config.server_id, "netweave");
        assert!(config.cache_enabled);

        // second load reads the generated file back
        let reloaded = ServerConfig::load_or_generate(path).unwrap();
        assert_eq!(reloaded.server_id, config.server_id);
    }

    #[test]
    fn loads_existing_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "server_id = \"ctrl-7\"\ncache_enabled = false\n").unwrap();

        let config = ServerConfig::load_or_generate(path.to_str().unwrap()).unwrap();
        assert_eq!(config.server_id, "ctrl-7");
        assert!(!config.cache_enabled);
        assert_eq!(config.status_interval_secs, 30);
    }
}
