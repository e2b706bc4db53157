//! Durable backend selection.
//!
//! `backend.toml` in the data directory records which backend is active and
//! the credentials for each remote backend. A legacy `chat_config.json` is
//! migrated on first load.

use parley_transport::{BackendKind, Credentials};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// File name of the config record.
pub const CONFIG_FILE: &str = "backend.toml";

/// File name of the legacy JSON record.
pub const LEGACY_CONFIG_FILE: &str = "chat_config.json";

/// Config record errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Filesystem error.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Record is not valid TOML for this schema.
    #[error("Invalid config record: {0}")]
    Parse(#[from] toml::de::Error),

    /// Legacy record is not valid JSON for its schema.
    #[error("Invalid legacy config record: {0}")]
    Legacy(#[from] serde_json::Error),

    /// Record could not be serialized.
    #[error("Failed to serialize config record: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Active backend and credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub active_backend: BackendKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supabase: Option<Credentials>,
}

impl BackendConfig {
    /// Credentials stored for `kind`.
    #[must_use]
    pub fn credentials(&self, kind: BackendKind) -> Option<&Credentials> {
        match kind {
            BackendKind::Supabase => self.supabase.as_ref(),
            BackendKind::None | BackendKind::Memory => None,
        }
    }

    /// Store credentials for `kind`. Ignored for kinds without credentials.
    pub fn set_credentials(&mut self, kind: BackendKind, credentials: Credentials) {
        if kind == BackendKind::Supabase {
            self.supabase = Some(credentials);
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyConfig {
    #[serde(default)]
    active_backend: Option<String>,
    #[serde(default)]
    supabase: Option<Credentials>,
}

impl LegacyConfig {
    fn into_config(self) -> BackendConfig {
        let active_backend = self
            .active_backend
            .and_then(|kind| kind.parse().ok())
            .unwrap_or_default();
        let supabase = self
            .supabase
            .filter(|c| !c.url.is_empty() || !c.key.is_empty());
        BackendConfig {
            active_backend,
            supabase,
        }
    }
}

/// Reads and writes the config record.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    legacy_path: PathBuf,
}

impl ConfigStore {
    #[must_use]
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let dir = data_dir.as_ref();
        Self {
            path: dir.join(CONFIG_FILE),
            legacy_path: dir.join(LEGACY_CONFIG_FILE),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the record. An absent record means no backend.
    ///
    /// # Errors
    ///
    /// Returns an error if a record exists but cannot be read or parsed.
    pub async fn load(&self) -> Result<BackendConfig, ConfigError> {
        if let Some(raw) = read_optional(&self.path).await? {
            let config: BackendConfig = toml::from_str(&raw)?;
            debug!(backend = %config.active_backend, "Loaded backend config");
            return Ok(config);
        }

        let Some(raw) = read_optional(&self.legacy_path).await? else {
            return Ok(BackendConfig::default());
        };
        let legacy: LegacyConfig = serde_json::from_str(&raw)?;
        let config = legacy.into_config();
        self.save(&config).await?;
        info!(
            from = %self.legacy_path.display(),
            backend = %config.active_backend,
            "Migrated legacy backend config"
        );
        Ok(config)
    }

    /// Write the record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub async fn save(&self, config: &BackendConfig) -> Result<(), ConfigError> {
        let data = toml::to_string_pretty(config)?;
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| ConfigError::Io {
                    path: dir.to_path_buf(),
                    source,
                })?;
        }
        let tmp = self.path.with_extension("toml.tmp");
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|source| ConfigError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| ConfigError::Io {
                path: self.path.clone(),
                source,
            })
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>, ConfigError> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => Ok(Some(raw)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_absent_is_none() {
        let dir = TempDir::new().unwrap();
        let config = ConfigStore::new(dir.path()).load().await.unwrap();
        assert_eq!(config.active_backend, BackendKind::None);
        assert!(config.supabase.is_none());
    }

    #[tokio::test]
    async fn test_save_load() {
        let dir = TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path());
        let mut config = BackendConfig {
            active_backend: BackendKind::Supabase,
            supabase: None,
        };
        config.set_credentials(
            BackendKind::Supabase,
            Credentials {
                url: "https://demo.supabase.co".into(),
                key: "anon-key".into(),
            },
        );
        config.set_credentials(BackendKind::Memory, Credentials::default());
        store.save(&config).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, config);
        assert_eq!(
            loaded.credentials(BackendKind::Supabase).map(|c| c.key.as_str()),
            Some("anon-key")
        );
        assert!(loaded.credentials(BackendKind::Memory).is_none());
    }

    #[tokio::test]
    async fn test_legacy_migration() {
        let dir = TempDir::new().unwrap();
        let legacy = dir.path().join(LEGACY_CONFIG_FILE);
        std::fs::write(
            &legacy,
            r#"{"activeBackend":"supabase","supabase":{"url":"https://x.supabase.co","key":"k"}}"#,
        )
        .unwrap();

        let store = ConfigStore::new(dir.path());
        let config = store.load().await.unwrap();
        assert_eq!(config.active_backend, BackendKind::Supabase);
        assert_eq!(config.supabase.unwrap().url, "https://x.supabase.co");
        assert!(store.path().exists());
        assert!(legacy.exists());
    }

    #[tokio::test]
    async fn test_legacy_local_and_empty_credentials() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(LEGACY_CONFIG_FILE),
            r#"{"activeBackend":"local","supabase":{"url":"","key":""}}"#,
        )
        .unwrap();

        let config = ConfigStore::new(dir.path()).load().await.unwrap();
        assert_eq!(config, BackendConfig::default());
    }

    #[tokio::test]
    async fn test_toml_wins_over_legacy() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(LEGACY_CONFIG_FILE),
            r#"{"activeBackend":"supabase"}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "active_backend = \"memory\"\n").unwrap();

        let config = ConfigStore::new(dir.path()).load().await.unwrap();
        assert_eq!(config.active_backend, BackendKind::Memory);
    }

    #[tokio::test]
    async fn test_invalid_record() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "active_backend = \"carrier-pigeon\"\n")
            .unwrap();
        assert!(matches!(
            ConfigStore::new(dir.path()).load().await,
            Err(ConfigError::Parse(_))
        ));
    }
}
