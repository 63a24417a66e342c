use arc_swap::ArcSwap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::AppConfig;
use crate::error::{AppError, Result};

/// Configuration store backed by a JSON file
///
/// Uses `ArcSwap` for lock-free reads, providing high performance
/// for frequent configuration access in hot paths.
#[derive(Clone)]
pub struct ConfigStore {
    /// Backing file; `None` keeps the configuration in memory only
    path: Option<PathBuf>,
    /// Lock-free cache using ArcSwap for zero-cost reads
    cache: Arc<ArcSwap<AppConfig>>,
    change_tx: broadcast::Sender<ConfigChange>,
}

/// Configuration change event
#[derive(Debug, Clone)]
pub struct ConfigChange {
    pub key: String,
}

impl ConfigStore {
    /// Open the configuration file, writing defaults if it does not exist
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let config = match tokio::fs::read_to_string(path).await {
            Ok(json) => serde_json::from_str(&json).map_err(|e| {
                AppError::Config(format!("invalid config file {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = AppConfig::default();
                Self::save_to_file(path, &config).await?;
                config
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self::with_config(Some(path.to_path_buf()), config))
    }

    /// In-memory store that never touches the disk
    pub fn in_memory(config: AppConfig) -> Self {
        Self::with_config(None, config)
    }

    fn with_config(path: Option<PathBuf>, config: AppConfig) -> Self {
        let (change_tx, _) = broadcast::channel(16);
        Self {
            path,
            cache: Arc::new(ArcSwap::from_pointee(config)),
            change_tx,
        }
    }

    async fn save_to_file(path: &Path, config: &AppConfig) -> Result<()> {
        let json = serde_json::to_string_pretty(config)?;
        // Write then rename so a crash never leaves a truncated file
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Get current configuration (lock-free, zero-copy)
    pub fn get(&self) -> Arc<AppConfig> {
        self.cache.load_full()
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Re-read the backing file and publish the result
    ///
    /// `overrides` is applied on top of the file contents, so command line
    /// overrides survive a reload. An unreadable or invalid file leaves the
    /// cached configuration untouched.
    pub async fn reload<F>(&self, overrides: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        let Some(path) = &self.path else {
            return Err(AppError::Config("no config file to reload".to_string()));
        };

        let json = tokio::fs::read_to_string(path).await?;
        let mut config: AppConfig = serde_json::from_str(&json).map_err(|e| {
            AppError::Config(format!("invalid config file {}: {}", path.display(), e))
        })?;
        overrides(&mut config);

        self.cache.store(Arc::new(config));

        // Notify subscribers
        let _ = self.change_tx.send(ConfigChange {
            key: "app_config".to_string(),
        });

        Ok(())
    }

    /// Change the cached configuration without writing it back
    ///
    /// Used for command line overrides.
    pub fn apply_overrides<F>(&self, f: F)
    where
        F: FnOnce(&mut AppConfig),
    {
        let mut config = (*self.get()).clone();
        f(&mut config);
        self.cache.store(Arc::new(config));
    }

    /// Subscribe to configuration changes
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }
}
