use anyhow::{Context, Result};
use rustmake_core::actions::ActionRegistry;
use rustmake_core::storage::RedbStore;
use rustmake_core::workflow::RunCoordinator;
use rustmake_core::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub ui: UiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_index_file")]
    pub index_file: String,
}

fn default_index_file() -> String {
    "rustmake.redb".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            index_file: default_index_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiConfig {
    /// Directory of static frontend files, relative to the working directory
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,
}

fn default_static_dir() -> PathBuf {
    PathBuf::from("public")
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            static_dir: default_static_dir(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        // Create data directory if it doesn't exist
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        // Load config file if it exists, otherwise use defaults
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self::default()
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    /// Get the redb store path
    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.index_file)
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<RedbStore>,
    pub coordinator: RunCoordinator,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let store = Arc::new(
            RedbStore::new(config.index_path()).context("Failed to create workflow store")?,
        );

        let actions = Arc::new(ActionRegistry::with_builtins());
        tracing::info!("Registered actions: {}", actions.names().join(", "));

        let coordinator = RunCoordinator::new(
            actions,
            store.clone(),
            store.clone(),
            config.engine.clone(),
        );

        Ok(Self {
            store,
            coordinator,
            config: Arc::new(config.clone()),
        })
    }
}
