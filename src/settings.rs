use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheStrategy, DEFAULT_MAX_CACHED_DOCUMENTS, DEFAULT_PAGES_PER_DOCUMENT};
use crate::events::EventSink;
use crate::prefetch::DEFAULT_PREFETCH_DISTANCE;
use crate::render::DEFAULT_WORKERS;
use crate::session::SessionOptions;
use crate::types::RenderQuality;

pub const CURRENT_VERSION: u32 = 1;
const SETTINGS_FILENAME: &str = "config.yaml";
const APP_NAME: &str = "folio";
const PAGES_DIR: &str = "pages";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("I/O on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings in {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub cache_strategy: CacheStrategy,

    #[serde(default = "default_memory_pages")]
    pub memory_pages: usize,

    #[serde(default = "default_max_cached_documents")]
    pub max_cached_documents: usize,

    /// Persistent tier location; the platform cache directory when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,

    #[serde(default = "default_prefetch_distance")]
    pub prefetch_distance: usize,

    #[serde(default = "default_prefetch_debounce_ms")]
    pub prefetch_debounce_ms: u64,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default)]
    pub render_quality: RenderQuality,
}

fn default_version() -> u32 {
    CURRENT_VERSION
}

fn default_memory_pages() -> usize {
    DEFAULT_MAX_CACHED_DOCUMENTS * DEFAULT_PAGES_PER_DOCUMENT
}

fn default_max_cached_documents() -> usize {
    DEFAULT_MAX_CACHED_DOCUMENTS
}

fn default_prefetch_distance() -> usize {
    DEFAULT_PREFETCH_DISTANCE
}

fn default_prefetch_debounce_ms() -> u64 {
    100
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: CURRENT_VERSION,
            cache_strategy: CacheStrategy::default(),
            memory_pages: default_memory_pages(),
            max_cached_documents: default_max_cached_documents(),
            cache_dir: None,
            prefetch_distance: default_prefetch_distance(),
            prefetch_debounce_ms: default_prefetch_debounce_ms(),
            workers: default_workers(),
            render_quality: RenderQuality::default(),
        }
    }
}

/// `<config dir>/folio/config.yaml`
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|config| config.join(APP_NAME).join(SETTINGS_FILENAME))
}

/// `<cache dir>/folio/pages`
#[must_use]
pub fn default_cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|cache| cache.join(APP_NAME).join(PAGES_DIR))
}

impl Settings {
    pub fn load_from_path(path: &Path) -> Result<Self, SettingsError> {
        let content = fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut settings: Settings =
            serde_yaml::from_str(&content).map_err(|source| SettingsError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        debug!("Loaded settings from {path:?}");

        if settings.version < CURRENT_VERSION {
            migrate_settings(&mut settings);
        }
        Ok(settings)
    }

    /// Settings from `path` (or the default location), falling back to
    /// defaults when the file is missing or unreadable
    #[must_use]
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let path = path.map(Path::to_path_buf).or_else(default_config_path);
        let Some(path) = path else {
            warn!("Could not determine config directory, using default settings");
            return Self::default();
        };
        if !path.exists() {
            info!("Settings file {path:?} not found, using defaults");
            return Self::default();
        }
        match Self::load_from_path(&path) {
            Ok(settings) => settings,
            Err(e) => {
                error!("{e}");
                Self::default()
            }
        }
    }

    pub fn save_to_path(&self, path: &Path) -> Result<(), SettingsError> {
        let io = |source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(io)?;
            }
        }
        let content = serde_yaml::to_string(self).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, content).map_err(io)?;
        debug!("Saved settings to {path:?}");
        Ok(())
    }

    #[must_use]
    pub fn prefetch_debounce(&self) -> Duration {
        Duration::from_millis(self.prefetch_debounce_ms)
    }

    /// Session options for these settings, reporting to `sink`
    #[must_use]
    pub fn session_options(&self, sink: Arc<dyn EventSink>) -> SessionOptions {
        SessionOptions {
            cache_strategy: self.cache_strategy,
            memory_pages: self.memory_pages,
            max_cached_documents: self.max_cached_documents,
            cache_dir: self.cache_dir.clone().or_else(default_cache_dir),
            prefetch_distance: self.prefetch_distance,
            prefetch_debounce: self.prefetch_debounce(),
            workers: self.workers.max(1),
            quality: self.render_quality,
            sink,
        }
    }
}

fn migrate_settings(settings: &mut Settings) {
    info!(
        "Migrating settings from v{} to v{}",
        settings.version, CURRENT_VERSION
    );
    settings.version = CURRENT_VERSION;
}
