use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const DEFAULT_PAGE_SIZE: usize = 30;
pub const SETTINGS_DIRECTORY_NAME: &str = "courier";
pub const SETTINGS_FILE_NAME: &str = "feed.json";
pub const SETTINGS_ENV_PREFIX: &str = "COURIER_FEED_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSettings {
    /// Rows requested per page; also the exhaustion threshold.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Keeps only the newest N search results when set.
    #[serde(default)]
    pub search_result_limit: Option<usize>,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            search_result_limit: None,
        }
    }
}

impl FeedSettings {
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self.normalized()
    }

    pub fn normalized(mut self) -> Self {
        if self.page_size == 0 {
            self.page_size = default_page_size();
        }
        if self.search_result_limit == Some(0) {
            self.search_result_limit = None;
        }
        self
    }
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FeedSettingsError {
    #[snafu(display("failed to create config directory at {path:?}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize feed settings"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write feed settings to {path:?}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to move {from:?} into place at {to:?}"))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

/// Layered settings: defaults, then the JSON file, then `COURIER_FEED_*` variables.
pub struct FeedSettingsStore {
    settings: Arc<ArcSwap<FeedSettings>>,
    config_path: PathBuf,
}

impl FeedSettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".courier"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<FeedSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: FeedSettings) -> Result<(), FeedSettingsError> {
        let normalized = settings.normalized();
        self.persist(&normalized)?;
        self.settings.store(Arc::new(normalized));
        Ok(())
    }

    fn load_from(path: &Path) -> FeedSettings {
        if !path.exists() {
            tracing::info!("feed settings not found at {:?}, using defaults", path);
        }

        let figment = Figment::from(Serialized::defaults(FeedSettings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(SETTINGS_ENV_PREFIX));

        match figment.extract::<FeedSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse feed settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                FeedSettings::default()
            }
        }
    }

    fn persist(&self, settings: &FeedSettings) -> Result<(), FeedSettingsError> {
        if let Some(parent) = self.config_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-feed-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-feed-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-feed-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-feed-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved feed settings to {:?}", self.config_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FeedSettingsStore::new(dir.path().join("absent.json"));

        assert_eq!(*store.settings(), FeedSettings::default());
    }

    #[test]
    fn file_values_override_defaults_and_are_normalized() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, r#"{ "page_size": 0, "search_result_limit": 5 }"#).expect("write");

        let settings = FeedSettingsStore::new(path).settings();

        assert_eq!(settings.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(settings.search_result_limit, Some(5));
    }

    #[test]
    fn update_persists_and_reloads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join(SETTINGS_FILE_NAME);
        let store = FeedSettingsStore::new(path.clone());

        store
            .update(FeedSettings::default().with_page_size(12))
            .expect("persist");

        assert_eq!(store.settings().page_size, 12);
        assert_eq!(FeedSettingsStore::new(path).settings().page_size, 12);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, r#"{ "page_size": "many" }"#).expect("write");

        assert_eq!(*FeedSettingsStore::new(path).settings(), FeedSettings::default());
    }
}
