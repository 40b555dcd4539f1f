use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const SETTINGS_DIRECTORY_NAME: &str = "duet";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "duet.db";
pub const ENV_PREFIX: &str = "DUET_";
/// Sender name used when the profile service has no name for the user.
pub const DEFAULT_PLACEHOLDER_DISPLAY_NAME: &str = "Anonymous";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSettings {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_placeholder_display_name")]
    pub placeholder_display_name: String,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            placeholder_display_name: default_placeholder_display_name(),
        }
    }
}

impl ChatSettings {
    pub fn normalized(mut self) -> Self {
        if self.database_path.as_os_str().is_empty() {
            self.database_path = default_database_path();
        }
        self.placeholder_display_name = match self.placeholder_display_name.trim() {
            "" => default_placeholder_display_name(),
            name => name.to_string(),
        };
        self
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<ChatSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".duet"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &PathBuf {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<ChatSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: ChatSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    // Precedence: defaults, then the JSON file, then DUET_* environment variables.
    fn load_from_disk(path: &PathBuf) -> ChatSettings {
        let mut figment = Figment::from(Serialized::defaults(ChatSettings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX));

        match figment.extract::<ChatSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                ChatSettings::default()
            }
        }
    }

    fn persist(&self, settings: &ChatSettings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!("saved settings to {:?}", self.config_path);
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
        .unwrap_or_else(|| PathBuf::from(".duet"))
        .join(DATABASE_FILE_NAME)
}

fn default_placeholder_display_name() -> String {
    DEFAULT_PLACEHOLDER_DISPLAY_NAME.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let directory = tempfile::tempdir().expect("temp dir");
        let store = SettingsStore::new(directory.path().join("absent.json"));
        let settings = store.settings();
        assert_eq!(
            settings.placeholder_display_name,
            DEFAULT_PLACEHOLDER_DISPLAY_NAME
        );
        assert!(settings.database_path.ends_with(DATABASE_FILE_NAME));
    }

    #[test]
    fn update_persists_and_reloads() {
        let directory = tempfile::tempdir().expect("temp dir");
        let path = directory.path().join("nested").join(SETTINGS_FILE_NAME);
        let store = SettingsStore::new(path.clone());

        store
            .update(ChatSettings {
                database_path: directory.path().join("chat.db"),
                placeholder_display_name: "  Guest  ".to_string(),
            })
            .expect("update");

        assert_eq!(store.settings().placeholder_display_name, "Guest");
        let reloaded = SettingsStore::new(path);
        assert_eq!(*reloaded.settings(), *store.settings());
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_keys() {
        let directory = tempfile::tempdir().expect("temp dir");
        let path = directory.path().join(SETTINGS_FILE_NAME);
        std::fs::write(&path, r#"{ "placeholder_display_name": "" }"#).expect("write");

        let settings = SettingsStore::new(path).settings();
        assert_eq!(
            settings.placeholder_display_name,
            DEFAULT_PLACEHOLDER_DISPLAY_NAME
        );
    }
}
