use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::auth::AuthSettings;
use crate::constants::{
    DEFAULT_ENV_DIR, DEFAULT_ENV_NAME, DEFAULT_FILES_DIR, DEFAULT_GLOBAL_FILE, DEFAULT_RETRY, DEFAULT_TIMEOUT_SECONDS,
};
use crate::error::{ApiTestError, Result};
use crate::models::Engine;
use crate::request::RequestDefaults;

/// Run settings, read from `apicase.yaml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub env: String,
    pub env_dir: PathBuf,
    pub global_file: PathBuf,
    pub files_dir: PathBuf,
    pub timeout: f64,
    pub retry: u32,
    pub engine: Engine,
    pub database: Option<PathBuf>,
    pub auth: Option<AuthSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            env: DEFAULT_ENV_NAME.to_string(),
            env_dir: PathBuf::from(DEFAULT_ENV_DIR),
            global_file: PathBuf::from(DEFAULT_GLOBAL_FILE),
            files_dir: PathBuf::from(DEFAULT_FILES_DIR),
            timeout: DEFAULT_TIMEOUT_SECONDS,
            retry: DEFAULT_RETRY,
            engine: Engine::default(),
            database: None,
            auth: None,
        }
    }
}

impl Settings {
    /// Load settings from a YAML file. A missing file yields the defaults.
    /// Relative paths are resolved against the directory of the file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Settings> {
        let path = path.as_ref();
        let base = path.parent().map(Path::to_path_buf).unwrap_or_default();

        let settings = if path.exists() {
            let content = fs::read_to_string(path)
                .map_err(|e| ApiTestError::ConfigInit(format!("cannot read settings {path:?}: {e}")))?;
            if content.trim().is_empty() {
                Settings::default()
            } else {
                serde_yaml::from_str(&content).map_err(|e| {
                    ApiTestError::ConfigInit(format!(
                        "invalid settings {path:?}: {e}; expected env/env_dir/global_file/files_dir/timeout/retry/engine/database/auth"
                    ))
                })?
            }
        } else {
            log::debug!("Settings file {path:?} not found, using defaults");
            Settings::default()
        };

        settings.relative_to(&base)
    }

    fn relative_to(mut self, base: &Path) -> Result<Settings> {
        if !(self.timeout > 0.0 && self.timeout.is_finite()) {
            return Err(ApiTestError::ConfigInit(format!(
                "settings timeout must be a positive number of seconds, found {}",
                self.timeout
            )));
        }
        let resolve = |path: &Path| if path.is_absolute() { path.to_path_buf() } else { base.join(path) };
        self.env_dir = resolve(&self.env_dir);
        self.global_file = resolve(&self.global_file);
        self.files_dir = resolve(&self.files_dir);
        self.database = self.database.as_deref().map(resolve);
        Ok(self)
    }

    /// Dotenv file of the selected environment, `<env_dir>/<env>.env`
    pub fn env_file(&self) -> PathBuf {
        self.env_dir.join(format!("{}.env", self.env))
    }

    pub fn request_defaults(&self) -> RequestDefaults {
        RequestDefaults {
            timeout: self.timeout,
            retry: self.retry,
            engine: self.engine,
            files_dir: self.files_dir.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_settings_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let settings = Settings::load(dir.path().join("apicase.yaml")).unwrap();
        assert_eq!(settings.env, DEFAULT_ENV_NAME);
        assert_eq!(settings.env_file(), dir.path().join(DEFAULT_ENV_DIR).join("dev.env"));
    }

    #[test]
    fn test_settings_paths_are_relative_to_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("apicase.yaml");
        fs::write(&path, "env: test\nretry: 0\nengine: blocking\ndatabase: data/app.db\n").unwrap();

        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.retry, 0);
        assert_eq!(settings.engine, Engine::Blocking);
        assert_eq!(settings.database, Some(dir.path().join("data/app.db")));
        assert_eq!(settings.env_file(), dir.path().join("environments").join("test.env"));
    }

    #[test]
    fn test_invalid_settings_is_config_init_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("apicase.yaml");
        fs::write(&path, "retry: [1, 2]\n").unwrap();
        assert!(matches!(Settings::load(&path), Err(ApiTestError::ConfigInit(_))));
    }
}
