use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use botsmith_client::{BackendConfig, DEFAULT_PROVIDER_ENDPOINT, ProviderConfig};
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const DEFAULT_BACKEND_URL: &str = "http://localhost:5000/api";
pub const DEFAULT_STREAM_IDLE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const SETTINGS_DIRECTORY_NAME: &str = "botsmith";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const SETTINGS_ENV_PREFIX: &str = "BOTSMITH_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsoleSettings {
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default = "default_provider_endpoint")]
    pub provider_endpoint: String,
    #[serde(default = "default_stream_idle_timeout_secs")]
    pub stream_idle_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ConsoleSettings {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            auth_token: String::new(),
            provider_endpoint: default_provider_endpoint(),
            stream_idle_timeout_secs: default_stream_idle_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ConsoleSettings {
    pub fn normalized(mut self) -> Self {
        self.backend_url = non_blank_or(self.backend_url, default_backend_url);
        self.auth_token = self.auth_token.trim().to_string();
        self.provider_endpoint = non_blank_or(self.provider_endpoint, default_provider_endpoint);
        // A zero timeout would fail every run before its first event.
        if self.stream_idle_timeout_secs == 0 {
            self.stream_idle_timeout_secs = DEFAULT_STREAM_IDLE_TIMEOUT_SECS;
        }
        if self.request_timeout_secs == 0 {
            self.request_timeout_secs = DEFAULT_REQUEST_TIMEOUT_SECS;
        }
        self
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }

    pub fn backend_config(&self) -> BackendConfig {
        BackendConfig::new(&self.backend_url)
            .with_auth_token(&self.auth_token)
            .with_request_timeout(Duration::from_secs(self.request_timeout_secs))
    }

    pub fn provider_config(&self) -> ProviderConfig {
        ProviderConfig::new(&self.provider_endpoint)
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to load settings from {path:?} on `{stage}`: {source}"))]
    Extract {
        stage: &'static str,
        path: PathBuf,
        #[snafu(source(from(figment::Error, Box::new)))]
        source: Box<figment::Error>,
    },
}

/// Shared, hot-swappable console settings.
pub struct SettingsStore {
    settings: Arc<ArcSwap<ConsoleSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".botsmith"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    /// Loads settings, falling back to defaults when the file is unreadable.
    pub fn new(config_path: PathBuf) -> Self {
        let settings = match Self::extract(&config_path) {
            Ok(settings) => settings,
            Err(error) => {
                tracing::warn!(
                    path = ?config_path,
                    error = %error,
                    "failed to parse settings; using defaults"
                );
                ConsoleSettings::default()
            }
        };
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

    pub fn settings(&self) -> Arc<ConsoleSettings> {
        self.settings.load_full()
    }

    pub fn replace(&self, settings: ConsoleSettings) {
        self.settings.store(Arc::new(settings.normalized()));
    }

    /// Re-reads the file and environment, keeping current settings on failure.
    pub fn reload(&self) -> Result<Arc<ConsoleSettings>, SettingsError> {
        let settings = Arc::new(Self::extract(&self.config_path)?);
        self.settings.store(settings.clone());
        tracing::info!(path = ?self.config_path, "reloaded console settings");
        Ok(settings)
    }

    /// Layers defaults, the JSON file (when present) and `BOTSMITH_*` variables.
    pub fn extract(path: &Path) -> Result<ConsoleSettings, SettingsError> {
        let mut figment = Figment::from(Serialized::defaults(ConsoleSettings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!(path = ?path, "settings file not found, using defaults");
        }
        figment = figment.merge(Env::prefixed(SETTINGS_ENV_PREFIX));

        figment
            .extract::<ConsoleSettings>()
            .map(ConsoleSettings::normalized)
            .context(ExtractSnafu {
                stage: "extract-settings",
                path: path.to_path_buf(),
            })
    }
}

fn non_blank_or(value: String, fallback: fn() -> String) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        fallback()
    } else {
        trimmed.to_string()
    }
}

fn default_backend_url() -> String {
    DEFAULT_BACKEND_URL.to_string()
}

fn default_provider_endpoint() -> String {
    DEFAULT_PROVIDER_ENDPOINT.to_string()
}

fn default_stream_idle_timeout_secs() -> u64 {
    DEFAULT_STREAM_IDLE_TIMEOUT_SECS
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}
