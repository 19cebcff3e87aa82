use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;
use tracing::warn;

#[cfg(feature = "logging")]
use tracing_subscriber::filter::LevelFilter;

/// Environment variable that overrides the configuration directory.
pub const CONFIG_DIR_ENV: &str = "FASTAPI_CLOUD_CLI_CONFIG_DIR";

/// Configuration directory path relative to the user's home directory.
const DEFAULT_CONFIG_DIR: &str = ".config/fastapi-cli";

/// User settings file name inside of the configuration directory.
const SETTINGS_FILE: &str = "settings.toml";

/// Implementation of [`serde`]'s deserializer for [`FromStr`] types.
///
/// [`FromStr`]: std::str::FromStr
#[cfg(feature = "logging")]
fn deserialize_from_str<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: std::str::FromStr,
    T::Err: std::error::Error,
    D: serde::de::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    std::str::FromStr::from_str(&s).map_err(serde::de::Error::custom)
}

/// Logging configuration.
#[cfg(feature = "logging")]
#[derive(Deserialize)]
pub struct Logging {
    /// Log level.
    #[serde(deserialize_with = "deserialize_from_str")]
    pub level: LevelFilter,
}

#[cfg(feature = "logging")]
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::WARN,
        }
    }
}

/// User settings of the command line client.
#[derive(Deserialize)]
pub struct Settings {
    /// Base URL of the platform API, without a trailing slash.
    #[serde(default = "default_base_api_url")]
    pub base_api_url: String,

    /// OAuth client identifier used during the device login flow.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Logging configuration.
    #[cfg(feature = "logging")]
    #[serde(default)]
    pub logging: Logging,
}

fn default_base_api_url() -> String {
    String::from("https://api.fastapicloud.com/api/v1")
}

fn default_client_id() -> String {
    String::from("fastapi-cli")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_api_url: default_base_api_url(),
            client_id: default_client_id(),
            #[cfg(feature = "logging")]
            logging: Logging::default(),
        }
    }
}

/// Settings file that was skipped while loading [`Settings`].
#[derive(Debug)]
pub struct IgnoredFile {
    pub path: PathBuf,
    pub error: figment::Error,
}

impl IgnoredFile {
    /// Report the skipped file. Call once a subscriber is installed.
    pub fn warn(&self) {
        warn!(
            path = %self.path.display(),
            error = %self.error,
            "ignoring unreadable settings file"
        );
    }
}

/// Result of loading [`Settings`].
pub struct Loaded {
    pub settings: Settings,

    /// Settings file replaced by defaults, if any.
    pub ignored: Option<IgnoredFile>,
}

impl Settings {
    /// Load settings from the default settings file and environment variables.
    ///
    /// Supported environment variables are `FASTAPI_CLOUD_BASE_API_URL`,
    /// `FASTAPI_CLOUD_CLIENT_ID` and `FASTAPI_CLOUD_LOG_LEVEL`.
    pub fn new() -> Result<Loaded, figment::Error> {
        match config_dir() {
            Some(dir) => Self::from_user_settings(&dir.join(SETTINGS_FILE)),
            None => Ok(Loaded {
                settings: Self::figment(None).extract()?,
                ignored: None,
            }),
        }
    }

    /// Load settings from the provided file, falling back to defaults on a broken file.
    ///
    /// A missing file is not an error. Keys absent from the file keep their defaults.
    pub fn from_user_settings(path: &Path) -> Result<Loaded, figment::Error> {
        match Self::figment(Some(path)).extract() {
            Ok(settings) => Ok(Loaded {
                settings,
                ignored: None,
            }),
            Err(error) => Ok(Loaded {
                settings: Self::figment(None).extract()?,
                ignored: Some(IgnoredFile {
                    path: path.to_path_buf(),
                    error,
                }),
            }),
        }
    }

    fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::new();

        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }

        figment
            .merge(Env::prefixed("FASTAPI_CLOUD_").only(&["base_api_url", "client_id"]))
            .merge(
                Env::prefixed("FASTAPI_CLOUD_LOG_")
                    .only(&["level"])
                    .map(|_| "logging.level".into()),
            )
    }
}

/// Directory used to store settings and credentials.
///
/// Returns [`None`] if neither the override variable is set nor the home directory can be found.
pub fn config_dir() -> Option<PathBuf> {
    config_dir_from(std::env::var_os(CONFIG_DIR_ENV), home::home_dir())
}

fn config_dir_from(overridden: Option<OsString>, home_dir: Option<PathBuf>) -> Option<PathBuf> {
    match overridden.filter(|value| !value.is_empty()) {
        Some(dir) => Some(PathBuf::from(dir)),
        None => home_dir.map(|home| home.join(DEFAULT_CONFIG_DIR)),
    }
}
