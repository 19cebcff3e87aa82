use std::{
    fs, io,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use derive_more::{Display, Error, From};
use figment::{
    providers::{Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Environment variable with a deploy token that takes precedence over the stored login.
pub(crate) const TOKEN_ENV: &str = "FASTAPI_CLOUD_TOKEN";

/// Environment variable with an application identifier used by `deploy`.
pub(crate) const APP_ID_ENV: &str = "FASTAPI_CLOUD_APP_ID";

/// Credentials file name inside of the configuration directory.
const AUTH_FILE: &str = "auth.toml";

/// Directory that links a project to an application.
pub(crate) const APP_CONFIG_DIR: &str = ".fastapicloud";

/// App link file name inside of [`APP_CONFIG_DIR`].
const APP_CONFIG_FILE: &str = "cloud.json";

const APP_CONFIG_README: &str = r#"> Why do I have a folder named ".fastapicloud" in my project? 🤔
The ".fastapicloud" folder is created when you link a directory to a FastAPI Cloud project.

> What does the "cloud.json" file contain?
The "cloud.json" file contains:
- The ID of the FastAPI app that you linked ("app_id")
- The ID of the team your FastAPI Cloud project is owned by ("team_id")

> Should I commit the ".fastapicloud" folder?
No, you should not commit the ".fastapicloud" folder to your version control system.
That's why there's a ".gitignore" file in this folder.
"#;

/// Local configuration errors.
#[derive(Debug, Display, From, Error)]
pub(crate) enum ConfigError {
    /// Unable to load the configuration using [`figment`].
    Figment(figment::Error),

    /// IO-related error.
    Io(io::Error),

    /// Unable to serialize the credentials using [`toml`] crate.
    Toml(toml::ser::Error),

    /// App link file is not valid JSON.
    #[display(fmt = "unable to parse app configuration: {}", _0)]
    Json(serde_json::Error),

    /// Neither the configuration directory override nor the home directory is available.
    #[from(ignore)]
    #[display(fmt = "unable to find configuration directory")]
    ConfigDirNotFound,
}

/// Stored login credentials.
#[derive(Serialize, Deserialize)]
pub(crate) struct AuthConfig {
    /// Access token returned by the device login flow.
    pub access_token: String,
}

impl AuthConfig {
    /// Read credentials from the configuration directory.
    ///
    /// Returns [`None`] if the user never logged in.
    pub(crate) fn load(config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let path = config_dir.join(AUTH_FILE);

        if !path.exists() {
            return Ok(None);
        }

        Ok(Some(Figment::new().merge(Toml::file(path)).extract()?))
    }

    /// Write credentials to the configuration directory.
    pub(crate) fn write(config_dir: &Path, access_token: &str) -> Result<(), ConfigError> {
        fs::create_dir_all(config_dir)?;
        fs::write(
            config_dir.join(AUTH_FILE),
            toml::to_string(&AuthConfig {
                access_token: access_token.to_owned(),
            })?,
        )?;
        Ok(())
    }

    /// Delete stored credentials.
    ///
    /// Returns `false` if there was nothing to delete.
    pub(crate) fn delete(config_dir: &Path) -> Result<bool, ConfigError> {
        match fs::remove_file(config_dir.join(AUTH_FILE)) {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }
}

/// Get the configuration directory or fail.
pub(crate) fn config_dir() -> Result<PathBuf, ConfigError> {
    common::config::config_dir().ok_or(ConfigError::ConfigDirNotFound)
}

/// Origin of the current access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenSource {
    /// Deploy token from [`TOKEN_ENV`].
    Env,

    /// Stored login credentials.
    File,
}

/// Credentials of the current user.
#[derive(Debug)]
pub(crate) struct Identity {
    token: Option<(String, TokenSource)>,
}

impl Identity {
    /// Resolve the identity from the environment and the stored credentials.
    pub(crate) fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        let env_token = std::env::var(TOKEN_ENV).ok();
        let stored = AuthConfig::load(config_dir)?;

        Ok(Self::from_parts(env_token, stored))
    }

    fn from_parts(env_token: Option<String>, stored: Option<AuthConfig>) -> Self {
        let env_token = env_token
            .filter(|token| !token.trim().is_empty())
            .map(|token| (token, TokenSource::Env));

        let stored = stored.map(|config| (config.access_token, TokenSource::File));

        Self {
            token: env_token.or(stored),
        }
    }

    pub(crate) fn token(&self) -> Option<&str> {
        self.token.as_ref().map(|(token, _)| token.as_str())
    }

    pub(crate) fn source(&self) -> Option<TokenSource> {
        self.token.as_ref().map(|(_, source)| *source)
    }

    /// Whether a stored login token has expired.
    ///
    /// Deploy tokens from the environment are never considered expired locally.
    pub(crate) fn is_expired(&self) -> bool {
        match &self.token {
            Some((token, TokenSource::File)) => is_jwt_expired(token, unix_now()),
            _ => false,
        }
    }

    pub(crate) fn is_logged_in(&self) -> bool {
        self.token.is_some() && !self.is_expired()
    }

    /// Message shown when the server rejects the current token.
    pub(crate) fn invalid_token_message(&self) -> &'static str {
        match self.source() {
            Some(TokenSource::Env) => {
                "The specified token is not valid. Make sure to use a valid token."
            }
            _ => "The specified token is not valid. Use `fastapi-cloud login` to generate a new token.",
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs() as i64)
}

#[derive(Deserialize)]
struct JwtClaims {
    exp: Option<i64>,
}

/// Check the `exp` claim of a JWT.
///
/// Opaque tokens never expire. A token that looks like a JWT but has an unreadable
/// payload is treated as expired.
fn is_jwt_expired(token: &str, now: i64) -> bool {
    let mut segments = token.split('.');

    let (Some(_), Some(payload), Some(_), None) = (
        segments.next(),
        segments.next(),
        segments.next(),
        segments.next(),
    ) else {
        return false;
    };

    let claims = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()
        .and_then(|payload| serde_json::from_slice::<JwtClaims>(&payload).ok());

    match claims {
        Some(JwtClaims { exp: Some(exp) }) => exp <= now,
        Some(JwtClaims { exp: None }) => false,
        None => {
            debug!("unable to decode access token payload");
            true
        }
    }
}

/// Link between a project directory and an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct AppConfig {
    pub app_id: String,
    pub team_id: String,
}

impl AppConfig {
    /// Read the app link of a project.
    ///
    /// Returns [`None`] if the project is not linked.
    pub(crate) fn load(project: &Path) -> Result<Option<Self>, ConfigError> {
        let path = project.join(APP_CONFIG_DIR).join(APP_CONFIG_FILE);

        if !path.exists() {
            return Ok(None);
        }

        Ok(Some(serde_json::from_str(&fs::read_to_string(path)?)?))
    }

    /// Link a project to an application.
    pub(crate) fn write(&self, project: &Path) -> Result<(), ConfigError> {
        let dir = project.join(APP_CONFIG_DIR);

        fs::create_dir_all(&dir)?;
        fs::write(dir.join(APP_CONFIG_FILE), serde_json::to_string(self)?)?;
        fs::write(dir.join("README.md"), APP_CONFIG_README)?;
        fs::write(dir.join(".gitignore"), "*")?;

        Ok(())
    }

    /// Remove the app link of a project.
    ///
    /// Returns `false` if the project was not linked.
    pub(crate) fn remove(project: &Path) -> Result<bool, ConfigError> {
        match fs::remove_dir_all(project.join(APP_CONFIG_DIR)) {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

    use super::{is_jwt_expired, AppConfig, AuthConfig, Identity, TokenSource};

    fn jwt(payload: &str) -> String {
        format!(
            "{}.{}.signature",
            URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#),
            URL_SAFE_NO_PAD.encode(payload)
        )
    }

    #[test]
    fn auth_config_lifecycle() {
        let dir = tempfile::tempdir().expect("unable to create temp dir");
        let config_dir = dir.path().join("nested");

        assert!(AuthConfig::load(&config_dir)
            .expect("unable to load credentials")
            .is_none());

        AuthConfig::write(&config_dir, "secret").expect("unable to write credentials");

        let stored = AuthConfig::load(&config_dir)
            .expect("unable to load credentials")
            .expect("credentials missing");
        assert_eq!(stored.access_token, "secret");

        assert!(AuthConfig::delete(&config_dir).expect("unable to delete credentials"));
        assert!(!AuthConfig::delete(&config_dir).expect("unable to delete credentials"));
    }

    #[test]
    fn env_token_takes_precedence() {
        let identity = Identity::from_parts(
            Some(String::from("deploy-token")),
            Some(AuthConfig {
                access_token: String::from("stored"),
            }),
        );

        assert_eq!(identity.token(), Some("deploy-token"));
        assert_eq!(identity.source(), Some(TokenSource::Env));
        assert!(identity.is_logged_in());
        assert!(identity
            .invalid_token_message()
            .contains("Make sure to use a valid token"));
    }

    #[test]
    fn empty_env_token_is_ignored() {
        let identity = Identity::from_parts(Some(String::from("  ")), None);

        assert_eq!(identity.token(), None);
        assert!(!identity.is_logged_in());
    }

    #[test]
    fn expired_stored_token_counts_as_logged_out() {
        let identity = Identity::from_parts(
            None,
            Some(AuthConfig {
                access_token: jwt(r#"{"sub":"user","exp":1000}"#),
            }),
        );

        assert!(identity.is_expired());
        assert!(!identity.is_logged_in());
        assert!(identity
            .invalid_token_message()
            .contains("fastapi-cloud login"));
    }

    #[test]
    fn jwt_expiration() {
        assert!(is_jwt_expired(&jwt(r#"{"exp":1000}"#), 2000));
        assert!(!is_jwt_expired(&jwt(r#"{"exp":3000}"#), 2000));
        assert!(!is_jwt_expired(&jwt(r#"{"sub":"user"}"#), 2000));
        assert!(!is_jwt_expired("opaque-token", 2000));
        assert!(is_jwt_expired("a.!!!.c", 2000));
    }

    #[test]
    fn app_config_lifecycle() {
        let dir = tempfile::tempdir().expect("unable to create temp dir");

        assert_eq!(
            AppConfig::load(dir.path()).expect("unable to load app config"),
            None
        );

        let config = AppConfig {
            app_id: String::from("app"),
            team_id: String::from("team"),
        };
        config.write(dir.path()).expect("unable to write app config");

        assert_eq!(
            AppConfig::load(dir.path()).expect("unable to load app config"),
            Some(config)
        );
        assert_eq!(
            fs::read_to_string(dir.path().join(".fastapicloud/.gitignore"))
                .expect("missing .gitignore"),
            "*"
        );
        assert!(dir.path().join(".fastapicloud/README.md").exists());

        assert!(AppConfig::remove(dir.path()).expect("unable to unlink"));
        assert!(!dir.path().join(".fastapicloud").exists());
        assert!(!AppConfig::remove(dir.path()).expect("unable to unlink"));
    }
}
