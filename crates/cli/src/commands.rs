/// `login`, `logout` and `whoami` subcommands.
mod auth;

/// `deploy` subcommand.
mod deploy;

/// `logs` subcommand.
mod logs;

/// `new` subcommand.
mod new;

/// `setup-ci` subcommand.
mod setup_ci;

/// `unlink` subcommand.
mod unlink;

pub(crate) use auth::{login, logout, whoami};
pub(crate) use deploy::deploy;
pub(crate) use logs::logs;
pub(crate) use new::new;
pub(crate) use setup_ci::setup_ci;
pub(crate) use unlink::unlink;

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use clap::{Args, Parser, Subcommand};
use common::config::Settings;
use derive_more::{Display, Error, From};
use indicatif::ProgressBar;

use crate::{
    api::{ApiClient, ApiError},
    config::{self, ConfigError, Identity},
    interrupt::Interrupt,
};

/// CLI configuration.
#[derive(Parser)]
#[command(name = "fastapi-cloud", about, version)]
pub(crate) struct Cli {
    /// Print debug logs.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Selected subcommand.
    #[command(subcommand)]
    pub command: Commands,
}

/// Supported subcommands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Log in using the browser device flow.
    Login,

    /// Remove stored credentials.
    Logout,

    /// Show the currently logged in account.
    Whoami,

    /// Deploy an app to FastAPI Cloud.
    Deploy(Deploy),

    /// Remove the link between this directory and its app.
    Unlink(Unlink),

    /// Stream or fetch logs of a deployed app.
    Logs(Logs),

    /// Configure a GitHub Actions workflow that deploys on push.
    SetupCi(SetupCi),

    /// Create a new FastAPI project with uv.
    New(New),
}

/// `deploy` subcommand configuration.
#[derive(Args)]
pub(crate) struct Deploy {
    /// Path to the folder containing the app (defaults to current directory).
    pub path: Option<PathBuf>,

    /// Skip waiting for the deployment status.
    #[arg(long)]
    pub no_wait: bool,

    /// Deploy to this app instead of the one linked to the directory.
    #[arg(long, env = config::APP_ID_ENV)]
    pub app_id: Option<String>,
}

/// `unlink` subcommand configuration.
#[derive(Args)]
pub(crate) struct Unlink {
    /// Path to the linked folder (defaults to current directory).
    pub path: Option<PathBuf>,
}

/// `logs` subcommand configuration.
#[derive(Args)]
pub(crate) struct Logs {
    /// Path to the folder containing the app (defaults to current directory).
    pub path: Option<PathBuf>,

    /// Number of log lines to show before streaming.
    #[arg(short, long, default_value_t = 100)]
    pub tail: u32,

    /// Show logs since a specific time (e.g., '5m', '1h', '2d').
    #[arg(short, long, default_value = "5m")]
    pub since: String,

    /// Fetch recent logs and exit instead of streaming.
    #[arg(short = 'n', long)]
    pub no_follow: bool,
}

/// `setup-ci` subcommand configuration.
#[derive(Args)]
pub(crate) struct SetupCi {
    /// Path to the folder containing the app (defaults to current directory).
    pub path: Option<PathBuf>,

    /// Branch that triggers deploys.
    #[arg(short, long, default_value = "main")]
    pub branch: String,

    /// Provision the token and set secrets, but skip writing the workflow file.
    #[arg(short, long)]
    pub secrets_only: bool,

    /// Print the steps that would be taken without performing them.
    #[arg(short, long)]
    pub dry_run: bool,

    /// Custom workflow filename, written to `.github/workflows/`.
    #[arg(short, long)]
    pub file: Option<String>,
}

/// `new` subcommand configuration.
#[derive(Args)]
#[clap(trailing_var_arg = true)]
pub(crate) struct New {
    /// Name of the new project. Initializes the current directory if omitted.
    pub name: Option<String>,

    /// Additional options passed to `uv init`.
    #[clap(allow_hyphen_values = true)]
    pub uv_args: Vec<String>,
}

/// Process-wide state shared by subcommands.
pub(crate) struct Context {
    pub settings: Settings,
    pub interrupt: Interrupt,
}

impl Context {
    /// Authenticated API client of the current user.
    pub(crate) fn session(&self) -> Result<Session, SessionError> {
        let identity = Identity::load(&config::config_dir()?)?;

        if identity.token().is_none() {
            return Err(SessionError::NoCredentials);
        }

        if identity.is_expired() {
            return Err(SessionError::Expired);
        }

        let client = ApiClient::new(&self.settings.base_api_url, identity.token())
            .map_err(|error| RequestError::new(error, &identity, None))?;

        Ok(Session { identity, client })
    }
}

/// Errors that prevent an authenticated session.
#[derive(Debug, Display, From, Error)]
pub(crate) enum SessionError {
    Config(ConfigError),
    Request(RequestError),

    #[from(ignore)]
    #[display(fmt = "No credentials found. Use `fastapi-cloud login` to login.")]
    NoCredentials,

    #[from(ignore)]
    #[display(fmt = "Your session has expired. Use `fastapi-cloud login` to login again.")]
    Expired,
}

/// Logged in user with an API client.
pub(crate) struct Session {
    pub identity: Identity,
    pub client: ApiClient,
}

impl Session {
    /// Build a [`RequestError`] mapper with an optional command-specific fallback message.
    pub(crate) fn request_failed<'a>(
        &'a self,
        fallback: Option<&'a str>,
    ) -> impl FnOnce(ApiError) -> RequestError + 'a {
        move |error| RequestError::new(error, &self.identity, fallback)
    }
}

/// API request failure with a user-facing message.
#[derive(Debug, Display, Error)]
#[display(fmt = "{}", message)]
pub(crate) struct RequestError {
    message: String,
    source: ApiError,
}

impl RequestError {
    pub(crate) fn new(error: ApiError, identity: &Identity, fallback: Option<&str>) -> Self {
        let message = match &error {
            ApiError::Unauthorized => identity.invalid_token_message().to_owned(),
            error if error.is_timeout() => String::from(
                "The request to the FastAPI Cloud server timed out. Please try again later.",
            ),
            error => match fallback {
                Some(fallback) => fallback.to_owned(),
                None => format!(
                    "Something went wrong while contacting the FastAPI Cloud server. \
                     Please try again later.\n\n{error}"
                ),
            },
        };

        Self {
            message,
            source: error,
        }
    }
}

/// Start a spinner with the provided message.
pub(crate) fn spinner(message: &str) -> ProgressBar {
    let pg = ProgressBar::new_spinner();

    pg.enable_steady_tick(Duration::from_millis(150));
    pg.set_message(message.to_owned());

    pg
}

/// Resolve the optional project path argument.
pub(crate) fn project_path(path: Option<&Path>) -> std::io::Result<PathBuf> {
    match path {
        Some(path) => Ok(path.to_path_buf()),
        None => std::env::current_dir(),
    }
}
