use std::time::Duration;

use derive_more::{Display, Error, From};
use tracing::debug;

use crate::{
    api::ApiClient,
    commands::{spinner, Context, RequestError, SessionError},
    config::{self, AuthConfig, ConfigError, Identity},
    interrupt::Cancelled,
};

/// Polling interval used when the server does not provide one.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// `login`, `logout` and `whoami` subcommand errors.
#[derive(Debug, Display, From, Error)]
pub(crate) enum AuthError {
    Config(ConfigError),
    Request(RequestError),
    Session(SessionError),
    Cancelled(Cancelled),
}

pub(crate) fn login(ctx: &Context) -> Result<(), AuthError> {
    let config_dir = config::config_dir()?;
    let identity = Identity::load(&config_dir)?;

    if identity.is_logged_in() {
        println!("You are already logged in.");
        println!("Run `fastapi-cloud logout` first if you want to switch accounts.");
        return Ok(());
    }

    let client = ApiClient::new(&ctx.settings.base_api_url, None)
        .map_err(|error| RequestError::new(error, &identity, None))?;

    let pg = spinner("Starting authorization...");

    let authorization = client
        .request_device_code(&ctx.settings.client_id)
        .map_err(|error| RequestError::new(error, &identity, None))?;

    let url = authorization
        .verification_uri_complete
        .as_deref()
        .unwrap_or(&authorization.verification_uri);

    pg.println(format!("Opening {url}"));
    pg.println(format!("Verification code: {}", authorization.user_code));

    let _ = open::that_in_background(url);

    let interval = authorization
        .interval
        .map_or(DEFAULT_POLL_INTERVAL, Duration::from_secs);

    pg.set_message("Waiting for user to authorize...");

    let token = loop {
        let token = client
            .poll_device_token(&ctx.settings.client_id, &authorization.device_code)
            .map_err(|error| {
                RequestError::new(
                    error,
                    &identity,
                    Some("Login failed. Please try again with `fastapi-cloud login`."),
                )
            })?;

        if let Some(token) = token {
            break token;
        }

        ctx.interrupt.sleep(interval)?;
    };

    AuthConfig::write(&config_dir, &token)?;
    debug!(config_dir = %config_dir.display(), "credentials stored");

    pg.finish_with_message("Now you are logged in! 🚀");

    Ok(())
}

pub(crate) fn logout() -> Result<(), AuthError> {
    if AuthConfig::delete(&config::config_dir()?)? {
        println!("You are now logged out! 👋");
    } else {
        println!("You are not logged in.");
    }

    Ok(())
}

pub(crate) fn whoami(ctx: &Context) -> Result<(), AuthError> {
    let session = match ctx.session() {
        Ok(session) => session,
        Err(SessionError::NoCredentials) => {
            println!("{}", SessionError::NoCredentials);
            return Ok(());
        }
        Err(error) => return Err(error.into()),
    };

    let pg = spinner("Fetching user information...");
    let user = session
        .client
        .current_user()
        .map_err(session.request_failed(None))?;
    pg.finish_and_clear();

    println!("⚡ {}", user.email);

    Ok(())
}
