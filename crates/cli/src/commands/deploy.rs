use std::{
    io,
    path::Path,
    time::{Duration, Instant},
};

use derive_more::{Display, Error, From};
use indicatif::ProgressBar;
use tracing::{debug, warn};

use crate::{
    api::{
        ApiClient, App, Deployment, LogLineType, RetryPolicy, StatusPolicy, StatusPollError,
        StreamError, Upload,
    },
    archiver::{archive_project, validate_app_directory, ArchiverError},
    commands::{project_path, spinner, Context, Deploy, RequestError, Session, SessionError},
    config::{AppConfig, ConfigError},
    interrupt::{Cancelled, Interrupt},
    prompt::{select, PromptError, Prompter, Terminal},
};

/// Interval between two waiting messages.
const MESSAGE_INTERVAL: Duration = Duration::from_secs(2);

/// Time after which the long wait messages are shown.
const LONG_WAIT_AFTER: Duration = Duration::from_secs(30);

const WAITING_MESSAGES: &[&str] = &[
    "🚀 Preparing for liftoff! Almost there...",
    "👹 Sneaking past the dependency gremlins... Don't wake them up!",
    "🤏 Squishing code into a tiny digital sandwich. Nom nom nom.",
    "📉 Server space running low. Time to delete those cat videos?",
    "🐢 Uploading at blazing speeds of 1 byte per hour. Patience, young padawan.",
    "🔌 Connecting to server... Please stand by while we argue with the firewall.",
    "💥 Oops! We've angered the Python God. Sacrificing a rubber duck to appease it.",
    "🧙 Sprinkling magic deployment dust. Abracadabra!",
    "👀 Hoping that @tiangolo doesn't find out about this deployment.",
    "🍪 Cookie monster detected on server. Deploying anti-cookie shields.",
];

const LONG_WAIT_MESSAGES: &[&str] = &[
    "😅 Well, that's embarrassing. We're still waiting for the deployment to finish...",
    "🤔 Maybe we should have brought snacks for this wait...",
    "🥱 Yawn... Still waiting...",
    "🤯 Time is relative... Especially when you're waiting for a deployment...",
];

/// `deploy` subcommand errors.
#[derive(Debug, Display, From, Error)]
pub(crate) enum DeployError {
    Config(ConfigError),
    Session(SessionError),
    Request(RequestError),

    /// IO-related error.
    Io(io::Error),

    #[display(fmt = "unable to create deployment archive: {}", _0)]
    Archiver(ArchiverError),

    Prompt(PromptError),

    #[from(ignore)]
    #[display(
        fmt = "The app ID {} does not match the app linked to this directory ({}). \
               Run `fastapi-cloud unlink` to remove the link, or change the --app-id \
               option or the FASTAPI_CLOUD_APP_ID environment variable.",
        provided,
        linked
    )]
    AppIdMismatch { provided: String, linked: String },

    #[from(ignore)]
    #[display(fmt = "App not found. Make sure you're logged in the correct account.")]
    AppNotFound,

    #[from(ignore)]
    #[display(fmt = "No apps found in this team. You can create a new app instead.")]
    NoApps,

    Cancelled(Cancelled),
}

/// Final result of a deployment attempt.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DeployOutcome {
    /// User declined to link the directory.
    Declined,

    /// Upload finished and waiting was skipped.
    Submitted { dashboard_url: String },

    /// Deployment is live.
    Ready { url: String },

    /// Build reported a failure.
    BuildFailed { dashboard_url: String },

    /// Build logs could not be streamed.
    StreamFailed {
        reason: String,
        dashboard_url: String,
    },

    /// Deployment ended in a failed status.
    StatusFailed {
        label: String,
        dashboard_url: String,
    },

    /// Final status could not be observed in time.
    Unconfirmed { dashboard_url: String },
}

impl DeployOutcome {
    pub(crate) fn exit_code(&self) -> u8 {
        match self {
            DeployOutcome::Declined
            | DeployOutcome::Submitted { .. }
            | DeployOutcome::Ready { .. }
            | DeployOutcome::Unconfirmed { .. } => 0,
            DeployOutcome::BuildFailed { .. }
            | DeployOutcome::StreamFailed { .. }
            | DeployOutcome::StatusFailed { .. } => 1,
        }
    }

    pub(crate) fn message(&self) -> String {
        match self {
            DeployOutcome::Declined => String::from("Deployment cancelled."),
            DeployOutcome::Submitted { dashboard_url } => {
                format!("Check the status of your deployment at {dashboard_url}")
            }
            DeployOutcome::Ready { url } => {
                format!("🐔 Ready the chicken! Your app is ready at {url}")
            }
            DeployOutcome::BuildFailed { dashboard_url } => {
                format!("😔 Oh no! Something went wrong. Check out the logs at {dashboard_url}")
            }
            DeployOutcome::StreamFailed {
                reason,
                dashboard_url,
            } => format!(
                "Unable to stream build logs ({reason}). \
                 Check the deployment status at {dashboard_url}"
            ),
            DeployOutcome::StatusFailed {
                label,
                dashboard_url,
            } => format!("Deployment failed: {label}. Check out the logs at {dashboard_url}"),
            DeployOutcome::Unconfirmed { dashboard_url } => format!(
                "Could not confirm deployment status. \
                 Check the deployment status at {dashboard_url}"
            ),
        }
    }
}

pub(crate) fn deploy(args: Deploy, ctx: &Context) -> Result<DeployOutcome, DeployError> {
    let outcome = run(args, ctx)?;

    if outcome.exit_code() == 0 {
        println!("{}", outcome.message());
    } else {
        eprintln!("{}", outcome.message());
    }

    Ok(outcome)
}

fn run(
    Deploy {
        path,
        no_wait,
        app_id,
    }: Deploy,
    ctx: &Context,
) -> Result<DeployOutcome, DeployError> {
    let session = ctx.session()?;
    let path = project_path(path.as_deref())?;

    let linked = AppConfig::load(&path)?;

    let app_id = match resolve_app_id(app_id.as_deref(), linked.as_ref())? {
        AppTarget::Provided(app_id) => {
            println!("Deploying to app {app_id}");
            app_id
        }
        AppTarget::Linked(app_id) => {
            println!("Deploying app...");
            app_id
        }
        AppTarget::Unlinked => match configure_app(&session, &path, &mut Terminal)? {
            Some(config) => config.app_id,
            None => return Ok(DeployOutcome::Declined),
        },
    };

    let pg = spinner("Checking app...");

    let app = session
        .client
        .get_app(&app_id)
        .map_err(session.request_failed(None))?
        .ok_or(DeployError::AppNotFound)?;

    pg.set_message("Archiving...");

    let archive = archive_project(&path, &pg)?;

    ctx.interrupt.check()?;

    pg.set_message("Creating deployment...");

    let deployment = session
        .client
        .create_deployment(&app.id)
        .map_err(session.request_failed(None))?;

    pg.println(format!(
        "Deployment created successfully! Deployment slug: {}",
        deployment.slug
    ));
    pg.set_message("Uploading deployment...");

    let upload =
        session
            .client
            .upload_deployment(&deployment.id, archive.path(), &ctx.interrupt);

    match upload {
        Ok(Upload::Completed) => {}
        Ok(Upload::Abandoned) => {
            pg.finish_and_clear();
            return Err(abandon_upload(&session.client, &deployment.id).into());
        }
        Err(_) if ctx.interrupt.is_raised() => {
            pg.finish_and_clear();
            return Err(abandon_upload(&session.client, &deployment.id).into());
        }
        Err(error) => return Err(session.request_failed(None)(error).into()),
    }

    pg.finish_with_message("Deployment uploaded successfully!");

    if no_wait {
        return Ok(DeployOutcome::Submitted {
            dashboard_url: deployment.dashboard_url,
        });
    }

    Ok(wait_for_deployment(
        &session.client,
        &deployment,
        &WaitPolicy::default(),
        &ctx.interrupt,
        &spinner(WAITING_MESSAGES[0]),
    )?)
}

/// Application selected for a deployment.
#[derive(Debug, PartialEq, Eq)]
enum AppTarget {
    /// Provided explicitly with `--app-id` or the environment.
    Provided(String),

    /// Read from the directory link.
    Linked(String),

    /// Directory is not linked yet.
    Unlinked,
}

fn resolve_app_id(
    provided: Option<&str>,
    linked: Option<&AppConfig>,
) -> Result<AppTarget, DeployError> {
    let provided = provided.map(str::trim).filter(|app_id| !app_id.is_empty());

    match (provided, linked) {
        (Some(provided), Some(linked)) if provided != linked.app_id => {
            Err(DeployError::AppIdMismatch {
                provided: provided.to_owned(),
                linked: linked.app_id.clone(),
            })
        }
        (Some(provided), _) => Ok(AppTarget::Provided(provided.to_owned())),
        (None, Some(linked)) => Ok(AppTarget::Linked(linked.app_id.clone())),
        (None, None) => Ok(AppTarget::Unlinked),
    }
}

/// Interactively link the project directory to a new or existing application.
///
/// Returns [`None`] if the user declines.
fn configure_app(
    session: &Session,
    path: &Path,
    prompt: &mut impl Prompter,
) -> Result<Option<AppConfig>, DeployError> {
    if !prompt.confirm(&format!("Setup and deploy {}?", path.display()), true)? {
        return Ok(None);
    }

    let pg = spinner("Fetching teams...");
    let teams = session
        .client
        .get_teams()
        .map_err(session.request_failed(Some("Error fetching teams. Please try again later.")))?;
    pg.finish_and_clear();

    let team = select(prompt, "Select the team you want to deploy to:", &teams, |team| {
        team.name.clone()
    })?;

    let app = if prompt.confirm("Do you want to create a new app?", true)? {
        create_app(session, path, &team.id, prompt)?
    } else {
        let pg = spinner("Fetching apps...");
        let apps = session
            .client
            .get_apps(&team.id)
            .map_err(session.request_failed(Some("Error fetching apps. Please try again later.")))?;
        pg.finish_and_clear();

        if apps.is_empty() {
            return Err(DeployError::NoApps);
        }

        select(prompt, "Select the app you want to deploy to:", &apps, |app| {
            app.slug.clone()
        })?
        .clone()
    };

    let config = AppConfig {
        app_id: app.id,
        team_id: team.id.clone(),
    };

    config.write(path)?;

    Ok(Some(config))
}

fn create_app(
    session: &Session,
    path: &Path,
    team_id: &str,
    prompt: &mut impl Prompter,
) -> Result<App, DeployError> {
    let default_name = path
        .canonicalize()?
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let name = prompt.input("What's your app name?", Some(default_name.as_str()))?;
    let directory = ask_app_directory(prompt)?;

    let pg = spinner("Creating app...");
    let app = session
        .client
        .create_app(team_id, &name, directory.as_deref())
        .map_err(session.request_failed(None))?;
    pg.finish_with_message(format!("App created successfully! App slug: {}", app.slug));

    Ok(app)
}

fn ask_app_directory(prompt: &mut impl Prompter) -> Result<Option<String>, PromptError> {
    loop {
        let answer = prompt.input(
            "Path to the directory containing your app (leave empty for the project root):",
            None,
        )?;

        match validate_app_directory(&answer) {
            Ok(directory) => return Ok(directory),
            Err(error) => eprintln!("Invalid directory. {error}"),
        }
    }
}

/// Streaming and polling parameters of [`wait_for_deployment`].
#[derive(Default)]
struct WaitPolicy {
    retry: RetryPolicy,
    status: StatusPolicy,
}

/// Rotating spinner messages shown while waiting for a build.
struct WaitingMessages {
    started: Instant,
    changed: Instant,
    index: usize,
    long_wait: bool,
}

impl WaitingMessages {
    fn new(now: Instant) -> Self {
        Self {
            started: now,
            changed: now,
            index: 0,
            long_wait: false,
        }
    }

    /// Next message to show, if the current one was shown long enough.
    fn next(&mut self, now: Instant) -> Option<&'static str> {
        if now.duration_since(self.changed) < MESSAGE_INTERVAL {
            return None;
        }

        if !self.long_wait && now.duration_since(self.started) > LONG_WAIT_AFTER {
            self.long_wait = true;
            self.index = 0;
        } else {
            self.index += 1;
        }

        let messages = if self.long_wait {
            LONG_WAIT_MESSAGES
        } else {
            WAITING_MESSAGES
        };

        self.changed = now;
        Some(messages[self.index % messages.len()])
    }
}

/// Stream build logs of a deployment, then wait for its final status.
/// Tell the API that an interrupted upload will not be completed.
fn abandon_upload(client: &ApiClient, deployment_id: &str) -> Cancelled {
    if let Err(error) = client.cancel_upload(deployment_id) {
        debug!(%error, "unable to report cancelled upload");
    }

    Cancelled
}

fn wait_for_deployment(
    client: &ApiClient,
    deployment: &Deployment,
    policy: &WaitPolicy,
    interrupt: &Interrupt,
    pg: &ProgressBar,
) -> Result<DeployOutcome, Cancelled> {
    let dashboard_url = deployment.dashboard_url.clone();

    pg.println("Checking the status of your deployment 👀");
    pg.println(format!("You can also check the status at {dashboard_url}"));

    let mut messages = WaitingMessages::new(Instant::now());

    for line in client.stream_build_logs(&deployment.id, policy.retry.clone(), interrupt) {
        match line {
            Ok(line) if line.is_terminal() => {
                if line.kind == LogLineType::Failed {
                    pg.finish_and_clear();
                    return Ok(DeployOutcome::BuildFailed { dashboard_url });
                }

                break;
            }
            Ok(line) => {
                if let Some(message) = &line.message {
                    pg.println(message.trim_end());
                }
            }
            Err(StreamError::Cancelled(cancelled)) => {
                pg.finish_and_clear();
                return Err(cancelled);
            }
            Err(error) => {
                warn!(%error, "unable to stream build logs");
                pg.finish_and_clear();
                return Ok(DeployOutcome::StreamFailed {
                    reason: error.to_string(),
                    dashboard_url,
                });
            }
        }

        if let Some(message) = messages.next(Instant::now()) {
            pg.set_message(message);
        }
    }

    pg.set_message("Verifying deployment...");

    let result = client.poll_deployment_status(
        &deployment.app_id,
        &deployment.id,
        &policy.status,
        interrupt,
        |status| pg.set_message(status.to_string()),
    );

    pg.finish_and_clear();

    match result {
        Ok(deployment) if deployment.status.is_success() => Ok(DeployOutcome::Ready {
            url: deployment.url,
        }),
        Ok(deployment) => Ok(DeployOutcome::StatusFailed {
            label: deployment.status.to_string(),
            dashboard_url,
        }),
        Err(StatusPollError::Cancelled(cancelled)) => Err(cancelled),
        Err(error) => {
            warn!(%error, "unable to confirm deployment status");
            Ok(DeployOutcome::Unconfirmed { dashboard_url })
        }
    }
}
