use std::{
    fs, io,
    path::{Path, PathBuf},
};

use derive_more::{Display, Error, From};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, error};

use crate::{
    api::{ApiClient, ApiError, IssuedToken},
    commands::{project_path, spinner, Context, RequestError, SessionError, SetupCi},
    config::{AppConfig, ConfigError, APP_ID_ENV, TOKEN_ENV},
    process::{git_origin, ProcessError, Tool},
    prompt::{PromptError, Prompter, Terminal},
};

/// Lifetime of provisioned deploy tokens.
const TOKEN_EXPIRES_DAYS: u32 = 365;

const WORKFLOWS_DIR: &str = ".github/workflows";
const DEFAULT_WORKFLOW_FILE: &str = "deploy.yml";

static GITHUB_REPO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"github\.com[:/](.+?)(?:\.git)?$").expect("invalid GitHub remote pattern")
});

/// `setup-ci` subcommand errors.
#[derive(Debug, Display, From, Error)]
pub(crate) enum SetupCiError {
    Config(ConfigError),
    Session(SessionError),
    Request(RequestError),

    /// IO-related error.
    Io(io::Error),

    Prompt(PromptError),

    #[from(ignore)]
    #[display(fmt = "No app linked to this directory. Run `fastapi-cloud deploy` first.")]
    NotLinked,

    #[from(ignore)]
    #[display(
        fmt = "Error retrieving git remote origin URL. \
               Make sure you're in a git repository with a remote origin set."
    )]
    NoOrigin { source: ProcessError },

    #[from(ignore)]
    #[display(
        fmt = "Remote origin is not a GitHub repository. \
               Please set up a GitHub repo and add it as the remote origin."
    )]
    NotGitHub,
}

/// `owner/repo` part of a GitHub remote URL.
fn repo_slug(origin: &str) -> Option<&str> {
    GITHUB_REPO
        .captures(origin)
        .and_then(|captures| captures.get(1))
        .map(|slug| slug.as_str())
}

fn token_name(repo_slug: &str) -> String {
    format!("GitHub Actions — {repo_slug}")
}

fn workflow_content(branch: &str) -> String {
    format!(
        r#"name: Deploy to FastAPI Cloud
on:
  push:
    branches: [{branch}]
jobs:
  deploy:
    runs-on: ubuntu-latest
    steps:
      - uses: actions/checkout@v5
      - uses: astral-sh/setup-uv@v7
      - run: uv run fastapi deploy
        env:
          {TOKEN_ENV}: ${{{{ secrets.{TOKEN_ENV} }}}}
          {APP_ID_ENV}: ${{{{ secrets.{APP_ID_ENV} }}}}
"#
    )
}

/// Create a deploy token, or regenerate the one with the same name.
///
/// Returns the issued token and whether it was regenerated.
fn provision_token(
    client: &ApiClient,
    app_id: &str,
    name: &str,
) -> Result<(IssuedToken, bool), ApiError> {
    let existing = client
        .list_tokens(app_id)?
        .into_iter()
        .find(|token| token.name == name);

    match existing {
        Some(token) => Ok((
            client.regenerate_token(app_id, &token.id, TOKEN_EXPIRES_DAYS)?,
            true,
        )),
        None => Ok((client.create_token(app_id, name, TOKEN_EXPIRES_DAYS)?, false)),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepoView {
    default_branch_ref: BranchRef,
}

#[derive(Deserialize)]
struct BranchRef {
    name: String,
}

/// Default branch of the repository as reported by the `gh` CLI.
fn default_branch(gh: &Tool, cwd: &Path) -> Option<String> {
    let output = gh
        .output(["repo", "view", "--json", "defaultBranchRef"], Some(cwd))
        .map_err(|error| debug!(%error, "unable to query default branch"))
        .ok()?;

    serde_json::from_str::<RepoView>(&output)
        .map(|view| view.default_branch_ref.name)
        .map_err(|error| debug!(%error, "unexpected repository description"))
        .ok()
}

fn set_secret(gh: &Tool, cwd: &Path, name: &str, value: &str) {
    if let Err(error) = gh.output(["secret", "set", name, "--body", value], Some(cwd)) {
        error!(%error, name, "unable to set GitHub secret");
    }
}

/// Where to write the workflow file, or [`None`] to skip writing it.
fn workflow_path(
    project: &Path,
    file: Option<&str>,
    prompt: &mut impl Prompter,
) -> Result<Option<PathBuf>, PromptError> {
    let workflows = project.join(WORKFLOWS_DIR);

    if let Some(file) = file {
        return Ok(Some(workflows.join(file)));
    }

    let path = workflows.join(DEFAULT_WORKFLOW_FILE);

    if !path.exists()
        || prompt.confirm(
            &format!(
                "Workflow file {WORKFLOWS_DIR}/{DEFAULT_WORKFLOW_FILE} already exists. Overwrite?"
            ),
            false,
        )?
    {
        return Ok(Some(path));
    }

    let name = prompt.input("Enter a new filename (or press Enter to skip)", None)?;

    if name.is_empty() {
        println!("Skipped writing workflow file.");
        return Ok(None);
    }

    Ok(Some(workflows.join(name)))
}

fn write_workflow(path: &Path, branch: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    fs::write(path, workflow_content(branch))
}

pub(crate) fn setup_ci(
    SetupCi {
        path,
        mut branch,
        secrets_only,
        dry_run,
        file,
    }: SetupCi,
    ctx: &Context,
) -> Result<(), SetupCiError> {
    let session = ctx.session()?;
    let path = project_path(path.as_deref())?;

    let app = AppConfig::load(&path)?.ok_or(SetupCiError::NotLinked)?;

    let origin = git_origin(&path).map_err(|source| SetupCiError::NoOrigin { source })?;

    if !origin.contains("github.com") {
        return Err(SetupCiError::NotGitHub);
    }

    let repo_slug = repo_slug(&origin).unwrap_or(&origin);
    let gh = Tool::find("gh")
        .map_err(|error| debug!(%error, "gh CLI is not available"))
        .ok();

    if branch == "main" {
        if let Some(default) = gh.as_ref().and_then(|gh| default_branch(gh, &path)) {
            branch = default;
        }
    }

    if dry_run {
        println!("This is a dry run — no changes will be made");
        println!();
    }

    println!("Configuring CI");
    println!();
    println!("Setting up CI for {repo_slug} (branch: {branch})");
    println!();

    let workflow_file = file.as_deref().unwrap_or(DEFAULT_WORKFLOW_FILE);

    if dry_run {
        println!("Created deploy token");
        println!("Set {TOKEN_ENV} and {APP_ID_ENV}");

        if !secrets_only {
            println!("Wrote {WORKFLOWS_DIR}/{workflow_file} (branch: {branch})");
        }

        return Ok(());
    }

    let pg = spinner("Generating deploy token...");
    let (token, regenerated) = provision_token(&session.client, &app.app_id, &token_name(repo_slug))
        .map_err(session.request_failed(Some("Error creating deploy token.")))?;
    pg.finish_with_message(if regenerated {
        "Regenerated deploy token"
    } else {
        "Created deploy token"
    });

    println!();

    match &gh {
        Some(gh) => {
            let pg = spinner(&format!("Setting repo secrets on {repo_slug}..."));
            set_secret(gh, &path, TOKEN_ENV, &token.value);
            set_secret(gh, &path, APP_ID_ENV, &app.app_id);
            pg.finish_with_message(format!("Set {TOKEN_ENV} and {APP_ID_ENV}"));
        }
        None => {
            println!("gh CLI not found. Set these secrets manually:");
            println!();
            println!("  Repository: https://github.com/{repo_slug}/settings/secrets/actions");
            println!();
            println!("  {TOKEN_ENV} = {}", token.value);
            println!("  {APP_ID_ENV} = {}", app.app_id);
        }
    }

    println!();

    if !secrets_only {
        if let Some(workflow) = workflow_path(&path, file.as_deref(), &mut Terminal)? {
            write_workflow(&workflow, &branch)?;

            let shown = workflow.strip_prefix(&path).unwrap_or(&workflow);
            println!("Wrote {} (branch: {branch})", shown.display());
        }

        println!();
    }

    println!("Done — commit and push to start deploying.");
    println!();
    println!(
        "Your deploy token expires on {}. \
         Regenerate it from the dashboard or re-run this command before then.",
        token.expired_at.get(..10).unwrap_or(&token.expired_at)
    );

    Ok(())
}
