use std::{
    env, fs, io,
    path::{Path, PathBuf},
};

use derive_more::{Display, Error, From};
use tracing::debug;

use crate::{
    commands::New,
    process::{ProcessError, Tool},
};

const MAIN_TEMPLATE: &str = r#"from fastapi import FastAPI
app = FastAPI()

@app.get("/")
def main():
    return {"message": "Hello World"}
"#;

/// `new` subcommand errors.
#[derive(Debug, Display, From, Error)]
pub(crate) enum NewError {
    /// IO-related error.
    Io(io::Error),

    #[from(ignore)]
    #[display(fmt = "Error: Directory '{}' already exists.", name)]
    AlreadyExists { name: String },

    #[from(ignore)]
    #[display(
        fmt = "Error: uv is required to create new projects. \
               Install it from https://uv.run/docs/installation/"
    )]
    UvMissing { source: ProcessError },

    #[from(ignore)]
    #[display(
        fmt = "Error: Python {} is not supported. FastAPI requires Python 3.8 or higher.",
        version
    )]
    UnsupportedPython { version: String },

    #[from(ignore)]
    #[display(fmt = "Error: Failed to initialize project with uv. {}", details)]
    Init {
        details: String,
        source: ProcessError,
    },

    #[from(ignore)]
    #[display(fmt = "Error: Failed to install dependencies. {}", details)]
    Install {
        details: String,
        source: ProcessError,
    },

    #[from(ignore)]
    #[display(fmt = "Error: Failed to write template files. {}", source)]
    Template { source: io::Error },
}

/// Project about to be created.
#[derive(Debug, PartialEq, Eq)]
struct Project {
    name: String,
    path: PathBuf,

    /// Whether the project gets its own subdirectory.
    subdirectory: bool,
}

impl Project {
    fn resolve(name: Option<String>, cwd: &Path) -> Self {
        match name {
            Some(name) => Self {
                path: cwd.join(&name),
                name,
                subdirectory: true,
            },
            None => Self {
                name: cwd
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                path: cwd.to_path_buf(),
                subdirectory: false,
            },
        }
    }
}

/// Reject `--python` versions older than 3.8.
///
/// Malformed versions are left for uv to report.
fn validate_python_version(args: &[String]) -> Result<(), NewError> {
    let Some(version) = python_version(args) else {
        return Ok(());
    };

    let mut parts = version.split('.');

    let (Some(major), Some(minor)) = (parts.next(), parts.next()) else {
        return Ok(());
    };

    let (Ok(major), Ok(minor)) = (major.parse::<u32>(), minor.parse::<u32>()) else {
        return Ok(());
    };

    if (major, minor) < (3, 8) {
        return Err(NewError::UnsupportedPython {
            version: version.to_owned(),
        });
    }

    Ok(())
}

/// Python version requested in uv arguments.
///
/// Accepts `--python X`, `--python=X`, `-p X`, `-p=X` and `-pX`.
fn python_version(args: &[String]) -> Option<&str> {
    let mut args = args.iter();

    while let Some(arg) = args.next() {
        if arg == "--python" || arg == "-p" {
            return args.next().map(String::as_str);
        }

        if let Some(version) = arg.strip_prefix("--python=") {
            return Some(version);
        }

        if let Some(version) = arg.strip_prefix("-p") {
            if !version.starts_with('-') {
                return Some(version.strip_prefix('=').unwrap_or(version));
            }
        }
    }

    None
}

fn readme(name: &str) -> String {
    format!(
        r#"# {name}

A project created with FastAPI Cloud CLI.

## Quick Start

Start the development server:

```bash
uv run fastapi dev
```

Visit http://localhost:8000

Deploy to FastAPI Cloud:

```bash
uv run fastapi login
uv run fastapi deploy
```

## Project Structure

- `main.py` - Your FastAPI application
- `pyproject.toml` - Project dependencies

## Learn More

- [FastAPI Documentation](https://fastapi.tiangolo.com)
- [FastAPI Cloud](https://fastapicloud.com)
"#
    )
}

fn write_templates(project: &Project) -> io::Result<()> {
    fs::write(project.path.join("main.py"), MAIN_TEMPLATE)?;
    fs::write(project.path.join("README.md"), readme(&project.name))
}

/// Details of a failed uv invocation.
fn failure_details(error: &ProcessError) -> String {
    match error {
        ProcessError::Failed { stderr, .. } => stderr.clone(),
        error => error.to_string(),
    }
}

pub(crate) fn new(New { name, uv_args }: New) -> Result<(), NewError> {
    let project = Project::resolve(name, &env::current_dir()?);

    println!("Creating a new project 🚀");
    println!();

    if !project.subdirectory {
        println!(
            "⚠️  No project name provided. Initializing in current directory: {}",
            project.path.display()
        );
        println!();
    }

    if project.subdirectory && project.path.exists() {
        return Err(NewError::AlreadyExists { name: project.name });
    }

    let uv = Tool::find("uv").map_err(|source| NewError::UvMissing { source })?;

    validate_python_version(&uv_args)?;

    if uv_args.is_empty() {
        println!("Setting up environment with uv");
    } else {
        println!("Setting up environment with uv ({})", uv_args.join(" "));
    }

    let mut init = vec![String::from("init")];

    if project.subdirectory {
        init.push(project.name.clone());
    }

    init.extend(uv_args);

    uv.output(&init, None).map_err(|source| NewError::Init {
        details: failure_details(&source),
        source,
    })?;

    println!();
    println!("Installing dependencies...");

    uv.output(["add", "fastapi[standard]"], Some(&project.path))
        .map_err(|source| NewError::Install {
            details: failure_details(&source),
            source,
        })?;

    println!();
    println!("Writing template files...");

    write_templates(&project).map_err(|source| NewError::Template { source })?;
    debug!(path = %project.path.display(), "project created");

    println!();

    if project.subdirectory {
        println!("✨ Success! Created FastAPI project: {}", project.name);
        println!();
        println!("Next steps:");
        println!("  $ cd {}", project.name);
    } else {
        println!("✨ Success! Initialized FastAPI project in current directory");
        println!();
        println!("Next steps:");
    }

    println!("  $ uv run fastapi dev");
    println!();
    println!("Visit http://localhost:8000");
    println!();
    println!("Deploy to FastAPI Cloud:");
    println!("  $ uv run fastapi login");
    println!("  $ uv run fastapi deploy");
    println!();
    println!("💡 Tip: Use 'uv run' to automatically use the project's environment");

    Ok(())
}
