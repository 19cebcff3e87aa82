use std::{
    ffi::OsStr,
    io,
    path::{Path, PathBuf},
    process::{Command, Output, Stdio},
};

use derive_more::{Display, Error, From};
use tracing::debug;

/// External tool invocation errors.
#[derive(Debug, Display, From, Error)]
pub(crate) enum ProcessError {
    /// Unable to spawn the process.
    Io(io::Error),

    /// Tool is not installed.
    #[display(fmt = "unable to locate executable: {}", _0)]
    Which(which::Error),

    /// Process exited with a non-zero status.
    #[from(ignore)]
    #[display(fmt = "{} exited with {}: {}", program, code, stderr)]
    Failed {
        program: String,
        code: i32,
        stderr: String,
    },
}

/// External command line tool.
pub(crate) struct Tool {
    program: PathBuf,
    name: String,
}

impl Tool {
    /// Locate a tool on `PATH`.
    pub(crate) fn find(name: &str) -> Result<Self, ProcessError> {
        Ok(Self {
            program: which::which(name)?,
            name: name.to_owned(),
        })
    }

    fn command<I, S>(&self, args: I, cwd: Option<&Path>) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.program);
        command.args(args);

        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        command
    }

    fn check(&self, output: Output) -> Result<String, ProcessError> {
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();

        Err(ProcessError::Failed {
            program: self.name.clone(),
            code: output.status.code().unwrap_or(-1),
            stderr: if stderr.is_empty() {
                String::from("No details available")
            } else {
                stderr
            },
        })
    }

    /// Run the tool and capture its trimmed standard output.
    pub(crate) fn output<I, S>(&self, args: I, cwd: Option<&Path>) -> Result<String, ProcessError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = self.command(args, cwd);
        debug!(?command, "running external tool");

        let output = command.stdin(Stdio::null()).output()?;
        self.check(output)
    }
}

/// Remote URL of the `origin` git remote of the provided directory.
pub(crate) fn git_origin(cwd: &Path) -> Result<String, ProcessError> {
    Tool::find("git")?.output(["config", "--get", "remote.origin.url"], Some(cwd))
}
