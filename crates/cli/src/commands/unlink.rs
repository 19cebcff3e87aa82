use std::io;

use derive_more::{Display, Error, From};

use crate::{
    commands::{project_path, Unlink},
    config::{AppConfig, ConfigError},
};

/// `unlink` subcommand errors.
#[derive(Debug, Display, From, Error)]
pub(crate) enum UnlinkError {
    Config(ConfigError),

    /// IO-related error.
    Io(io::Error),

    #[from(ignore)]
    #[display(fmt = "No FastAPI Cloud configuration found in the current directory.")]
    NotLinked,
}

pub(crate) fn unlink(Unlink { path }: Unlink) -> Result<(), UnlinkError> {
    let path = project_path(path.as_deref())?;

    if !AppConfig::remove(&path)? {
        return Err(UnlinkError::NotLinked);
    }

    println!("FastAPI Cloud configuration has been unlinked successfully! 🚀");

    Ok(())
}
