use std::{
    ffi::OsStr,
    fs::File,
    io::{self, Write},
    path::{Path, StripPrefixError},
};

use derive_more::{Display, Error, From};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use indicatif::ProgressBar;
use tempfile::NamedTempFile;
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

/// Directories that never end up in a deployment archive.
const EXCLUDED_DIRECTORIES: &[&str] = &[
    ".venv",
    "__pycache__",
    ".mypy_cache",
    ".pytest_cache",
    ".git",
    ".fastapicloud",
];

/// Project-specific ignore file, applied after `.gitignore`.
const IGNORE_FILE: &str = ".fastapicloudignore";

/// Errors that may occur during the archive creation process.
#[derive(Debug, Display, From, Error)]
pub(crate) enum ArchiverError {
    /// [`walkdir`]-crate specific error.
    WalkDir(walkdir::Error),

    /// IO error.
    Io(io::Error),

    /// Unable to strip project directory prefix from path.
    StripPrefix(StripPrefixError),

    /// Ignore file contains an invalid pattern.
    #[display(fmt = "unable to parse ignore file: {}", _0)]
    Ignore(ignore::Error),
}

/// Archive the project directory into a temporary tar file.
pub(crate) fn archive_project(
    root: &Path,
    progress: &ProgressBar,
) -> Result<NamedTempFile, ArchiverError> {
    let file = tempfile::Builder::new()
        .prefix("fastapi-cloud-deploy-")
        .suffix(".tar")
        .tempfile()?;

    let file = build_tar_archive(root, file, progress)?;
    Ok(file)
}

/// Archive the project directory into the provided `writer`.
///
/// Only regular files are stored, named relative to `root`. See
/// [`walk_project_directory`] for the list of skipped entries.
pub(crate) fn build_tar_archive<W: Write>(
    root: &Path,
    writer: W,
    progress: &ProgressBar,
) -> Result<W, ArchiverError> {
    let mut builder = tar::Builder::new(writer);
    let ignore = project_ignore(root)?;

    let mut entries = walk_project_directory(root, &ignore);
    let mut count = 0usize;

    while let Some(entry) = entries.next().transpose()? {
        if !entry.file_type().is_file() {
            continue;
        }

        let name = entry.path().strip_prefix(root)?;

        if name.to_str().is_none() {
            progress.println(format!(
                "File {} contains non-unicode symbols in path",
                entry.path().display()
            ));
            continue;
        }

        builder.append_file(name, &mut File::open(entry.path())?)?;
        count += 1;
    }

    debug!(files = count, root = %root.display(), "project archived");

    Ok(builder.into_inner()?)
}

/// Load `.gitignore` followed by `.fastapicloudignore` from the project root.
///
/// Later patterns win, so a `!pattern` in the project ignore file re-includes
/// entries ignored by git.
fn project_ignore(root: &Path) -> Result<Gitignore, ArchiverError> {
    let mut builder = GitignoreBuilder::new(root);

    for name in [".gitignore", IGNORE_FILE] {
        let path = root.join(name);

        if path.is_file() {
            if let Some(error) = builder.add(path) {
                return Err(error.into());
            }
        }
    }

    Ok(builder.build()?)
}

/// Whether an entry is always excluded, regardless of ignore files.
fn is_always_excluded(entry: &DirEntry) -> bool {
    let Some(name) = entry.file_name().to_str() else {
        return false;
    };

    if entry.file_type().is_dir() {
        return EXCLUDED_DIRECTORIES.contains(&name);
    }

    name == ".env"
        || name.starts_with(".env.")
        || entry.path().extension() == Some(OsStr::new("pyc"))
}

/// Recursively iterate over the project files and directories while filtering them.
///
/// Excluded directories are pruned without descending into them.
fn walk_project_directory<'a>(
    root: &Path,
    ignore: &'a Gitignore,
) -> impl Iterator<Item = Result<DirEntry, walkdir::Error>> + 'a {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(move |entry| {
            entry.depth() == 0
                || !(is_always_excluded(entry)
                    || ignore
                        .matched(entry.path(), entry.file_type().is_dir())
                        .is_ignore())
        })
}

/// Invalid application directory errors.
#[derive(Debug, Display, Error, PartialEq, Eq)]
pub(crate) enum AppDirectoryError {
    #[display(fmt = "The path cannot start with '~'.")]
    HomeRelative,

    #[display(fmt = "The path must be relative to the project directory.")]
    Absolute,

    #[display(fmt = "The path cannot contain '..' segments.")]
    ParentSegment,

    #[display(
        fmt = "The path can only contain letters, digits, spaces and the characters '/', '.', '_' and '-'."
    )]
    InvalidCharacters,
}

/// Validate the directory of an application inside of the project.
///
/// Returns [`None`] when the application lives at the project root.
pub(crate) fn validate_app_directory(input: &str) -> Result<Option<String>, AppDirectoryError> {
    let path = input.trim();

    if path.is_empty() {
        return Ok(None);
    }

    if path.starts_with('~') {
        return Err(AppDirectoryError::HomeRelative);
    }

    if path.starts_with('/') || Path::new(path).is_absolute() {
        return Err(AppDirectoryError::Absolute);
    }

    if path.split('/').any(|segment| segment == "..") {
        return Err(AppDirectoryError::ParentSegment);
    }

    if !path
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, ' ' | '/' | '.' | '_' | '-'))
    {
        return Err(AppDirectoryError::InvalidCharacters);
    }

    let normalized = path.trim_start_matches("./").trim_end_matches('/');

    match normalized {
        "" | "." => Ok(None),
        normalized => Ok(Some(normalized.to_owned())),
    }
}
