use std::{
    io::{self, Write},
    time::Duration,
};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use derive_more::{Display, Error, From};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::debug;

use crate::{
    api::{ApiError, AppLogsQuery, LineReader, ReadEvent},
    commands::{project_path, Context, Logs, RequestError, SessionError},
    config::{AppConfig, ConfigError},
};

const FETCH_FAILED: &str = "Failed to fetch logs. Please try again later.";

/// `logs` subcommand errors.
#[derive(Debug, Display, From, Error)]
pub(crate) enum LogsError {
    Config(ConfigError),
    Session(SessionError),
    Request(RequestError),

    /// IO-related error.
    Io(io::Error),

    #[from(ignore)]
    #[display(fmt = "No app linked to this directory. Run `fastapi-cloud deploy` first.")]
    NotLinked,

    #[from(ignore)]
    #[display(fmt = "App not found. Make sure you're logged in the correct account.")]
    AppNotFound,

    /// Error event sent by the server.
    #[from(ignore)]
    #[display(fmt = "Error: {}", message)]
    Server { message: String },
}

/// Single application log entry.
#[derive(Debug, Deserialize)]
struct LogEntry {
    #[serde(deserialize_with = "deserialize_timestamp")]
    timestamp: DateTime<Utc>,
    message: String,
    #[serde(default = "unknown_level")]
    level: String,
}

fn unknown_level() -> String {
    String::from("unknown")
}

/// Accept timestamps with an offset as well as naive UTC timestamps.
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;

    if let Ok(timestamp) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(timestamp.with_timezone(&Utc));
    }

    raw.parse::<NaiveDateTime>()
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(serde::de::Error::custom)
}

fn format_log_line(entry: &LogEntry) -> String {
    format!(
        "{} [{}] {}",
        entry.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        entry.level.to_uppercase(),
        entry.message
    )
}

pub(crate) fn logs(
    Logs {
        path,
        tail,
        since,
        no_follow,
    }: Logs,
    ctx: &Context,
) -> Result<(), LogsError> {
    let session = ctx.session()?;
    let path = project_path(path.as_deref())?;

    let app = AppConfig::load(&path)?.ok_or(LogsError::NotLinked)?;

    debug!(app_id = %app.app_id, "fetching logs");

    if no_follow {
        println!("Fetching logs...");
    } else {
        println!("Streaming logs (Ctrl+C to exit)...");
    }
    println!();

    let query = AppLogsQuery {
        tail,
        since: &since,
        no_follow,
    };

    let lines = session
        .client
        .stream_app_logs(&app.app_id, &query, &ctx.interrupt)
        .map_err(|error| match error {
            ApiError::NotFound => LogsError::AppNotFound,
            error => session.request_failed(Some(FETCH_FAILED))(error).into(),
        })?;

    let lines = Follow {
        reader: lines,
        read_timeout: query.read_timeout(),
    };

    let count = render_logs(lines, &mut io::stdout().lock()).map_err(|error| match error {
        LogsError::Io(error) => session.request_failed(Some(FETCH_FAILED))(error.into()).into(),
        error => error,
    })?;

    if ctx.interrupt.is_raised() {
        println!();
        println!("Stopped.");
    } else if no_follow && count == 0 {
        println!("No logs found for the specified time range.");
    }

    Ok(())
}

/// Print every log entry and return the number of printed entries.
///
/// Empty lines, heartbeats and entries that cannot be parsed are skipped. An error
/// event stops rendering.
fn render_logs<I, W>(lines: I, out: &mut W) -> Result<usize, LogsError>
where
    I: IntoIterator<Item = io::Result<String>>,
    W: Write,
{
    let mut count = 0;

    for line in lines {
        let line = line?;

        if line.trim().is_empty() {
            continue;
        }

        let data: Value = match serde_json::from_str(&line) {
            Ok(data) => data,
            Err(error) => {
                debug!(%error, line = %line, "unable to parse log line");
                continue;
            }
        };

        match data.get("type").and_then(Value::as_str) {
            Some("heartbeat") => continue,
            Some("error") => {
                let message = data
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown error");

                return Err(LogsError::Server {
                    message: message.to_owned(),
                });
            }
            _ => {}
        }

        match serde_json::from_value::<LogEntry>(data) {
            Ok(entry) => {
                writeln!(out, "{}", format_log_line(&entry))?;
                count += 1;
            }
            Err(error) => debug!(%error, "unable to parse log entry"),
        }
    }

    Ok(count)
}

/// Log lines of an open stream, ending early on interrupt.
///
/// A stream that stays silent for longer than `read_timeout` fails with
/// [`io::ErrorKind::TimedOut`].
struct Follow {
    reader: LineReader,
    read_timeout: Duration,
}

impl Iterator for Follow {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.next_event(self.read_timeout) {
            ReadEvent::Line(line) => Some(Ok(String::from_utf8_lossy(&line).into_owned())),
            ReadEvent::Failed(error) => Some(Err(error)),
            ReadEvent::Idle => Some(Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "no log data received in time",
            ))),
            ReadEvent::Closed | ReadEvent::Cancelled(_) => None,
        }
    }
}
