use std::{
    fmt::Display,
    io, mem,
    time::{Duration, Instant},
};

use derive_more::{Display, Error, From};
use reqwest::StatusCode;
use serde::{Deserialize, Deserializer};
use tracing::{debug, warn};

use super::{
    check_status,
    lines::{LineReader, ReadEvent},
    ApiClient, ApiError,
};
use crate::interrupt::{Cancelled, Interrupt, SleepError};

/// Kind of a build log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum LogLineType {
    /// Regular build output.
    Message,

    /// Build finished successfully.
    Complete,

    /// Build failed.
    Failed,

    /// Server closes the stream and asks the client to reconnect.
    Timeout,

    /// Keep-alive event.
    Heartbeat,

    /// Server-side streaming failure.
    Error,
}

/// Single build log event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub(crate) struct LogLine {
    #[serde(rename = "type")]
    pub kind: LogLineType,

    #[serde(default)]
    pub message: Option<String>,

    /// Resume cursor of this event.
    #[serde(default, deserialize_with = "deserialize_cursor")]
    pub id: Option<String>,
}

impl LogLine {
    /// Whether no further events follow this one.
    pub(crate) fn is_terminal(&self) -> bool {
        matches!(self.kind, LogLineType::Complete | LogLineType::Failed)
    }
}

/// Accept both string and numeric event identifiers.
fn deserialize_cursor<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(id)) => Ok(Some(id)),
        Some(serde_json::Value::Number(id)) => Ok(Some(id.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "unexpected event id: {other}"
        ))),
    }
}

/// Terminal build log streaming errors.
#[derive(Debug, Display, From, Error)]
pub(crate) enum StreamError {
    /// Credentials were rejected.
    #[from(ignore)]
    #[display(fmt = "The specified token is not valid")]
    Unauthorized,

    /// Request was rejected with a non-retryable status.
    #[from(ignore)]
    #[display(fmt = "build log request rejected with status {}", status)]
    Rejected { status: StatusCode },

    /// Server reported a streaming failure.
    #[from(ignore)]
    #[display(fmt = "{}", message)]
    Server { message: String },

    /// Retry budget exhausted.
    #[from(ignore)]
    #[display(fmt = "failed after {} attempts", attempts)]
    TooManyRetries { attempts: u32 },

    /// Wall-clock limit exceeded while recovering from failures.
    #[from(ignore)]
    #[display(fmt = "build log streaming timed out after {} seconds", seconds)]
    TimedOut { seconds: u64 },

    /// User interrupted the stream.
    Cancelled(Cancelled),
}

/// Reconnection and backoff parameters.
#[derive(Debug, Clone)]
pub(crate) struct RetryPolicy {
    /// Number of consecutive transient failures tolerated before giving up.
    pub max_retries: u32,

    /// Wall-clock limit measured from the first connection attempt.
    pub timeout: Duration,

    /// Backoff unit, doubled on every failure.
    pub base_delay: Duration,

    /// Upper bound of a single backoff delay.
    pub max_delay: Duration,

    /// Delay before reconnecting on a server `timeout` event.
    pub reconnect_delay: Duration,

    /// Longest silence tolerated on an open connection.
    pub read_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            timeout: Duration::from_secs(5 * 60),
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            reconnect_delay: Duration::from_millis(500),
            read_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay after the failure with the provided zero-based index.
    pub(crate) fn backoff(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Failure accounting of a single stream.
struct RetryBudget {
    policy: RetryPolicy,
    failures: u32,
    started: Option<Instant>,
}

impl RetryBudget {
    fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            failures: 0,
            started: None,
        }
    }

    /// Mark the start of a connection attempt.
    fn start(&mut self) {
        self.started.get_or_insert_with(Instant::now);
    }

    fn deadline(&self) -> Option<Instant> {
        self.started.map(|started| started + self.policy.timeout)
    }

    fn timed_out(&self) -> StreamError {
        StreamError::TimedOut {
            seconds: self.policy.timeout.as_secs(),
        }
    }

    /// Forget earlier failures once the connection delivers data again.
    fn recover(&mut self) {
        self.failures = 0;
    }

    /// Record a transient failure.
    ///
    /// Returns the delay before the next attempt, or the terminal error once the
    /// budget is exhausted.
    fn record_failure(&mut self) -> Result<Duration, StreamError> {
        let attempt = self.failures;
        self.failures += 1;

        if self.failures >= self.policy.max_retries {
            return Err(StreamError::TooManyRetries {
                attempts: self.failures,
            });
        }

        if self
            .deadline()
            .is_some_and(|deadline| Instant::now() >= deadline)
        {
            return Err(self.timed_out());
        }

        Ok(self.policy.backoff(attempt))
    }
}

enum State {
    Connecting,
    Streaming(LineReader),
    Reconnecting(Duration),
    Backoff(Duration),
    Terminated,
}

/// Resumable build log stream.
///
/// Yields `message` events as they arrive, followed by exactly one terminal item:
/// the `complete` or `failed` event, or an error. Transient failures are retried
/// transparently, resuming from the last seen event identifier.
pub(crate) struct BuildLogStream<'a> {
    client: &'a ApiClient,
    deployment_id: String,
    interrupt: Interrupt,
    reconnect_delay: Duration,
    read_timeout: Duration,
    budget: RetryBudget,
    cursor: Option<String>,
    state: State,
}

impl<'a> BuildLogStream<'a> {
    pub(super) fn new(
        client: &'a ApiClient,
        deployment_id: &str,
        policy: RetryPolicy,
        interrupt: Interrupt,
    ) -> Self {
        Self {
            client,
            deployment_id: deployment_id.to_owned(),
            interrupt,
            reconnect_delay: policy.reconnect_delay,
            read_timeout: policy.read_timeout,
            budget: RetryBudget::new(policy),
            cursor: None,
            state: State::Connecting,
        }
    }

    fn connect(&mut self) -> Result<LineReader, ApiError> {
        self.budget.start();

        debug!(
            deployment_id = %self.deployment_id,
            last_id = ?self.cursor,
            "connecting to build log stream"
        );

        let mut request = self
            .client
            .stream(&format!("/deployments/{}/build-logs", self.deployment_id));

        if let Some(cursor) = &self.cursor {
            request = request.query(&[("last_id", cursor)]);
        }

        let response = check_status(request.send()?)?;
        Ok(LineReader::spawn(response, self.interrupt.clone()))
    }

    fn terminate(&mut self, item: Result<LogLine, StreamError>) -> Option<<Self as Iterator>::Item> {
        self.state = State::Terminated;
        Some(item)
    }

    /// Schedule a retry after a transient failure, or terminate once the budget is spent.
    fn retry(&mut self, cause: &dyn Display) -> Option<<Self as Iterator>::Item> {
        match self.budget.record_failure() {
            Ok(delay) => {
                warn!(%cause, ?delay, "build log stream interrupted, retrying");
                self.state = State::Backoff(delay);
                None
            }
            Err(error) => {
                warn!(%cause, "build log stream interrupted, giving up");
                self.terminate(Err(error))
            }
        }
    }

    fn on_connect_error(&mut self, error: ApiError) -> Option<<Self as Iterator>::Item> {
        if error.is_transient() {
            return self.retry(&error);
        }

        let error = match error {
            ApiError::Unauthorized => StreamError::Unauthorized,
            ApiError::NotFound => StreamError::Rejected {
                status: StatusCode::NOT_FOUND,
            },
            ApiError::Status { status } => StreamError::Rejected { status },
            error => {
                debug!(%error, "non-retryable build log request failure");
                StreamError::Rejected {
                    status: StatusCode::BAD_REQUEST,
                }
            }
        };

        self.terminate(Err(error))
    }

    fn on_line(&mut self, line: &[u8]) -> Option<<Self as Iterator>::Item> {
        self.budget.recover();

        if line.iter().all(u8::is_ascii_whitespace) {
            return None;
        }

        let event: LogLine = match serde_json::from_slice(line) {
            Ok(event) => event,
            Err(error) => {
                debug!(
                    line = %String::from_utf8_lossy(line),
                    %error,
                    "skipping unparsable build log line"
                );
                return None;
            }
        };

        if let Some(id) = &event.id {
            self.cursor = Some(id.clone());
        }

        match event.kind {
            LogLineType::Message => Some(Ok(event)),
            LogLineType::Complete | LogLineType::Failed => self.terminate(Ok(event)),
            LogLineType::Timeout => {
                debug!(last_id = ?self.cursor, "server requested reconnect");
                self.state = State::Reconnecting(self.reconnect_delay);
                None
            }
            LogLineType::Heartbeat => None,
            LogLineType::Error => self.terminate(Err(StreamError::Server {
                message: event
                    .message
                    .unwrap_or_else(|| String::from("Unknown error")),
            })),
        }
    }
}

impl Iterator for BuildLogStream<'_> {
    type Item = Result<LogLine, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let State::Terminated = self.state {
                return None;
            }

            if let Err(cancelled) = self.interrupt.check() {
                return self.terminate(Err(cancelled.into()));
            }

            let item = match mem::replace(&mut self.state, State::Connecting) {
                State::Terminated => {
                    self.state = State::Terminated;
                    return None;
                }
                State::Connecting => match self.connect() {
                    Ok(lines) => {
                        self.state = State::Streaming(lines);
                        None
                    }
                    Err(error) => self.on_connect_error(error),
                },
                State::Reconnecting(delay) => match self.interrupt.sleep(delay) {
                    Ok(()) => None,
                    Err(cancelled) => self.terminate(Err(cancelled.into())),
                },
                State::Backoff(delay) => {
                    match self.interrupt.sleep_until(delay, self.budget.deadline()) {
                        Ok(()) => None,
                        Err(SleepError::Cancelled(cancelled)) => {
                            self.terminate(Err(cancelled.into()))
                        }
                        Err(SleepError::DeadlineExceeded) => {
                            let error = self.budget.timed_out();
                            self.terminate(Err(error))
                        }
                    }
                }
                State::Streaming(reader) => match reader.next_event(self.read_timeout) {
                    ReadEvent::Line(line) => {
                        self.state = State::Streaming(reader);
                        self.on_line(&line)
                    }
                    ReadEvent::Failed(error) => self.retry(&error),
                    ReadEvent::Closed => self.retry(&io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream closed before a terminal event",
                    )),
                    ReadEvent::Idle => self.retry(&io::Error::new(
                        io::ErrorKind::TimedOut,
                        "no build log data received in time",
                    )),
                    ReadEvent::Cancelled(cancelled) => self.terminate(Err(cancelled.into())),
                },
            };

            if item.is_some() {
                return item;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        thread,
        time::{Duration, Instant},
    };

    use super::{LogLine, LogLineType, RetryPolicy, StreamError};
    use crate::{
        api::ApiClient,
        interrupt::Interrupt,
        testing::{MockServer, Reply},
    };

    const BUILD_LOGS: &str = "/deployments/42/build-logs";

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            reconnect_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        }
    }

    fn collect(server: &MockServer) -> Vec<Result<LogLine, StreamError>> {
        let client = ApiClient::new(&server.url(), Some("token")).expect("unable to create client");
        client
            .stream_build_logs("42", fast_policy(), &Interrupt::new())
            .collect()
    }

    fn message(line: &Result<LogLine, StreamError>) -> Option<&str> {
        line.as_ref().ok()?.message.as_deref()
    }

    #[test]
    fn yields_messages_then_complete() {
        let server = MockServer::start();
        server.route(
            "GET",
            BUILD_LOGS,
            Reply::ndjson(&[
                r#"{"type": "message", "message": "Building...", "id": "1"}"#,
                r#"{"type": "message", "message": "Done!", "id": "2"}"#,
                r#"{"type": "complete"}"#,
            ]),
        );

        let lines = collect(&server);

        assert_eq!(lines.len(), 3);
        assert_eq!(message(&lines[0]), Some("Building..."));
        assert_eq!(message(&lines[1]), Some("Done!"));
        assert!(matches!(
            &lines[2],
            Ok(LogLine {
                kind: LogLineType::Complete,
                ..
            })
        ));
        assert_eq!(server.requests_to(BUILD_LOGS).len(), 1);
    }

    #[test]
    fn failed_event_terminates_stream() {
        let server = MockServer::start();
        server.route(
            "GET",
            BUILD_LOGS,
            Reply::ndjson(&[
                r#"{"type": "message", "message": "Oops", "id": "1"}"#,
                r#"{"type": "failed"}"#,
                r#"{"type": "message", "message": "never seen", "id": "2"}"#,
            ]),
        );

        let lines = collect(&server);

        assert_eq!(lines.len(), 2);
        assert!(lines[1].as_ref().is_ok_and(LogLine::is_terminal));
    }

    #[test]
    fn timeout_event_reconnects_with_cursor() {
        let server = MockServer::start();
        server.route(
            "GET",
            BUILD_LOGS,
            Reply::ndjson(&[
                r#"{"type": "message", "message": "Step 1", "id": "1"}"#,
                r#"{"type": "message", "message": "Step 2", "id": "2"}"#,
                r#"{"type": "timeout"}"#,
            ]),
        );
        server.route(
            "GET",
            BUILD_LOGS,
            Reply::ndjson(&[
                r#"{"type": "message", "message": "Step 3", "id": "3"}"#,
                r#"{"type": "complete", "id": "4"}"#,
            ]),
        );

        let lines = collect(&server);
        let messages: Vec<_> = lines.iter().filter_map(message).collect();

        assert_eq!(messages, ["Step 1", "Step 2", "Step 3"]);
        assert!(lines.last().is_some_and(|line| line.is_ok()));

        let requests = server.requests_to(BUILD_LOGS);
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].query_param("last_id"), None);
        assert_eq!(requests[1].query_param("last_id").as_deref(), Some("2"));
    }

    #[test]
    fn timeout_events_do_not_consume_budget() {
        let server = MockServer::start();

        for id in 1..=4 {
            server.route(
                "GET",
                BUILD_LOGS,
                Reply::ndjson(&[&format!(r#"{{"type": "timeout", "id": "{id}"}}"#)]),
            );
        }

        server.route("GET", BUILD_LOGS, Reply::ndjson(&[r#"{"type": "complete"}"#]));

        let lines = collect(&server);

        assert_eq!(lines.len(), 1);
        assert!(lines[0].is_ok());
        assert_eq!(server.requests_to(BUILD_LOGS).len(), 5);
    }

    #[test]
    fn transport_errors_exhaust_budget() {
        let server = MockServer::start();
        server.route("GET", BUILD_LOGS, Reply::hangup());

        let lines = collect(&server);

        assert_eq!(lines.len(), 1);
        assert!(matches!(
            lines[0],
            Err(StreamError::TooManyRetries { attempts: 3 })
        ));
        assert_eq!(
            lines[0].as_ref().map(|_| ()).unwrap_err().to_string(),
            "failed after 3 attempts"
        );
        assert_eq!(server.requests_to(BUILD_LOGS).len(), 3);
    }

    #[test]
    fn server_errors_are_retried() {
        let server = MockServer::start();
        server.route("GET", BUILD_LOGS, Reply::status(503));
        server.route(
            "GET",
            BUILD_LOGS,
            Reply::ndjson(&[
                r#"{"type": "message", "message": "Hello", "id": "1"}"#,
                r#"{"type": "complete", "id": "2"}"#,
            ]),
        );

        let lines = collect(&server);

        assert_eq!(lines.len(), 2);
        assert_eq!(message(&lines[0]), Some("Hello"));
        assert_eq!(server.requests_to(BUILD_LOGS).len(), 2);
    }

    #[test]
    fn body_ending_early_resumes_from_cursor() {
        let server = MockServer::start();
        server.route(
            "GET",
            BUILD_LOGS,
            Reply::ndjson(&[r#"{"type": "message", "message": "Partial", "id": "7"}"#]),
        );
        server.route("GET", BUILD_LOGS, Reply::ndjson(&[r#"{"type": "complete"}"#]));

        let lines = collect(&server);

        assert_eq!(lines.len(), 2);

        let requests = server.requests_to(BUILD_LOGS);
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].query_param("last_id").as_deref(), Some("7"));
    }

    #[test]
    fn unauthorized_is_fatal_on_first_attempt() {
        for status in [401, 403] {
            let server = MockServer::start();
            server.route("GET", BUILD_LOGS, Reply::status(status));

            let lines = collect(&server);

            assert_eq!(lines.len(), 1);
            assert!(matches!(lines[0], Err(StreamError::Unauthorized)));
            assert!(lines[0]
                .as_ref()
                .map(|_| ())
                .unwrap_err()
                .to_string()
                .contains("token is not valid"));
            assert_eq!(server.requests_to(BUILD_LOGS).len(), 1);
        }
    }

    #[test]
    fn client_errors_are_not_retried() {
        let server = MockServer::start();
        server.route("GET", BUILD_LOGS, Reply::status(404));

        let lines = collect(&server);

        assert_eq!(lines.len(), 1);
        assert!(matches!(lines[0], Err(StreamError::Rejected { .. })));
        assert_eq!(server.requests_to(BUILD_LOGS).len(), 1);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let server = MockServer::start();
        server.route(
            "GET",
            BUILD_LOGS,
            Reply::ndjson(&[
                r#"{"type": "message", "message": "Before", "id": "1"}"#,
                "this is not json",
                "",
                r#"{"type": "unknown_kind"}"#,
                r#"{"type": "heartbeat"}"#,
                r#"{"type": "message", "message": "After", "id": "2"}"#,
                r#"{"type": "complete"}"#,
            ]),
        );

        let lines = collect(&server);
        let messages: Vec<_> = lines.iter().filter_map(message).collect();

        assert_eq!(messages, ["Before", "After"]);
        assert_eq!(lines.len(), 3);
        assert_eq!(server.requests_to(BUILD_LOGS).len(), 1);
    }

    #[test]
    fn error_event_is_terminal() {
        let server = MockServer::start();
        server.route(
            "GET",
            BUILD_LOGS,
            Reply::ndjson(&[r#"{"type": "error", "message": "Build log unavailable"}"#]),
        );

        let lines = collect(&server);

        assert_eq!(lines.len(), 1);
        assert!(matches!(
            &lines[0],
            Err(StreamError::Server { message }) if message == "Build log unavailable"
        ));
        assert_eq!(server.requests_to(BUILD_LOGS).len(), 1);
    }

    #[test]
    fn wall_clock_limit_stops_retries() {
        let server = MockServer::start();
        server.route("GET", BUILD_LOGS, Reply::status(500));

        let client = ApiClient::new(&server.url(), Some("token")).expect("unable to create client");
        let policy = RetryPolicy {
            max_retries: 100,
            timeout: Duration::from_millis(50),
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(10),
            ..fast_policy()
        };

        let lines: Vec<_> = client
            .stream_build_logs("42", policy, &Interrupt::new())
            .collect();

        assert_eq!(lines.len(), 1);
        assert!(matches!(lines[0], Err(StreamError::TimedOut { .. })));
        assert_eq!(server.requests_to(BUILD_LOGS).len(), 1);
    }

    #[test]
    fn raised_interrupt_cancels_stream() {
        let server = MockServer::start();
        server.route("GET", BUILD_LOGS, Reply::ndjson(&[r#"{"type": "complete"}"#]));

        let client = ApiClient::new(&server.url(), Some("token")).expect("unable to create client");
        let interrupt = Interrupt::new();
        interrupt.raise();

        let lines: Vec<_> = client
            .stream_build_logs("42", fast_policy(), &interrupt)
            .collect();

        assert_eq!(lines.len(), 1);
        assert!(matches!(lines[0], Err(StreamError::Cancelled(_))));
        assert!(server.requests_to(BUILD_LOGS).is_empty());
    }

    #[test]
    fn slow_stream_is_not_cut_while_data_flows() {
        let server = MockServer::start();
        let mut lines: Vec<String> = (1..=8)
            .map(|id| format!(r#"{{"type": "message", "message": "Step {id}", "id": "{id}"}}"#))
            .collect();
        lines.push(String::from(r#"{"type": "complete"}"#));
        let lines: Vec<&str> = lines.iter().map(String::as_str).collect();

        server.route(
            "GET",
            BUILD_LOGS,
            Reply::trickle(&lines, Duration::from_millis(100)),
        );

        let client = ApiClient::new(&server.url(), Some("token")).expect("unable to create client");
        let policy = RetryPolicy {
            read_timeout: Duration::from_millis(400),
            ..fast_policy()
        };

        let started = Instant::now();
        let lines: Vec<_> = client
            .stream_build_logs("42", policy, &Interrupt::new())
            .collect();

        assert!(started.elapsed() > Duration::from_millis(400));
        assert_eq!(lines.len(), 9);
        assert_eq!(message(&lines[7]), Some("Step 8"));
        assert!(lines[8].as_ref().is_ok_and(LogLine::is_terminal));
        assert_eq!(server.requests_to(BUILD_LOGS).len(), 1);
    }

    #[test]
    fn idle_connection_counts_as_transport_failure() {
        let server = MockServer::start();
        server.route(
            "GET",
            BUILD_LOGS,
            Reply::trickle(&[r#"{"type": "complete"}"#], Duration::from_secs(10)),
        );
        server.route("GET", BUILD_LOGS, Reply::ndjson(&[r#"{"type": "complete"}"#]));

        let client = ApiClient::new(&server.url(), Some("token")).expect("unable to create client");
        let policy = RetryPolicy {
            read_timeout: Duration::from_millis(200),
            ..fast_policy()
        };

        let started = Instant::now();
        let lines: Vec<_> = client
            .stream_build_logs("42", policy, &Interrupt::new())
            .collect();

        assert_eq!(lines.len(), 1);
        assert!(lines[0].is_ok());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(server.requests_to(BUILD_LOGS).len(), 2);
    }

    #[test]
    fn delivered_lines_reset_failure_count() {
        let server = MockServer::start();

        for id in 1..=4 {
            server.route(
                "GET",
                BUILD_LOGS,
                Reply::ndjson(&[&format!(
                    r#"{{"type": "message", "message": "Part {id}", "id": "{id}"}}"#
                )]),
            );
        }

        server.route("GET", BUILD_LOGS, Reply::ndjson(&[r#"{"type": "complete"}"#]));

        let lines = collect(&server);

        assert_eq!(lines.len(), 5);
        assert!(lines.iter().all(Result::is_ok));
        assert_eq!(server.requests_to(BUILD_LOGS).len(), 5);
    }

    #[test]
    fn undecodable_lines_are_skipped() {
        let server = MockServer::start();
        server.route(
            "GET",
            BUILD_LOGS,
            Reply::ndjson_bytes(&[
                br#"{"type": "message", "message": "Before", "id": "1"}"#,
                b"\xff\xfe garbage",
                br#"{"type": "message", "message": "After", "id": "2"}"#,
                br#"{"type": "complete"}"#,
            ]),
        );

        let lines = collect(&server);
        let messages: Vec<_> = lines.iter().filter_map(message).collect();

        assert_eq!(messages, ["Before", "After"]);
        assert_eq!(lines.len(), 3);
        assert!(lines[2].as_ref().is_ok_and(LogLine::is_terminal));
        assert_eq!(server.requests_to(BUILD_LOGS).len(), 1);
    }

    #[test]
    fn interrupt_during_quiet_build_cancels_promptly() {
        let server = MockServer::start();
        server.route(
            "GET",
            BUILD_LOGS,
            Reply::trickle(&[r#"{"type": "complete"}"#], Duration::from_secs(30)),
        );

        let client = ApiClient::new(&server.url(), Some("token")).expect("unable to create client");
        let interrupt = Interrupt::new();

        let raiser = {
            let interrupt = interrupt.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(200));
                interrupt.raise();
            })
        };

        let started = Instant::now();
        let lines: Vec<_> = client
            .stream_build_logs("42", fast_policy(), &interrupt)
            .collect();

        raiser.join().expect("raiser panicked");

        assert_eq!(lines.len(), 1);
        assert!(matches!(lines[0], Err(StreamError::Cancelled(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(server.requests_to(BUILD_LOGS).len(), 1);
    }

    #[test]
    fn backoff_doubles_up_to_limit() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(4), Duration::from_secs(16));
        assert_eq!(policy.backoff(5), Duration::from_secs(30));
        assert_eq!(policy.backoff(64), Duration::from_secs(30));
    }

    #[test]
    fn numeric_event_ids_become_cursors() {
        let line: LogLine = serde_json::from_str(r#"{"type": "message", "id": 12}"#)
            .expect("unable to parse line");

        assert_eq!(line.id.as_deref(), Some("12"));
        assert_eq!(line.message, None);
    }
}
