//! Scripted HTTP server and prompts used by command tests.
//!
//! Every server route holds a queue of replies. Each matching request consumes the
//! front reply, and the last reply of a queue is repeated for any further requests.
//! Requests that match no route receive `404 Not Found`.

use std::{
    collections::VecDeque,
    net::{SocketAddr, TcpListener},
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};

use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, HeaderMap, Method, Response, Uri},
    Router, Server,
};
use hyper::{body::Bytes, Body};
use inquire::InquireError;
use tokio::{runtime, sync::oneshot, time};

use crate::prompt::{PromptError, Prompter};

#[derive(Clone)]
enum Payload {
    Full(Vec<u8>),

    /// Chunks sent one by one with a pause before each of them.
    Trickle {
        chunks: Vec<Vec<u8>>,
        interval: Duration,
    },

    /// Connection is dropped before the body completes.
    Hangup,
}

/// Scripted response.
#[derive(Clone)]
pub(crate) struct Reply {
    status: u16,
    content_type: &'static str,
    payload: Payload,
}

impl Reply {
    /// Empty response with the provided status code.
    pub(crate) fn status(status: u16) -> Self {
        Self {
            status,
            content_type: "text/plain",
            payload: Payload::Full(Vec::new()),
        }
    }

    pub(crate) fn json(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "application/json",
            payload: Payload::Full(body.as_bytes().to_vec()),
        }
    }

    /// Newline-delimited JSON body, one line per item.
    pub(crate) fn ndjson(lines: &[&str]) -> Self {
        let lines: Vec<_> = lines.iter().map(|line| line.as_bytes()).collect();
        Self::ndjson_bytes(&lines)
    }

    /// Newline-delimited body made of arbitrary byte lines.
    pub(crate) fn ndjson_bytes(lines: &[&[u8]]) -> Self {
        let mut body = lines.join(&b'\n');
        body.push(b'\n');

        Self {
            status: 200,
            content_type: "application/x-ndjson",
            payload: Payload::Full(body),
        }
    }

    /// Newline-delimited JSON body sending one line per `interval`.
    pub(crate) fn trickle(lines: &[&str], interval: Duration) -> Self {
        Self {
            status: 200,
            content_type: "application/x-ndjson",
            payload: Payload::Trickle {
                chunks: lines
                    .iter()
                    .map(|line| format!("{line}\n").into_bytes())
                    .collect(),
                interval,
            },
        }
    }

    /// Drop the connection without completing the response.
    pub(crate) fn hangup() -> Self {
        Self {
            status: 200,
            content_type: "application/x-ndjson",
            payload: Payload::Hangup,
        }
    }

    fn into_response(self) -> Response<Body> {
        let body = match self.payload {
            Payload::Full(body) => Body::from(body),
            Payload::Trickle { chunks, interval } => {
                let (mut sender, body) = Body::channel();

                tokio::spawn(async move {
                    for chunk in chunks {
                        time::sleep(interval).await;

                        if sender.send_data(Bytes::from(chunk)).await.is_err() {
                            return;
                        }
                    }
                });

                body
            }
            Payload::Hangup => {
                let (sender, body) = Body::channel();
                sender.abort();
                body
            }
        };

        Response::builder()
            .status(self.status)
            .header(CONTENT_TYPE, self.content_type)
            .body(body)
            .expect("invalid mock response")
    }
}

/// Request received by the server.
#[derive(Clone, Debug)]
pub(crate) struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    /// Case-insensitive header lookup.
    pub(crate) fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
    }

    /// Raw value of a query string parameter.
    pub(crate) fn query_param(&self, name: &str) -> Option<String> {
        self.query.as_deref()?.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key == name).then(|| value.to_owned())
        })
    }

    pub(crate) fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

struct Route {
    method: String,
    path: String,
    replies: VecDeque<Reply>,
}

#[derive(Default)]
struct ServerState {
    routes: Vec<Route>,
    requests: Vec<RecordedRequest>,
}

impl ServerState {
    fn reply_for(&mut self, method: &str, path: &str) -> Reply {
        let route = self
            .routes
            .iter_mut()
            .find(|route| route.method == method && route.path == path);

        match route {
            Some(route) if route.replies.len() > 1 => route
                .replies
                .pop_front()
                .unwrap_or_else(|| Reply::status(404)),
            Some(route) => route
                .replies
                .front()
                .cloned()
                .unwrap_or_else(|| Reply::status(404)),
            None => Reply::status(404),
        }
    }
}

type SharedState = Arc<Mutex<ServerState>>;

async fn respond(
    State(state): State<SharedState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response<Body> {
    let request = RecordedRequest {
        method: method.to_string(),
        path: uri.path().to_owned(),
        query: uri.query().map(str::to_owned),
        headers: headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_owned(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect(),
        body: body.to_vec(),
    };

    let reply = {
        let mut state = state.lock().expect("mock server state poisoned");
        let reply = state.reply_for(&request.method, &request.path);
        state.requests.push(request);
        reply
    };

    reply.into_response()
}

/// In-process HTTP server bound to a random local port.
///
/// The server runs on its own single-threaded runtime, so blocking clients can
/// call it from test threads.
pub(crate) struct MockServer {
    address: SocketAddr,
    state: SharedState,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MockServer {
    pub(crate) fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("unable to bind mock server");
        listener
            .set_nonblocking(true)
            .expect("unable to configure mock server socket");

        let address = listener
            .local_addr()
            .expect("unable to read mock server address");

        let state = SharedState::default();
        let (shutdown, stopped) = oneshot::channel::<()>();
        let app = Router::new().fallback(respond).with_state(state.clone());

        let handle = thread::spawn(move || {
            let runtime = runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("unable to start mock server runtime");

            runtime.block_on(async move {
                let server = Server::from_tcp(listener)
                    .expect("unable to start mock server")
                    .serve(app.into_make_service());

                tokio::select! {
                    _ = server => {}
                    _ = stopped => {}
                }
            });
        });

        Self {
            address,
            state,
            shutdown: Some(shutdown),
            handle: Some(handle),
        }
    }

    /// Base URL of the server, without a trailing slash.
    pub(crate) fn url(&self) -> String {
        format!("http://{}", self.address)
    }

    /// Append a reply to the queue of the provided route.
    pub(crate) fn route(&self, method: &str, path: &str, reply: Reply) {
        let mut state = self.state.lock().expect("mock server state poisoned");

        match state
            .routes
            .iter_mut()
            .find(|route| route.method == method && route.path == path)
        {
            Some(route) => route.replies.push_back(reply),
            None => state.routes.push(Route {
                method: method.to_owned(),
                path: path.to_owned(),
                replies: VecDeque::from([reply]),
            }),
        }
    }

    /// Requests received so far, in order.
    pub(crate) fn requests(&self) -> Vec<RecordedRequest> {
        self.state
            .lock()
            .expect("mock server state poisoned")
            .requests
            .clone()
    }

    /// Requests received so far for the provided path.
    pub(crate) fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.path == path)
            .collect()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }

        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Prompter answering from a fixed script.
///
/// Empty answers pick the default, confirmations accept `y`/`n` and choices take the
/// zero-based index of an option. Running out of answers fails like a closed
/// terminal.
pub(crate) struct ScriptedPrompt {
    answers: VecDeque<String>,
    asked: Vec<String>,
}

impl ScriptedPrompt {
    pub(crate) fn new(answers: &[&str]) -> Self {
        Self {
            answers: answers.iter().map(|answer| answer.to_string()).collect(),
            asked: Vec::new(),
        }
    }

    /// Questions asked so far, in order.
    pub(crate) fn asked(&self) -> &[String] {
        &self.asked
    }

    fn answer(&mut self, question: String) -> Result<String, PromptError> {
        self.asked.push(question);

        self.answers
            .pop_front()
            .ok_or(PromptError::Failed(InquireError::NotTTY))
    }
}

impl Prompter for ScriptedPrompt {
    fn confirm(&mut self, question: &str, default: bool) -> Result<bool, PromptError> {
        match self.answer(question.to_owned())?.as_str() {
            "" => Ok(default),
            "y" => Ok(true),
            "n" => Ok(false),
            other => panic!("unexpected confirmation answer: {other}"),
        }
    }

    fn input(&mut self, question: &str, default: Option<&str>) -> Result<String, PromptError> {
        let answer = self.answer(question.to_owned())?;

        Ok(match default {
            Some(default) if answer.is_empty() => default.to_owned(),
            _ => answer,
        })
    }

    fn choose(&mut self, question: &str, labels: Vec<String>) -> Result<usize, PromptError> {
        let answer = self.answer(format!("{question} {}", labels.join(", ")))?;

        Ok(answer.parse().expect("choice must be an index"))
    }
}
