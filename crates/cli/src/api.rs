//! # Platform API client
//!
//! Thin blocking wrapper over the platform HTTP API. Every request carries the
//! bearer token of the current identity, and every response status is classified
//! into an [`ApiError`] so that commands can render a single user-facing message.
//!
//! Long-lived streaming endpoints live in the [`stream`] and [`status`] submodules.

/// Line-by-line reading of streamed bodies.
pub(crate) mod lines;

/// Deployment status polling.
pub(crate) mod status;

/// Build log streaming client.
pub(crate) mod stream;

use std::{collections::BTreeMap, path::Path, time::Duration};

use derive_more::{Display, Error, From};
use reqwest::{
    blocking::{
        multipart::{Form, Part},
        Client, RequestBuilder, Response,
    },
    StatusCode,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

pub(crate) use lines::{LineReader, ReadEvent};
pub(crate) use status::{DeploymentStatus, StatusPolicy, StatusPollError};
pub(crate) use stream::{BuildLogStream, LogLine, LogLineType, RetryPolicy, StreamError};

use crate::interrupt::Interrupt;

/// Default timeout applied to regular API requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout of the presigned archive upload.
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Longest silence of the application log stream when following new entries.
const APP_LOGS_FOLLOW_TIMEOUT: Duration = Duration::from_secs(120);

/// Longest silence of the application log stream when only fetching recent entries.
const APP_LOGS_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// OAuth grant type used to exchange a device code for an access token.
const DEVICE_CODE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// API request errors.
#[derive(Debug, Display, From, Error)]
pub(crate) enum ApiError {
    /// Transport-level failure: connection, timeout, protocol or body decoding.
    Http(reqwest::Error),

    /// Local file could not be read.
    Io(std::io::Error),

    /// Server rejected the credentials.
    #[from(ignore)]
    #[display(fmt = "the specified token is not valid")]
    Unauthorized,

    /// Requested resource does not exist.
    #[from(ignore)]
    #[display(fmt = "resource not found")]
    NotFound,

    /// Any other unsuccessful status code.
    #[from(ignore)]
    #[display(fmt = "server responded with status {}", status)]
    Status {
        /// Response status code.
        status: StatusCode,
    },
}

impl ApiError {
    /// Whether retrying the same request may succeed.
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            ApiError::Http(error) => !error.is_decode() && !error.is_builder(),
            ApiError::Status { status } => status.is_server_error(),
            ApiError::Io(_) | ApiError::Unauthorized | ApiError::NotFound => false,
        }
    }

    /// Whether the request failed because the server did not answer in time.
    pub(crate) fn is_timeout(&self) -> bool {
        matches!(self, ApiError::Http(error) if error.is_timeout())
    }
}

/// Map an unsuccessful response status onto an [`ApiError`].
pub(crate) fn check_status(response: Response) -> Result<Response, ApiError> {
    let status = response.status();

    if status.is_success() {
        return Ok(response);
    }

    debug!(%status, url = %response.url(), "unsuccessful API response");

    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::Unauthorized,
        StatusCode::NOT_FOUND => ApiError::NotFound,
        status => ApiError::Status { status },
    })
}

/// Paginated list response body.
#[derive(Deserialize)]
struct ListResponse<T> {
    /// Returned items.
    data: Vec<T>,
}

/// Team that owns applications.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub(crate) struct Team {
    pub id: String,
    pub slug: String,
    pub name: String,
}

/// Deployable application.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub(crate) struct App {
    pub id: String,
    pub slug: String,

    /// Directory inside the uploaded archive where the application lives.
    #[serde(default)]
    pub directory: Option<String>,
}

/// JSON request body used to create an application.
#[derive(Serialize)]
struct CreateAppRequest<'a> {
    name: &'a str,
    team_id: &'a str,
    directory: Option<&'a str>,
}

/// Single deployment of an application.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Deployment {
    pub id: String,
    pub app_id: String,
    pub slug: String,
    pub status: DeploymentStatus,

    /// Public URL of the deployed application.
    pub url: String,

    /// Dashboard page of this deployment.
    pub dashboard_url: String,
}

/// Presigned upload target returned by the API.
#[derive(Debug, Deserialize)]
pub(crate) struct UploadTarget {
    /// Storage URL accepting a multipart form.
    pub url: String,

    /// Form fields that must accompany the archive.
    pub fields: BTreeMap<String, String>,
}

/// Deploy token metadata.
#[derive(Debug, Deserialize)]
pub(crate) struct DeployToken {
    pub id: String,
    pub name: String,
}

/// Freshly created or regenerated deploy token.
#[derive(Debug, Deserialize)]
pub(crate) struct IssuedToken {
    /// Secret token value, only returned once.
    pub value: String,

    /// Expiration timestamp in RFC 3339 format.
    pub expired_at: String,
}

#[derive(Serialize)]
struct CreateTokenRequest<'a> {
    name: &'a str,
    expires_in_days: u32,
}

#[derive(Serialize)]
struct RegenerateTokenRequest {
    expires_in_days: u32,
}

/// Currently authenticated user.
#[derive(Debug, Deserialize)]
pub(crate) struct User {
    pub email: String,
}

/// Device authorization response of the OAuth device flow.
#[derive(Debug, Deserialize)]
pub(crate) struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,

    /// Verification URI with the user code already filled in.
    #[serde(default)]
    pub verification_uri_complete: Option<String>,

    /// Minimum polling interval, in seconds.
    #[serde(default)]
    pub interval: Option<u64>,
}

#[derive(Deserialize)]
struct DeviceTokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct DeviceTokenError {
    error: String,
}

/// Query string of the application log stream.
#[derive(Debug, Serialize)]
pub(crate) struct AppLogsQuery<'a> {
    /// Number of historical lines to return first.
    pub tail: u32,

    /// Relative time window, such as `5m` or `2d`.
    pub since: &'a str,

    /// Return recent entries and close the connection instead of streaming.
    pub no_follow: bool,
}

impl AppLogsQuery<'_> {
    /// Longest silence tolerated while reading the stream.
    pub(crate) fn read_timeout(&self) -> Duration {
        if self.no_follow {
            APP_LOGS_FETCH_TIMEOUT
        } else {
            APP_LOGS_FOLLOW_TIMEOUT
        }
    }
}

/// Result of [`ApiClient::upload_deployment`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Upload {
    /// Archive stored and the API notified.
    Completed,

    /// Interrupt was raised before the API was notified.
    Abandoned,
}

/// Blocking platform API client.
pub(crate) struct ApiClient {
    base_url: String,
    token: Option<String>,
    client: Client,

    /// Client without a total deadline, used for long-lived streamed bodies.
    stream_client: Client,
}

impl ApiClient {
    /// Create a client authenticated with the provided token.
    pub(crate) fn new(base_url: &str, token: Option<&str>) -> Result<Self, ApiError> {
        let user_agent = concat!("fastapi-cloud-cli/", env!("CARGO_PKG_VERSION"));

        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        let stream_client = Client::builder()
            .user_agent(user_agent)
            .connect_timeout(REQUEST_TIMEOUT)
            .timeout(None)
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            token: token.map(ToOwned::to_owned),
            client,
            stream_client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    pub(crate) fn get(&self, path: &str) -> RequestBuilder {
        self.authorize(self.client.get(self.url(path)))
    }

    pub(crate) fn post(&self, path: &str) -> RequestBuilder {
        self.authorize(self.client.post(self.url(path)))
    }

    /// `GET` request whose body may stay open indefinitely.
    ///
    /// Callers enforce their own idle timeout while reading the body.
    pub(crate) fn stream(&self, path: &str) -> RequestBuilder {
        self.authorize(self.stream_client.get(self.url(path)))
    }

    fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, ApiError> {
        Ok(check_status(request.send()?)?.json()?)
    }

    pub(crate) fn get_teams(&self) -> Result<Vec<Team>, ApiError> {
        let list: ListResponse<Team> = Self::send_json(self.get("/teams/"))?;
        Ok(list.data)
    }

    pub(crate) fn get_apps(&self, team_id: &str) -> Result<Vec<App>, ApiError> {
        let list: ListResponse<App> =
            Self::send_json(self.get("/apps/").query(&[("team_id", team_id)]))?;
        Ok(list.data)
    }

    pub(crate) fn create_app(
        &self,
        team_id: &str,
        name: &str,
        directory: Option<&str>,
    ) -> Result<App, ApiError> {
        Self::send_json(self.post("/apps/").json(&CreateAppRequest {
            name,
            team_id,
            directory,
        }))
    }

    /// Find an application by its identifier.
    ///
    /// Returns [`None`] if the application does not exist.
    pub(crate) fn get_app(&self, app_id: &str) -> Result<Option<App>, ApiError> {
        match Self::send_json(self.get(&format!("/apps/{app_id}"))) {
            Ok(app) => Ok(Some(app)),
            Err(ApiError::NotFound) => Ok(None),
            Err(error) => Err(error),
        }
    }

    pub(crate) fn create_deployment(&self, app_id: &str) -> Result<Deployment, ApiError> {
        Self::send_json(self.post(&format!("/apps/{app_id}/deployments/")))
    }

    pub(crate) fn get_deployment(
        &self,
        app_id: &str,
        deployment_id: &str,
    ) -> Result<Deployment, ApiError> {
        Self::send_json(self.get(&format!("/apps/{app_id}/deployments/{deployment_id}")))
    }

    /// Upload a deployment archive.
    ///
    /// The archive goes straight to the presigned storage URL, without API credentials,
    /// and the API is notified once the upload has finished. The notification is
    /// skipped if the interrupt was raised during the upload.
    pub(crate) fn upload_deployment(
        &self,
        deployment_id: &str,
        archive_path: &Path,
        interrupt: &Interrupt,
    ) -> Result<Upload, ApiError> {
        let target: UploadTarget =
            Self::send_json(self.post(&format!("/deployments/{deployment_id}/upload")))?;

        let form = target
            .fields
            .into_iter()
            .fold(Form::new(), |form, (key, value)| form.text(key, value))
            .part("file", Part::file(archive_path)?);

        debug!(url = %target.url, "uploading deployment archive");

        check_status(
            self.client
                .post(&target.url)
                .timeout(UPLOAD_TIMEOUT)
                .multipart(form)
                .send()?,
        )?;

        if interrupt.is_raised() {
            debug!(deployment_id, "upload interrupted, not marking it complete");
            return Ok(Upload::Abandoned);
        }

        check_status(
            self.post(&format!("/deployments/{deployment_id}/upload-complete"))
                .send()?,
        )?;

        Ok(Upload::Completed)
    }

    /// Tell the API that the upload was abandoned.
    pub(crate) fn cancel_upload(&self, deployment_id: &str) -> Result<(), ApiError> {
        check_status(
            self.post(&format!("/deployments/{deployment_id}/upload-cancelled"))
                .send()?,
        )?;
        Ok(())
    }

    /// Open a lazy build log stream.
    ///
    /// No request is made until the returned iterator is polled.
    pub(crate) fn stream_build_logs<'a>(
        &'a self,
        deployment_id: &str,
        policy: RetryPolicy,
        interrupt: &Interrupt,
    ) -> BuildLogStream<'a> {
        BuildLogStream::new(self, deployment_id, policy, interrupt.clone())
    }

    /// Open the application log stream.
    ///
    /// Lines are read on a background thread; see [`AppLogsQuery::read_timeout`] for
    /// the idle limit callers should apply.
    pub(crate) fn stream_app_logs(
        &self,
        app_id: &str,
        query: &AppLogsQuery<'_>,
        interrupt: &Interrupt,
    ) -> Result<LineReader, ApiError> {
        let response = check_status(
            self.stream(&format!("/apps/{app_id}/logs/stream"))
                .query(query)
                .send()?,
        )?;

        Ok(LineReader::spawn(response, interrupt.clone()))
    }

    pub(crate) fn list_tokens(&self, app_id: &str) -> Result<Vec<DeployToken>, ApiError> {
        let list: ListResponse<DeployToken> =
            Self::send_json(self.get(&format!("/apps/{app_id}/tokens")))?;
        Ok(list.data)
    }

    pub(crate) fn create_token(
        &self,
        app_id: &str,
        name: &str,
        expires_in_days: u32,
    ) -> Result<IssuedToken, ApiError> {
        Self::send_json(
            self.post(&format!("/apps/{app_id}/tokens"))
                .json(&CreateTokenRequest {
                    name,
                    expires_in_days,
                }),
        )
    }

    pub(crate) fn regenerate_token(
        &self,
        app_id: &str,
        token_id: &str,
        expires_in_days: u32,
    ) -> Result<IssuedToken, ApiError> {
        Self::send_json(
            self.post(&format!("/apps/{app_id}/tokens/{token_id}/regenerate"))
                .json(&RegenerateTokenRequest { expires_in_days }),
        )
    }

    pub(crate) fn current_user(&self) -> Result<User, ApiError> {
        Self::send_json(self.get("/users/me"))
    }

    /// Start the OAuth device authorization flow.
    pub(crate) fn request_device_code(
        &self,
        client_id: &str,
    ) -> Result<DeviceAuthorization, ApiError> {
        Self::send_json(
            self.client
                .post(self.url("/login/device/authorization"))
                .form(&[("client_id", client_id)]),
        )
    }

    /// Try to exchange a device code for an access token.
    ///
    /// Returns [`None`] while the user has not yet approved the request.
    pub(crate) fn poll_device_token(
        &self,
        client_id: &str,
        device_code: &str,
    ) -> Result<Option<String>, ApiError> {
        let response = self
            .client
            .post(self.url("/login/device/token"))
            .form(&[
                ("device_code", device_code),
                ("client_id", client_id),
                ("grant_type", DEVICE_CODE_GRANT_TYPE),
            ])
            .send()?;

        if response.status() == StatusCode::BAD_REQUEST {
            let body: DeviceTokenError = response.json()?;

            return match &*body.error {
                "authorization_pending" | "slow_down" => Ok(None),
                _ => Err(ApiError::Unauthorized),
            };
        }

        let body: DeviceTokenResponse = check_status(response)?.json()?;
        Ok(Some(body.access_token))
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use reqwest::StatusCode;

    use super::{ApiClient, ApiError, Upload};
    use crate::{
        interrupt::Interrupt,
        testing::{MockServer, Reply},
    };

    fn upload_server() -> MockServer {
        let server = MockServer::start();
        let upload_url = format!("{}/storage", server.url());

        server.route(
            "POST",
            "/deployments/42/upload",
            Reply::json(
                200,
                &format!(r#"{{"url": "{upload_url}", "fields": {{"key": "value"}}}}"#),
            ),
        );
        server.route("POST", "/storage", Reply::status(204));
        server.route("POST", "/deployments/42/upload-complete", Reply::status(200));

        server
    }

    #[test]
    fn classifies_status_codes() {
        let server = MockServer::start();
        server.route("GET", "/apps/unauthorized", Reply::status(401));
        server.route("GET", "/apps/forbidden", Reply::status(403));
        server.route("GET", "/apps/broken", Reply::status(502));
        server.route("GET", "/apps/missing", Reply::status(404));

        let client = ApiClient::new(&server.url(), Some("token")).expect("unable to create client");

        assert!(matches!(
            client.get_app("unauthorized"),
            Err(ApiError::Unauthorized)
        ));
        assert!(matches!(
            client.get_app("forbidden"),
            Err(ApiError::Unauthorized)
        ));

        let error = client.get_app("broken").expect_err("502 must fail");
        assert!(matches!(
            error,
            ApiError::Status {
                status: StatusCode::BAD_GATEWAY
            }
        ));
        assert!(error.is_transient());

        assert!(client
            .get_app("missing")
            .expect("404 maps to None")
            .is_none());
    }

    #[test]
    fn sends_bearer_token() {
        let server = MockServer::start();
        server.route(
            "GET",
            "/teams/",
            Reply::json(200, r#"{"data": [{"id": "1", "slug": "team", "name": "Team"}]}"#),
        );

        let client = ApiClient::new(&server.url(), Some("hello")).expect("unable to create client");
        let teams = client.get_teams().expect("unable to fetch teams");

        assert_eq!(teams.len(), 1);
        assert_eq!(teams[0].name, "Team");

        let requests = server.requests();
        assert_eq!(
            requests[0].header("authorization").as_deref(),
            Some("Bearer hello")
        );
    }

    #[test]
    fn uploads_archive_to_presigned_url() {
        let server = upload_server();

        let dir = tempfile::tempdir().expect("unable to create temp dir");
        let archive = dir.path().join("archive.tar");
        fs::write(&archive, b"archive contents").expect("unable to write archive");

        let client = ApiClient::new(&server.url(), Some("token")).expect("unable to create client");
        let upload = client
            .upload_deployment("42", &archive, &Interrupt::new())
            .expect("upload failed");

        assert_eq!(upload, Upload::Completed);

        let requests = server.requests();
        let paths: Vec<_> = requests.iter().map(|request| request.path.as_str()).collect();
        assert_eq!(
            paths,
            [
                "/deployments/42/upload",
                "/storage",
                "/deployments/42/upload-complete"
            ]
        );

        let storage_request = &requests[1];
        assert!(storage_request.header("authorization").is_none());
        assert!(storage_request.body_text().contains("archive contents"));
        assert!(storage_request.body_text().contains("name=\"key\""));
    }

    #[test]
    fn interrupted_upload_is_not_marked_complete() {
        let server = upload_server();

        let dir = tempfile::tempdir().expect("unable to create temp dir");
        let archive = dir.path().join("archive.tar");
        fs::write(&archive, b"archive contents").expect("unable to write archive");

        let interrupt = Interrupt::new();
        interrupt.raise();

        let client = ApiClient::new(&server.url(), Some("token")).expect("unable to create client");
        let upload = client
            .upload_deployment("42", &archive, &interrupt)
            .expect("upload failed");

        assert_eq!(upload, Upload::Abandoned);
        assert_eq!(server.requests_to("/storage").len(), 1);
        assert!(server
            .requests_to("/deployments/42/upload-complete")
            .is_empty());
    }

    #[test]
    fn device_token_pending_then_issued() {
        let server = MockServer::start();
        server.route(
            "POST",
            "/login/device/token",
            Reply::json(400, r#"{"error": "authorization_pending"}"#),
        );
        server.route(
            "POST",
            "/login/device/token",
            Reply::json(200, r#"{"access_token": "secret"}"#),
        );

        let client = ApiClient::new(&server.url(), None).expect("unable to create client");

        assert_eq!(
            client
                .poll_device_token("fastapi-cli", "device")
                .expect("pending must not fail"),
            None
        );
        assert_eq!(
            client
                .poll_device_token("fastapi-cli", "device")
                .expect("token must be issued")
                .as_deref(),
            Some("secret")
        );
    }
}
