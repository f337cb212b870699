use std::io;
use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use url::Url;

use crate::backoff::Backoff;

pub const DIR_CREATED_EVENT: &str = "dir_created";
pub const DIR_MOVED_EVENT: &str = "dir_moved";
pub const DIR_REMOVED_EVENT: &str = "dir_removed";
pub const FILE_MOVED_EVENT: &str = "file_moved";
pub const FILE_UPLOADED_EVENT: &str = "file_uploaded";
pub const FILE_REMOVED_EVENT: &str = "file_removed";

/// Reserved parent ids: a move whose destination is `trash` is a deletion,
/// entries parented under `system` are service containers (thumbnails etc.).
pub const TRASH_PARENT_ID: &str = "trash";
pub const SYSTEM_PARENT_ID: &str = "system";

const MAX_READ_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

impl ApiError {
    pub fn classification(&self) -> Option<ErrorClass> {
        match self {
            ApiError::Api { status, .. } => Some(classify_status(*status)),
            ApiError::Request(err) if err.is_timeout() || err.is_connect() => {
                Some(ErrorClass::Transient)
            }
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ErrorClass::RateLimit | ErrorClass::Transient)
        )
    }
}

fn classify_status(status: StatusCode) -> ErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ErrorClass::RateLimit
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

/// Called with (bytes transferred so far, total size when known).
pub type ProgressCallback = Box<dyn Fn(u64, Option<u64>) + Send + Sync + 'static>;

#[derive(Clone, Debug)]
pub struct CloudClient {
    http: Client,
    base_url: Url,
    token: String,
    retry: Backoff,
}

impl CloudClient {
    /// Performs the authentication handshake and returns a session-bearing
    /// client.
    pub async fn authenticate(
        base_url: &str,
        login: &str,
        password: &str,
    ) -> Result<Self, ApiError> {
        let http = Client::new();
        let base_url = Url::parse(base_url)?;
        let url = base_url.join("/v1/auth")?;
        let response = http
            .post(url)
            .json(&AuthRequest { login, password })
            .send()
            .await?;
        let session: AuthResponse = Self::handle_response(response).await?;
        Ok(Self::session(http, base_url, session.token))
    }

    /// Builds a client around an already issued session token.
    pub fn with_token(base_url: &str, token: impl Into<String>) -> Result<Self, ApiError> {
        Ok(Self::session(Client::new(), Url::parse(base_url)?, token.into()))
    }

    fn session(http: Client, base_url: Url, token: String) -> Self {
        Self {
            http,
            base_url,
            token,
            retry: Backoff::new(250, 5_000, true),
        }
    }

    pub async fn list_dir(&self, id: &str) -> Result<DirListing, ApiError> {
        let url = self.endpoint(&format!("/v1/dirs/{id}/list"))?;
        self.get_json_with_retry(url).await
    }

    pub async fn get_props_by_id(&self, id: &str) -> Result<ObjectProps, ApiError> {
        let mut url = self.endpoint("/v1/props")?;
        url.query_pairs_mut().append_pair("id", id);
        let payload: PropsResponse = self.get_json_with_retry(url).await?;
        Ok(payload.object)
    }

    pub async fn get_props_by_path(&self, path: &str) -> Result<ObjectProps, ApiError> {
        let mut url = self.endpoint("/v1/props")?;
        url.query_pairs_mut().append_pair("path", path);
        let payload: PropsResponse = self.get_json_with_retry(url).await?;
        Ok(payload.object)
    }

    pub async fn make_dir(&self, parent_id: &str, name: &str) -> Result<String, ApiError> {
        let mut url = self.endpoint("/v1/dirs")?;
        url.query_pairs_mut()
            .append_pair("parent_id", parent_id)
            .append_pair("name", name);
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        let created: CreatedDir = Self::handle_response(response).await?;
        Ok(created.id)
    }

    pub async fn remove_dir(&self, id: &str, recursive: bool, purge: bool) -> Result<(), ApiError> {
        let mut url = self.endpoint(&format!("/v1/dirs/{id}"))?;
        url.query_pairs_mut()
            .append_pair("recursive", if recursive { "true" } else { "false" })
            .append_pair("purge", if purge { "true" } else { "false" });
        let response = self
            .http
            .delete(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::expect_success(response).await
    }

    pub async fn remove_file(&self, id: &str, purge: bool) -> Result<(), ApiError> {
        let mut url = self.endpoint(&format!("/v1/files/{id}"))?;
        url.query_pairs_mut()
            .append_pair("purge", if purge { "true" } else { "false" });
        let response = self
            .http
            .delete(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::expect_success(response).await
    }

    /// Fetches the ordered event log starting at `since` (unix seconds).
    pub async fn get_events(&self, since: u64) -> Result<Vec<RemoteEventRecord>, ApiError> {
        let mut url = self.endpoint("/v1/events")?;
        url.query_pairs_mut()
            .append_pair("since", &since.to_string());
        let payload: EventsResponse = self.get_json_with_retry(url).await?;
        Ok(payload.events)
    }

    /// Streams a local file into the directory `dir_id`, overwriting an
    /// existing entry of the same name when `overwrite` is set.
    pub async fn push_file(
        &self,
        dir_id: &str,
        source: &Path,
        name: &str,
        overwrite: bool,
        progress: Option<ProgressCallback>,
    ) -> Result<RemoteFile, ApiError> {
        let mut url = self.endpoint("/v1/files")?;
        url.query_pairs_mut()
            .append_pair("dir_id", dir_id)
            .append_pair("name", name)
            .append_pair("overwrite", if overwrite { "true" } else { "false" });

        let file = tokio::fs::File::open(source).await?;
        let total = file.metadata().await?.len();
        let mut sent = 0u64;
        let stream = ReaderStream::new(file).map(move |chunk| {
            if let Ok(bytes) = &chunk {
                sent += bytes.len() as u64;
                if let Some(report) = &progress {
                    report(sent, Some(total));
                }
            }
            chunk
        });
        let response = self
            .http
            .put(url)
            .header("Authorization", self.auth_header_value())
            .body(reqwest::Body::wrap_stream(stream))
            .send()
            .await?;
        Self::handle_response(response).await
    }

    /// Streams remote file `id` to `target`, staging under a `.partial`
    /// suffix so a crashed transfer never leaves a truncated file behind.
    pub async fn pull_file(
        &self,
        id: &str,
        target: &Path,
        progress: Option<ProgressCallback>,
    ) -> Result<(), ApiError> {
        let url = self.endpoint(&format!("/v1/files/{id}/content"))?;
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Api { status, body });
        }
        let total = response.content_length();

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(target);
        let mut file = tokio::fs::File::create(&partial).await?;
        let mut stream = response.bytes_stream();
        let mut received = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            if let Some(report) = &progress {
                report(received, total);
            }
        }
        file.flush().await?;
        file.sync_all().await?;
        tokio::fs::rename(partial, target).await?;
        Ok(())
    }

    fn auth_header_value(&self) -> String {
        format!("Token {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.base_url.join(path)?)
    }

    async fn get_json_with_retry<T: DeserializeOwned>(&self, url: Url) -> Result<T, ApiError> {
        let mut attempt = 0u32;
        loop {
            let outcome = self
                .http
                .get(url.clone())
                .header("Authorization", self.auth_header_value())
                .send()
                .await;
            let err = match outcome {
                Ok(response) if response.status().is_success() => {
                    return Ok(response.json::<T>().await?);
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    ApiError::Api { status, body }
                }
                Err(err) => ApiError::Request(err),
            };
            if attempt + 1 >= MAX_READ_ATTEMPTS || !err.is_retryable() {
                return Err(err);
            }
            tokio::time::sleep(self.retry.delay(attempt)).await;
            attempt += 1;
        }
    }

    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::Api { status, body })
        }
    }

    async fn expect_success(response: reqwest::Response) -> Result<(), ApiError> {
        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Api { status, body })
    }
}

fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}

#[derive(Debug, Serialize)]
struct AuthRequest<'a> {
    login: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct CreatedDir {
    id: String,
}

#[derive(Debug, Deserialize)]
struct PropsResponse {
    object: ObjectProps,
}

#[derive(Debug, Deserialize)]
struct EventsResponse {
    events: Vec<RemoteEventRecord>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObjectProps {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub mtime: i64,
    #[serde(default)]
    pub chksum: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteFile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub mtime: i64,
    #[serde(default)]
    pub chksum: Option<String>,
    #[serde(default)]
    pub is_trash: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteDir {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub mtime: i64,
    #[serde(default)]
    pub is_trash: bool,
    #[serde(default)]
    pub special_dir: String,
}

/// Metadata of the listed directory itself; `tree` is its slash-wrapped
/// absolute path, e.g. `/Docs/`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DirInfo {
    pub id: String,
    pub tree: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DirListing {
    pub info: DirInfo,
    #[serde(default)]
    pub dirs: Vec<RemoteDir>,
    #[serde(default)]
    pub files: Vec<RemoteFile>,
}

/// One raw entry of the remote event log, as served by `/v1/events`. Field
/// presence depends on the event kind.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteEventRecord {
    pub event: String,
    pub timestamp: u64,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub old_parent_id: Option<String>,
    #[serde(default)]
    pub old_name: Option<String>,
    #[serde(default)]
    pub new_parent_id: Option<String>,
    #[serde(default)]
    pub new_name: Option<String>,
}
