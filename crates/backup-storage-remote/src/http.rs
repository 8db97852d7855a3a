use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use backup_core::adapter::window_end;
use backup_core::path::{join_path, segments, validate_relative};
use backup_core::{
    ContinuationToken, CopyOutcome, DestinationKind, DirEntry, SliceBudget, StorageAdapter,
    StorageDestination, StorageError, TransferError, TransferSession,
};
use chrono::{DateTime, Utc};
use reqwest::header::{AUTHORIZATION, CONTENT_RANGE, LOCATION, RANGE};
use reqwest::{Client as HttpClient, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::sink::{open_source, read_chunk, PartialTarget};

/// Default chunk size for HTTP uploads.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

const EXPIRES_HEADER: &str = "x-upload-expires";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// How the upload service answered one request.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Reply {
    /// `308`: the service holds `[0, n)`
    Received(u64),
    /// `200`/`201`: the upload is finished and holds this many bytes
    Finished(u64),
    /// `409`/`416`: the chunk did not start where the service expected
    OffsetMismatch,
    Expired(String),
    Rejected(String),
    Transient(String),
}

#[derive(Debug, Deserialize)]
struct FinishedBody {
    size: u64,
}

/// Parse a `Range: bytes=0-N` header into the received length.
fn parse_received(range: Option<&str>) -> Option<u64> {
    let range = range?.trim();
    let (_, last) = range.strip_prefix("bytes=")?.split_once('-')?;
    last.trim().parse::<u64>().ok().map(|n| n + 1)
}

fn classify_failure(status: StatusCode, body: &str) -> Reply {
    let reason = if body.is_empty() {
        format!("HTTP {}", status)
    } else {
        format!("HTTP {}: {}", status, body)
    };
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => Reply::Expired(reason),
        StatusCode::CONFLICT | StatusCode::RANGE_NOT_SATISFIABLE => Reply::OffsetMismatch,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => Reply::Transient(reason),
        s if s.is_server_error() => Reply::Transient(reason),
        _ => Reply::Rejected(reason),
    }
}

async fn read_reply(response: Response) -> Reply {
    let status = response.status();
    if status == StatusCode::PERMANENT_REDIRECT {
        let range = response
            .headers()
            .get(RANGE)
            .and_then(|v| v.to_str().ok());
        return Reply::Received(parse_received(range).unwrap_or(0));
    }
    if status.is_success() {
        return match response.json::<FinishedBody>().await {
            Ok(body) => Reply::Finished(body.size),
            Err(e) => Reply::Transient(format!("unreadable completion body: {}", e)),
        };
    }
    let body = response.text().await.unwrap_or_default();
    classify_failure(status, &body)
}

fn storage_status_error(action: &str, path: &str, status: StatusCode, body: String) -> StorageError {
    match status {
        StatusCode::NOT_FOUND => StorageError::NotFound(path.to_string()),
        StatusCode::CONFLICT => StorageError::AlreadyExists(path.to_string()),
        _ => StorageError::Io(format!(
            "{} {} failed with status {}: {}",
            action, path, status, body
        )),
    }
}

/// Destination speaking a resumable upload-session protocol over HTTP.
///
/// - `POST {endpoint}/uploads` with `{"path", "size"}` opens a session; the
///   `Location` header is the session URI and `X-Upload-Expires` (RFC 3339)
///   its optional deadline
/// - `PUT {session}` with `Content-Range: bytes s-e/T` sends a chunk; `308`
///   with `Range: bytes=0-N` acknowledges, `200`/`201` with `{"size": N}`
///   finishes
/// - `PUT {session}` with `Content-Range: bytes */T` and no body asks the
///   service how much it holds
///
/// Plain file operations live under `{endpoint}/files/{path}` and
/// `{endpoint}/dirs/{path}`.
#[derive(Debug, Clone)]
pub struct HttpSessionAdapter {
    http_client: HttpClient,
    endpoint: String,
    root: String,
    api_token: Option<String>,
    chunk_size: u64,
}

impl HttpSessionAdapter {
    pub fn new(endpoint: impl Into<String>, root: impl Into<String>) -> Result<Self, StorageError> {
        let http_client = HttpClient::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StorageError::Internal(format!("Failed to build HTTP client: {}", e)))?;
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        Url::parse(&endpoint)
            .map_err(|e| StorageError::InvalidArgument(format!("bad endpoint {}: {}", endpoint, e)))?;
        Ok(Self {
            http_client,
            endpoint,
            root: root.into(),
            api_token: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
        })
    }

    /// Build from a destination; the bearer token is read from `token_env`.
    pub fn from_destination(destination: &StorageDestination) -> Result<Self, StorageError> {
        let endpoint = destination.endpoint.as_deref().ok_or_else(|| {
            StorageError::InvalidArgument(format!("destination {} has no endpoint", destination.id))
        })?;
        let mut adapter = Self::new(endpoint, destination.root.clone())?
            .with_chunk_size(destination.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE));
        if let Some(var) = &destination.token_env {
            let token = std::env::var(var).map_err(|_| {
                StorageError::InvalidArgument(format!(
                    "destination {}: environment variable {} is not set",
                    destination.id, var
                ))
            })?;
            adapter = adapter.with_token(token);
        }
        Ok(adapter)
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn remote(&self, path: &str) -> Result<String, StorageError> {
        validate_relative(path)?;
        Ok(join_path(&self.root, path))
    }

    fn url(&self, kind: &str, path: &str) -> Result<String, StorageError> {
        let encoded = segments(&self.remote(path)?)
            .map(|s| urlencoding::encode(s).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        Ok(format!("{}/{}/{}", self.endpoint, kind, encoded))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {}", token)),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response, StorageError> {
        self.authorized(request)
            .send()
            .await
            .map_err(|e| StorageError::Io(format!("{} request failed: {}", what, e)))
    }

    /// Resolve a `Location` header against the endpoint.
    fn session_uri(&self, location: &str) -> Result<String, StorageError> {
        let base = Url::parse(&format!("{}/", self.endpoint))
            .map_err(|e| StorageError::Internal(e.to_string()))?;
        base.join(location)
            .map(String::from)
            .map_err(|e| StorageError::Io(format!("bad session location {}: {}", location, e)))
    }

    /// Open an upload session. Transient failures come back as `Err(Ok(reason))`.
    async fn open_session(
        &self,
        dest_path: &str,
        size: u64,
    ) -> Result<Result<ContinuationToken, String>, TransferError> {
        let url = format!("{}/uploads", self.endpoint);
        let request = self
            .http_client
            .post(&url)
            .json(&json!({ "path": self.remote(dest_path)?, "size": size }));
        let response = match self.authorized(request).send().await {
            Ok(response) => response,
            Err(e) => return Ok(Err(format!("opening upload session: {}", e))),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return match classify_failure(status, &body) {
                Reply::Transient(reason) => Ok(Err(reason)),
                Reply::Rejected(reason) | Reply::Expired(reason) => {
                    Err(TransferError::Rejected(reason))
                }
                _ => Err(TransferError::Rejected(format!("HTTP {}", status))),
            };
        }

        let headers = response.headers();
        let location = headers
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| TransferError::Rejected("upload session without Location".to_string()))?;
        let uri = self.session_uri(location)?;
        let expires_at = headers
            .get(EXPIRES_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc));

        debug!("Opened upload session {} for {}", uri, dest_path);
        Ok(Ok(match expires_at {
            Some(at) => ContinuationToken::expiring(uri, at),
            None => ContinuationToken::new(uri),
        }))
    }

    async fn put_chunk(&self, uri: &str, start: u64, data: Vec<u8>, total: u64) -> Reply {
        let end = start + data.len() as u64 - 1;
        let request = self
            .http_client
            .put(uri)
            .header(CONTENT_RANGE, format!("bytes {}-{}/{}", start, end, total))
            .body(data);
        match self.authorized(request).send().await {
            Ok(response) => read_reply(response).await,
            Err(e) => Reply::Transient(format!("chunk upload: {}", e)),
        }
    }

    async fn query_offset(&self, uri: &str, total: u64) -> Reply {
        let request = self
            .http_client
            .put(uri)
            .header(CONTENT_RANGE, format!("bytes */{}", total));
        match self.authorized(request).send().await {
            Ok(response) => read_reply(response).await,
            Err(e) => Reply::Transient(format!("status query: {}", e)),
        }
    }
}

/// Where a reply leaves the upload loop.
enum Step {
    Continue,
    Finished,
    Interrupted(String),
}

#[async_trait]
impl StorageAdapter for HttpSessionAdapter {
    fn kind(&self) -> DestinationKind {
        DestinationKind::Http
    }

    #[instrument(skip(self), level = "debug")]
    async fn initialize(&self) -> Result<(), StorageError> {
        if self.root.is_empty() {
            return Ok(());
        }
        self.create_dir("").await
    }

    async fn is_valid(&self) -> bool {
        match self.url("dirs", "") {
            Ok(url) => match self.send(self.http_client.get(&url), "list").await {
                Ok(response) => response.status().is_success(),
                Err(_) => false,
            },
            Err(_) => false,
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let url = self.url("files", path)?;
        let response = self.send(self.http_client.head(&url), "HEAD").await?;
        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            s => Err(StorageError::Io(format!("HEAD {} failed with status {}", path, s))),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn create_dir(&self, path: &str) -> Result<(), StorageError> {
        let url = self.url("dirs", path)?;
        let response = self.send(self.http_client.put(&url), "mkdir").await?;
        let status = response.status();
        if status.is_success() {
            debug!("Created {}", path);
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(storage_status_error("mkdir", path, status, body))
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, path: &str, recursive: bool) -> Result<bool, StorageError> {
        if segments(path).next().is_none() {
            return Err(StorageError::InvalidArgument(
                "refusing to delete the destination root".to_string(),
            ));
        }
        let url = self.url("files", path)?;
        let request = self
            .http_client
            .delete(&url)
            .query(&[("recursive", recursive)]);
        let response = self.send(request, "DELETE").await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(storage_status_error("DELETE", path, status, body));
        }
        debug!("Deleted {}", path);
        Ok(true)
    }

    #[instrument(skip(self), level = "debug")]
    async fn move_path(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let url = self.url("files", from)?;
        let request = self
            .http_client
            .post(&url)
            .query(&[("move_to", self.remote(to)?)]);
        let response = self.send(request, "move").await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::CONFLICT => StorageError::AlreadyExists(to.to_string()),
            _ => storage_status_error("move", from, status, body),
        })
    }

    #[instrument(skip(self), level = "debug")]
    async fn scan_dir(&self, path: &str) -> Result<Vec<DirEntry>, StorageError> {
        let url = self.url("dirs", path)?;
        let response = self.send(self.http_client.get(&url), "list").await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(storage_status_error("list", path, status, body));
        }
        let mut entries: Vec<DirEntry> = response
            .json()
            .await
            .map_err(|e| StorageError::Serialization(format!("Failed to parse listing: {}", e)))?;
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    #[instrument(skip(self, session), level = "debug", fields(bytes = session.bytes_transferred))]
    async fn copy_to_storage(
        &self,
        source: &Path,
        dest_path: &str,
        offset: u64,
        length: u64,
        budget: Duration,
        session: &mut TransferSession,
    ) -> Result<CopyOutcome, TransferError> {
        let budget = SliceBudget::start(budget);
        let total = session.total_size;
        let mut file = open_source(source, session).await?;

        if session.token_expired(Utc::now()) {
            return Err(TransferError::SessionExpired(format!(
                "upload session for {} passed its deadline",
                dest_path
            )));
        }
        if session.is_fresh() {
            match self.open_session(dest_path, total).await? {
                Ok(token) => session.establish(token),
                Err(reason) => {
                    warn!("Could not open upload session: {}", reason);
                    return Ok(CopyOutcome {
                        interrupted: Some(reason),
                        ..Default::default()
                    });
                }
            }
        } else if session.bytes_transferred != offset {
            debug!(
                "Upload of {} resumes at {} instead of {}",
                dest_path, session.bytes_transferred, offset
            );
        }
        let uri = match &session.token {
            Some(token) => token.handle.clone(),
            None => return Err(TransferError::Rejected("session lost its token".to_string())),
        };

        let start = session.bytes_transferred;
        let mut end = window_end(start, length, total);
        // Bytes the service accepted during this call, bounded by `length`
        let mut accepted = 0u64;
        let mut finished = false;
        let mut interrupted = None;

        loop {
            let position = session.bytes_transferred;
            let querying = total == 0 || position >= total;
            let reply = if querying {
                self.query_offset(&uri, total).await
            } else if position >= end {
                break;
            } else {
                let n = (end - position).min(self.chunk_size) as usize;
                let data = read_chunk(&mut file, position, n).await?;
                let reply = self.put_chunk(&uri, position, data, total).await;
                if let Reply::Received(_) | Reply::Finished(_) = reply {
                    accepted += n as u64;
                    session.advance(n as u64);
                    debug!("Sent chunk {}..{} of {}", position, position + n as u64, dest_path);
                }
                reply
            };

            let step = match reply {
                Reply::Received(received) if querying && received >= total => Step::Interrupted(
                    "service holds every byte but has not finished the upload".to_string(),
                ),
                Reply::Received(received) => {
                    session.resync(received);
                    Step::Continue
                }
                Reply::Finished(size) if size == total => {
                    session.resync(total);
                    Step::Finished
                }
                Reply::Finished(size) => {
                    return Err(TransferError::SizeMismatch {
                        expected: total,
                        actual: size,
                    })
                }
                Reply::OffsetMismatch => match self.query_offset(&uri, total).await {
                    Reply::Received(received) => {
                        session.resync(received);
                        Step::Continue
                    }
                    Reply::Finished(size) if size == total => {
                        session.resync(total);
                        Step::Finished
                    }
                    Reply::Finished(size) => {
                        return Err(TransferError::SizeMismatch {
                            expected: total,
                            actual: size,
                        })
                    }
                    Reply::Expired(reason) => return Err(TransferError::SessionExpired(reason)),
                    Reply::Rejected(reason) => return Err(TransferError::Rejected(reason)),
                    Reply::Transient(reason) => Step::Interrupted(reason),
                    Reply::OffsetMismatch => {
                        Step::Interrupted("service cannot report its received range".to_string())
                    }
                },
                Reply::Expired(reason) => return Err(TransferError::SessionExpired(reason)),
                Reply::Rejected(reason) => return Err(TransferError::Rejected(reason)),
                Reply::Transient(reason) => Step::Interrupted(reason),
            };

            // A resync moves the window with the authoritative offset
            end = window_end(
                session.bytes_transferred,
                length.saturating_sub(accepted),
                total,
            );

            match step {
                Step::Continue if session.is_complete() => {}
                Step::Continue if budget.should_stop() => break,
                Step::Continue => {}
                Step::Finished => {
                    finished = true;
                    break;
                }
                Step::Interrupted(reason) => {
                    warn!("Upload of {} interrupted: {}", dest_path, reason);
                    interrupted = Some(reason);
                    break;
                }
            }
        }

        Ok(CopyOutcome {
            bytes: session.bytes_transferred.saturating_sub(start),
            complete: finished,
            interrupted,
        })
    }

    #[instrument(skip(self, session), level = "debug", fields(bytes = session.bytes_transferred))]
    async fn copy_from_storage(
        &self,
        dest_path: &str,
        target: &Path,
        offset: u64,
        length: u64,
        budget: Duration,
        session: &mut TransferSession,
    ) -> Result<CopyOutcome, TransferError> {
        let budget = SliceBudget::start(budget);
        let total = session.total_size;
        let partial = PartialTarget::new(target);
        let start = partial.prepare(session).await?;
        if start != offset {
            debug!("Download of {} resumes at {} instead of {}", dest_path, start, offset);
        }
        let end = window_end(start, length, total);
        let url = self.url("files", dest_path)?;

        let mut position = start;
        while position < end {
            let n = (end - position).min(self.chunk_size);
            let request = self
                .http_client
                .get(&url)
                .header(RANGE, format!("bytes={}-{}", position, position + n - 1));
            let response = match self.authorized(request).send().await {
                Ok(response) => response,
                Err(e) => {
                    return Ok(CopyOutcome {
                        bytes: position - start,
                        complete: false,
                        interrupted: Some(format!("download: {}", e)),
                    })
                }
            };
            let status = response.status();
            if status != StatusCode::PARTIAL_CONTENT && status != StatusCode::OK {
                let body = response.text().await.unwrap_or_default();
                return match classify_failure(status, &body) {
                    Reply::Transient(reason) => Ok(CopyOutcome {
                        bytes: position - start,
                        complete: false,
                        interrupted: Some(reason),
                    }),
                    Reply::Expired(_) => {
                        Err(TransferError::Storage(StorageError::NotFound(dest_path.to_string())))
                    }
                    _ => Err(TransferError::Rejected(format!("download {}: HTTP {}", dest_path, status))),
                };
            }
            let body = match response.bytes().await {
                Ok(body) => body,
                Err(e) => {
                    return Ok(CopyOutcome {
                        bytes: position - start,
                        complete: false,
                        interrupted: Some(format!("download body: {}", e)),
                    })
                }
            };
            // A server ignoring Range sends the whole file
            let chunk = if status == StatusCode::OK {
                let from = (position as usize).min(body.len());
                let to = ((position + n) as usize).min(body.len());
                body.slice(from..to)
            } else {
                body
            };
            if chunk.is_empty() {
                return Err(TransferError::SizeMismatch {
                    expected: total,
                    actual: position,
                });
            }
            partial.append(&chunk).await?;
            position += chunk.len() as u64;
            session.advance(chunk.len() as u64);

            if budget.should_stop() {
                break;
            }
        }

        let complete = session.is_complete();
        if complete {
            partial.finalize(total).await?;
        }
        Ok(CopyOutcome {
            bytes: position - start,
            complete,
            interrupted: None,
        })
    }

    #[instrument(skip(self, session), level = "debug")]
    async fn abort_session(&self, session: &TransferSession) -> Result<(), StorageError> {
        let Some(token) = &session.token else {
            return Ok(());
        };
        if !token.handle.starts_with("http") {
            // Download sessions point at a local partial file
            return PartialTarget::remove(&token.handle).await;
        }
        let response = self
            .send(self.http_client.delete(&token.handle), "abort")
            .await?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            debug!("Aborted upload session {}", token.handle);
            return Ok(());
        }
        Err(StorageError::Io(format!(
            "abort of {} failed with status {}",
            token.handle, status
        )))
    }
}
