use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use backup_core::adapter::window_end;
use backup_core::path::{join_path, segments, validate_relative};
use backup_core::{
    ContinuationToken, CopyOutcome, DestinationKind, DirEntry, SliceBudget, StorageAdapter,
    StorageDestination, StorageError, TransferError, TransferSession,
};
use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use crate::sink::{open_source, read_chunk, PartialTarget};

/// Smallest part S3 accepts (except for the last one).
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;
/// Most parts one multipart upload may have.
pub const MAX_PARTS: u64 = 10_000;
/// Default chunk size for downloads.
pub const DEFAULT_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

const PART_SIZE_META: &str = "part_size";
const OBJECT_KEY_META: &str = "key";

/// What a failed S3 call means for the transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Failure {
    /// The multipart upload is gone
    Expired(String),
    /// No such key
    Missing(String),
    Rejected(String),
    Transient(String),
    Other(String),
}

impl Failure {
    fn into_transfer(self) -> TransferError {
        match self {
            Failure::Expired(m) => TransferError::SessionExpired(m),
            Failure::Missing(m) => TransferError::Storage(StorageError::NotFound(m)),
            Failure::Rejected(m) => TransferError::Rejected(m),
            Failure::Transient(m) | Failure::Other(m) => TransferError::Storage(StorageError::Io(m)),
        }
    }

    fn into_storage(self) -> StorageError {
        match self {
            Failure::Missing(m) => StorageError::NotFound(m),
            Failure::Expired(m)
            | Failure::Rejected(m)
            | Failure::Transient(m)
            | Failure::Other(m) => StorageError::Io(m),
        }
    }
}

/// Sort an S3 error by error code first, HTTP status second.
fn classify_code(code: Option<&str>, status: Option<u16>, message: String) -> Failure {
    match (code, status) {
        (Some("NoSuchUpload"), _) => Failure::Expired(message),
        (Some("NoSuchKey") | Some("NotFound"), _) | (_, Some(404)) => Failure::Missing(message),
        (Some("SlowDown") | Some("RequestTimeout") | Some("InternalError"), _) => {
            Failure::Transient(message)
        }
        (Some("AccessDenied") | Some("InvalidAccessKeyId") | Some("SignatureDoesNotMatch"), _) => {
            Failure::Rejected(message)
        }
        (_, Some(401 | 403)) => Failure::Rejected(message),
        (_, Some(s)) if s >= 500 || s == 408 || s == 429 => Failure::Transient(message),
        _ => Failure::Other(message),
    }
}

fn classify<E>(err: &SdkError<E>) -> Failure
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let message = format!("{}", DisplayErrorContext(err));
    match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            Failure::Transient(message)
        }
        _ => {
            let code = err.as_service_error().and_then(|e| e.code());
            let status = err.raw_response().map(|r| r.status().as_u16());
            classify_code(code, status, message)
        }
    }
}

/// Part size for a file: at least `chunk_size` and 5 MiB, and large enough to
/// stay within the part count limit.
fn plan_part_size(total: u64, chunk_size: u64) -> u64 {
    chunk_size
        .max(MIN_PART_SIZE)
        .max(total.div_ceil(MAX_PARTS))
}

/// Bytes covered by the run of parts starting at part 1 with no gaps.
///
/// A part shorter than `part_size` is only accepted as the final one.
fn contiguous_bytes(parts: &[(i32, u64)], part_size: u64, total: u64) -> u64 {
    let mut sorted: Vec<(i32, u64)> = parts.to_vec();
    sorted.sort_by_key(|(n, _)| *n);
    let mut covered = 0u64;
    let mut expected = 1;
    for (number, size) in sorted {
        if number != expected {
            break;
        }
        let wanted = (total - covered).min(part_size);
        if size != wanted {
            break;
        }
        covered += size;
        expected += 1;
    }
    covered
}

/// One uploaded part as reported by `ListParts`.
#[derive(Debug, Clone)]
struct UploadedPart {
    number: i32,
    size: u64,
    e_tag: Option<String>,
}

/// Destination backed by an S3-compatible bucket.
///
/// Uploads use multipart uploads. The upload id is the continuation token and
/// `ListParts` is the authority on how much the bucket holds, so a slice
/// always resumes from the last contiguous part. Slices are rounded up to
/// whole parts.
#[derive(Clone)]
pub struct S3Adapter {
    s3_client: S3Client,
    bucket_name: String,
    root: String,
    chunk_size: u64,
}

impl std::fmt::Debug for S3Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Adapter")
            .field("bucket_name", &self.bucket_name)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl S3Adapter {
    pub fn new(s3_client: S3Client, bucket_name: impl Into<String>, root: impl Into<String>) -> Self {
        Self {
            s3_client,
            bucket_name: bucket_name.into(),
            root: root.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Build a client from the ambient AWS configuration, pointed at the
    /// destination's endpoint when it has one.
    pub async fn from_destination(destination: &StorageDestination) -> Result<Self, StorageError> {
        let bucket = destination.bucket.clone().ok_or_else(|| {
            StorageError::InvalidArgument(format!("destination {} has no bucket", destination.id))
        })?;
        let region = destination
            .region
            .clone()
            .unwrap_or_else(|| "auto".to_string());
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region))
            .load()
            .await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &destination.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let client = S3Client::from_conf(builder.build());
        let adapter = Self::new(client, bucket, destination.root.clone());
        Ok(match destination.chunk_size {
            Some(chunk_size) => adapter.with_chunk_size(chunk_size),
            None => adapter,
        })
    }

    fn key(&self, path: &str) -> Result<String, StorageError> {
        validate_relative(path)?;
        Ok(join_path(&self.root, path))
    }

    /// Listing prefix for a folder: its key plus a trailing slash.
    fn folder_prefix(&self, path: &str) -> Result<String, StorageError> {
        let key = self.key(path)?;
        Ok(if key.is_empty() { key } else { format!("{}/", key) })
    }

    async fn object_size(&self, key: &str) -> Result<Option<u64>, Failure> {
        match self
            .s3_client
            .head_object()
            .bucket(&self.bucket_name)
            .key(key)
            .send()
            .await
        {
            Ok(output) => Ok(Some(output.content_length().unwrap_or(0).max(0) as u64)),
            Err(e) => match classify(&e) {
                Failure::Missing(_) => Ok(None),
                failure => Err(failure),
            },
        }
    }

    /// All keys under `prefix`, following continuation tokens.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .s3_client
                .list_objects_v2()
                .bucket(&self.bucket_name)
                .prefix(prefix);
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }
            let output = request
                .send()
                .await
                .map_err(|e| classify(&e).into_storage())?;

            keys.extend(output.contents().iter().filter_map(|o| o.key().map(String::from)));
            if output.is_truncated().unwrap_or(false) {
                continuation_token = output.next_continuation_token().map(String::from);
            } else {
                break;
            }
        }
        Ok(keys)
    }

    async fn delete_key(&self, key: &str) -> Result<(), StorageError> {
        self.s3_client
            .delete_object()
            .bucket(&self.bucket_name)
            .key(key)
            .send()
            .await
            .map_err(|e| classify(&e).into_storage())?;
        Ok(())
    }

    async fn list_parts(&self, key: &str, upload_id: &str) -> Result<Vec<UploadedPart>, Failure> {
        let mut parts = Vec::new();
        let mut marker: Option<String> = None;

        loop {
            let mut request = self
                .s3_client
                .list_parts()
                .bucket(&self.bucket_name)
                .key(key)
                .upload_id(upload_id);
            if let Some(m) = marker.take() {
                request = request.part_number_marker(m);
            }
            let output = request.send().await.map_err(|e| classify(&e))?;

            parts.extend(output.parts().iter().filter_map(|p| {
                Some(UploadedPart {
                    number: p.part_number()?,
                    size: p.size().unwrap_or(0).max(0) as u64,
                    e_tag: p.e_tag().map(String::from),
                })
            }));
            if output.is_truncated().unwrap_or(false) {
                marker = output.next_part_number_marker().map(String::from);
                if marker.is_none() {
                    break;
                }
            } else {
                break;
            }
        }
        Ok(parts)
    }

    /// Complete the upload and verify the object. `Ok(Some(reason))` means a
    /// transient failure left the upload open.
    async fn finish_upload(
        &self,
        key: &str,
        upload_id: &str,
        total: u64,
        part_size: u64,
    ) -> Result<Option<String>, TransferError> {
        match self.list_parts(key, upload_id).await {
            Ok(mut parts) => {
                let count = total.div_ceil(part_size) as i32;
                parts.retain(|p| p.number >= 1 && p.number <= count);
                parts.sort_by_key(|p| p.number);
                let completed: Vec<CompletedPart> = parts
                    .into_iter()
                    .map(|p| {
                        CompletedPart::builder()
                            .part_number(p.number)
                            .set_e_tag(p.e_tag)
                            .build()
                    })
                    .collect();
                let result = self
                    .s3_client
                    .complete_multipart_upload()
                    .bucket(&self.bucket_name)
                    .key(key)
                    .upload_id(upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(completed))
                            .build(),
                    )
                    .send()
                    .await;
                match result.map_err(|e| classify(&e)) {
                    Ok(_) => debug!("Completed multipart upload of {}", key),
                    Err(Failure::Expired(_)) => {}
                    Err(Failure::Transient(reason)) => return Ok(Some(reason)),
                    Err(failure) => return Err(failure.into_transfer()),
                }
            }
            // Completed by an invocation that died before recording it
            Err(Failure::Expired(_)) => {}
            Err(Failure::Transient(reason)) => return Ok(Some(reason)),
            Err(failure) => return Err(failure.into_transfer()),
        }

        match self.object_size(key).await {
            Ok(Some(size)) if size == total => Ok(None),
            Ok(Some(size)) => Err(TransferError::SizeMismatch {
                expected: total,
                actual: size,
            }),
            Ok(None) => Err(TransferError::SessionExpired(format!(
                "multipart upload of {} vanished before completion",
                key
            ))),
            Err(Failure::Transient(reason)) => Ok(Some(reason)),
            Err(failure) => Err(failure.into_transfer()),
        }
    }

    async fn put_empty(&self, key: &str) -> Result<CopyOutcome, TransferError> {
        let result = self
            .s3_client
            .put_object()
            .bucket(&self.bucket_name)
            .key(key)
            .body(ByteStream::from(Vec::new()))
            .send()
            .await;
        match result.map_err(|e| classify(&e)) {
            Ok(_) => Ok(CopyOutcome {
                bytes: 0,
                complete: true,
                interrupted: None,
            }),
            Err(Failure::Transient(reason)) => Ok(interrupted(0, reason)),
            Err(failure) => Err(failure.into_transfer()),
        }
    }
}

fn interrupted(bytes: u64, reason: String) -> CopyOutcome {
    warn!("S3 transfer interrupted: {}", reason);
    CopyOutcome {
        bytes,
        complete: false,
        interrupted: Some(reason),
    }
}

fn to_chrono(t: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(t.secs(), t.subsec_nanos())
}

#[async_trait]
impl StorageAdapter for S3Adapter {
    fn kind(&self) -> DestinationKind {
        DestinationKind::S3
    }

    #[instrument(skip(self), level = "debug")]
    async fn initialize(&self) -> Result<(), StorageError> {
        self.s3_client
            .head_bucket()
            .bucket(&self.bucket_name)
            .send()
            .await
            .map_err(|e| classify(&e).into_storage())?;
        Ok(())
    }

    async fn is_valid(&self) -> bool {
        self.initialize().await.is_ok()
    }

    #[instrument(skip(self), level = "debug")]
    async fn exists(&self, path: &str) -> Result<bool, StorageError> {
        let key = self.key(path)?;
        if self
            .object_size(&key)
            .await
            .map_err(Failure::into_storage)?
            .is_some()
        {
            return Ok(true);
        }
        // Folders only exist through the keys under them
        let output = self
            .s3_client
            .list_objects_v2()
            .bucket(&self.bucket_name)
            .prefix(self.folder_prefix(path)?)
            .max_keys(1)
            .send()
            .await
            .map_err(|e| classify(&e).into_storage())?;
        Ok(!output.contents().is_empty())
    }

    async fn create_dir(&self, path: &str) -> Result<(), StorageError> {
        // Keys carry their folders
        validate_relative(path)
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, path: &str, recursive: bool) -> Result<bool, StorageError> {
        if segments(path).next().is_none() {
            return Err(StorageError::InvalidArgument(
                "refusing to delete the destination root".to_string(),
            ));
        }
        let key = self.key(path)?;
        if self
            .object_size(&key)
            .await
            .map_err(Failure::into_storage)?
            .is_some()
        {
            self.delete_key(&key).await?;
            debug!("Deleted {}", key);
            return Ok(true);
        }

        let children = self.list_keys(&self.folder_prefix(path)?).await?;
        if children.is_empty() {
            return Ok(false);
        }
        if !recursive {
            return Err(StorageError::InvalidArgument(format!(
                "{} is not empty",
                path
            )));
        }
        for child in &children {
            self.delete_key(child).await?;
        }
        debug!("Deleted {} keys under {}", children.len(), key);
        Ok(true)
    }

    #[instrument(skip(self), level = "debug")]
    async fn move_path(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let source = self.key(from)?;
        let target = self.key(to)?;
        if self.exists(to).await? {
            return Err(StorageError::AlreadyExists(to.to_string()));
        }
        if self
            .object_size(&source)
            .await
            .map_err(Failure::into_storage)?
            .is_none()
        {
            return Err(StorageError::NotFound(from.to_string()));
        }
        self.s3_client
            .copy_object()
            .bucket(&self.bucket_name)
            .key(&target)
            .copy_source(format!(
                "{}/{}",
                self.bucket_name,
                urlencoding::encode(&source)
            ))
            .send()
            .await
            .map_err(|e| classify(&e).into_storage())?;
        self.delete_key(&source).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn scan_dir(&self, path: &str) -> Result<Vec<DirEntry>, StorageError> {
        let prefix = self.folder_prefix(path)?;
        let mut entries = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .s3_client
                .list_objects_v2()
                .bucket(&self.bucket_name)
                .prefix(&prefix)
                .delimiter("/");
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }
            let output = request
                .send()
                .await
                .map_err(|e| classify(&e).into_storage())?;

            for folder in output.common_prefixes() {
                if let Some(name) = folder
                    .prefix()
                    .and_then(|p| p.strip_prefix(prefix.as_str()))
                    .map(|p| p.trim_end_matches('/'))
                    .filter(|p| !p.is_empty())
                {
                    entries.push(DirEntry {
                        name: name.to_string(),
                        is_dir: true,
                        size: 0,
                        modified_at: None,
                    });
                }
            }
            for object in output.contents() {
                if let Some(name) = object
                    .key()
                    .and_then(|k| k.strip_prefix(prefix.as_str()))
                    .filter(|k| !k.is_empty())
                {
                    entries.push(DirEntry {
                        name: name.to_string(),
                        is_dir: false,
                        size: object.size().unwrap_or(0).max(0) as u64,
                        modified_at: object.last_modified().and_then(to_chrono),
                    });
                }
            }

            if output.is_truncated().unwrap_or(false) {
                continuation_token = output.next_continuation_token().map(String::from);
            } else {
                break;
            }
        }

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
        let key = self.key(dest_path)?;
        let mut file = open_source(source, session).await?;

        if total == 0 {
            return self.put_empty(&key).await;
        }

        let part_size = if session.is_fresh() {
            let result = self
                .s3_client
                .create_multipart_upload()
                .bucket(&self.bucket_name)
                .key(&key)
                .send()
                .await;
            let output = match result.map_err(|e| classify(&e)) {
                Ok(output) => output,
                Err(Failure::Transient(reason)) => return Ok(interrupted(0, reason)),
                Err(failure) => return Err(failure.into_transfer()),
            };
            let upload_id = output.upload_id().ok_or_else(|| {
                TransferError::Storage(StorageError::Io(
                    "create_multipart_upload returned no upload id".to_string(),
                ))
            })?;
            let part_size = plan_part_size(total, self.chunk_size);
            session.establish(ContinuationToken::new(upload_id));
            session.set_meta(PART_SIZE_META, part_size.to_string())?;
            session.set_meta(OBJECT_KEY_META, key.clone())?;
            debug!("Started multipart upload {} for {}", upload_id, key);
            part_size
        } else {
            let part_size = session
                .meta(PART_SIZE_META)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or_else(|| plan_part_size(total, self.chunk_size));
            let upload_id = session
                .token
                .as_ref()
                .map(|t| t.handle.clone())
                .unwrap_or_default();
            match self.list_parts(&key, &upload_id).await {
                Ok(parts) => {
                    let listed: Vec<(i32, u64)> = parts.iter().map(|p| (p.number, p.size)).collect();
                    session.resync(contiguous_bytes(&listed, part_size, total));
                }
                Err(Failure::Expired(reason)) => match self.object_size(&key).await {
                    Ok(Some(size)) if size == total => session.resync(total),
                    _ => return Err(TransferError::SessionExpired(reason)),
                },
                Err(Failure::Transient(reason)) => return Ok(interrupted(0, reason)),
                Err(failure) => return Err(failure.into_transfer()),
            }
            if session.bytes_transferred != offset {
                debug!(
                    "Upload of {} resumes at {} instead of {}",
                    key, session.bytes_transferred, offset
                );
            }
            part_size
        };

        let upload_id = session
            .token
            .as_ref()
            .map(|t| t.handle.clone())
            .unwrap_or_default();
        let start = session.bytes_transferred;
        let end = window_end(start, length, total);

        while session.bytes_transferred < end {
            let position = session.bytes_transferred;
            let part_number = (position / part_size) as i32 + 1;
            let n = (total - position).min(part_size);
            let data = read_chunk(&mut file, position, n as usize).await?;
            let result = self
                .s3_client
                .upload_part()
                .bucket(&self.bucket_name)
                .key(&key)
                .upload_id(&upload_id)
                .part_number(part_number)
                .body(ByteStream::from(data))
                .send()
                .await;
            match result.map_err(|e| classify(&e)) {
                Ok(_) => {
                    session.advance(n);
                    debug!("Uploaded part {} ({} bytes) of {}", part_number, n, key);
                }
                Err(Failure::Transient(reason)) => {
                    return Ok(interrupted(session.bytes_transferred - start, reason))
                }
                Err(failure) => return Err(failure.into_transfer()),
            }
            if budget.should_stop() {
                break;
            }
        }

        let bytes = session.bytes_transferred.saturating_sub(start);
        if !session.is_complete() {
            return Ok(CopyOutcome {
                bytes,
                complete: false,
                interrupted: None,
            });
        }
        match self.finish_upload(&key, &upload_id, total, part_size).await? {
            None => Ok(CopyOutcome {
                bytes,
                complete: true,
                interrupted: None,
            }),
            Some(reason) => Ok(interrupted(bytes, reason)),
        }
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
        let key = self.key(dest_path)?;
        let partial = PartialTarget::new(target);
        let start = partial.prepare(session).await?;
        if start != offset {
            debug!("Download of {} resumes at {} instead of {}", dest_path, start, offset);
        }
        let end = window_end(start, length, total);

        let mut position = start;
        while position < end {
            let n = (end - position).min(self.chunk_size);
            let result = self
                .s3_client
                .get_object()
                .bucket(&self.bucket_name)
                .key(&key)
                .range(format!("bytes={}-{}", position, position + n - 1))
                .send()
                .await;
            let output = match result.map_err(|e| classify(&e)) {
                Ok(output) => output,
                Err(Failure::Transient(reason)) => {
                    return Ok(interrupted(position - start, reason))
                }
                Err(failure) => return Err(failure.into_transfer()),
            };
            let body = match output.body.collect().await {
                Ok(data) => data.into_bytes(),
                Err(e) => return Ok(interrupted(position - start, format!("download body: {}", e))),
            };
            if body.is_empty() {
                return Err(TransferError::SizeMismatch {
                    expected: total,
                    actual: position,
                });
            }
            partial.append(&body).await?;
            position += body.len() as u64;
            session.advance(body.len() as u64);

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
        if Path::new(&token.handle).is_absolute() {
            // Download sessions point at a local partial file
            return PartialTarget::remove(&token.handle).await;
        }
        let Some(key) = session.meta(OBJECT_KEY_META) else {
            warn!("Upload {} has no recorded key, cannot abort", token.handle);
            return Ok(());
        };
        let result = self
            .s3_client
            .abort_multipart_upload()
            .bucket(&self.bucket_name)
            .key(key)
            .upload_id(&token.handle)
            .send()
            .await;
        match result.map_err(|e| classify(&e)) {
            Ok(_) => {
                debug!("Aborted multipart upload {}", token.handle);
                Ok(())
            }
            Err(Failure::Expired(_)) | Err(Failure::Missing(_)) => Ok(()),
            Err(failure) => Err(failure.into_storage()),
        }
    }
}
