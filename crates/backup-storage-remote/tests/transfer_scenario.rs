//! End-to-end resumable upload against an HTTP upload service that loses
//! part of what it acknowledged.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use backup_core::{
    AdapterFactory, AdvanceOutcome, Artifact, ArtifactBuilder, BackupJob, BuildError,
    BuildProgress, DestinationKind, Engine, EngineSettings, JobPhase, JobSnapshot, JobStore,
    MemoryStateStore, RecordLock, ScanProgress, SessionKey, SessionStore, StorageAdapter,
    StorageDestination, StorageError,
};
use backup_storage_remote::HttpSessionAdapter;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const MIB: u64 = 1024 * 1024;

#[derive(Default)]
struct Upload {
    data: Vec<u8>,
    /// Offset at which the service "forgets" the last MiB once
    forget_at: Option<u64>,
}

/// Upload-session endpoint keeping the received bytes in memory.
#[derive(Clone)]
struct UploadService {
    upload: Arc<Mutex<Upload>>,
}

fn received(len: u64, total: u64) -> ResponseTemplate {
    if len == total {
        return ResponseTemplate::new(201).set_body_json(serde_json::json!({ "size": total }));
    }
    let template = ResponseTemplate::new(308);
    if len == 0 {
        template
    } else {
        template.insert_header("Range", format!("bytes=0-{}", len - 1))
    }
}

impl Respond for UploadService {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let range = request
            .headers
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .trim_start_matches("bytes ")
            .to_string();
        let (span, total) = range.split_once('/').unwrap();
        let total: u64 = total.parse().unwrap();
        let mut upload = self.upload.lock().unwrap();

        if span == "*" {
            return received(upload.data.len() as u64, total);
        }
        let start: u64 = span.split_once('-').unwrap().0.parse().unwrap();
        if upload.forget_at == Some(start) {
            upload.forget_at = None;
            upload.data.truncate((start - MIB) as usize);
            return ResponseTemplate::new(416);
        }
        if start != upload.data.len() as u64 {
            return ResponseTemplate::new(416);
        }
        upload.data.extend_from_slice(&request.body);
        received(upload.data.len() as u64, total)
    }
}

/// Builder whose artifact already exists on disk.
struct ReadyArtifact(Artifact);

#[async_trait]
impl ArtifactBuilder for ReadyArtifact {
    async fn scan(&self, _job: &BackupJob, _budget: Duration) -> Result<ScanProgress, BuildError> {
        Ok(ScanProgress::Done)
    }

    async fn build(&self, _job: &BackupJob, _budget: Duration) -> Result<BuildProgress, BuildError> {
        Ok(BuildProgress::Materialized(self.0.clone()))
    }
}

struct HttpFactory;

#[async_trait]
impl AdapterFactory for HttpFactory {
    async fn adapter_for(
        &self,
        destination: &StorageDestination,
    ) -> Result<Arc<dyn StorageAdapter>, StorageError> {
        Ok(Arc::new(HttpSessionAdapter::from_destination(destination)?))
    }
}

async fn advance(engine: &Engine, job_id: &str) -> JobSnapshot {
    match engine.advance(job_id, Duration::from_secs(60)).await.unwrap() {
        AdvanceOutcome::Advanced { snapshot, .. } => snapshot,
        AdvanceOutcome::Busy => panic!("nothing else holds the lock"),
    }
}

#[tokio::test]
async fn test_resumes_across_invocations_after_range_loss() {
    let server = MockServer::start().await;
    let service = UploadService {
        upload: Arc::new(Mutex::new(Upload {
            data: vec![],
            forget_at: Some(6 * MIB),
        })),
    };
    Mock::given(method("PUT"))
        .and(path("/dirs/backups"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/uploads"))
        .respond_with(ResponseTemplate::new(201).insert_header("Location", "/uploads/s1"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/uploads/s1"))
        .respond_with(service.clone())
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let content: Vec<u8> = (0..10 * MIB).map(|i| (i % 253) as u8).collect();
    let artifact_path = temp.path().join("site-20261015-120000.bundle");
    std::fs::write(&artifact_path, &content).unwrap();
    let artifact = Artifact {
        file_name: "site-20261015-120000.bundle".to_string(),
        path: artifact_path,
        size: 10 * MIB,
        sha256: None,
    };

    let store = Arc::new(MemoryStateStore::new());
    let mut destination = StorageDestination::new("remote", DestinationKind::Http, "");
    destination.endpoint = Some(server.uri());
    destination.folder = Some("backups".to_string());
    destination.chunk_size = Some(MIB);
    store.save_destination(&destination).await.unwrap();

    let engine = Engine::new(
        store.clone(),
        store.clone(),
        Arc::new(RecordLock::new(store.clone())),
        Arc::new(HttpFactory),
        Arc::new(ReadyArtifact(artifact.clone())),
    )
    .with_settings(EngineSettings {
        slice_bytes: Some(3 * MIB),
        ..EngineSettings::default()
    });

    let job_id = engine
        .create_job("site", "/srv/site", &["remote".to_string()])
        .await
        .unwrap()
        .job_id;

    let mut snapshot = advance(&engine, &job_id).await;
    while snapshot.phase != JobPhase::TransferringStorages {
        snapshot = advance(&engine, &job_id).await;
    }

    let key = SessionKey::new(&job_id, "remote", &artifact.file_name);
    let mut transfers = 0;
    while snapshot.phase == JobPhase::TransferringStorages {
        snapshot = advance(&engine, &job_id).await;
        transfers += 1;
        match transfers {
            1 => assert_eq!(snapshot.destinations[0].bytes_transferred, 3 * MIB),
            2 => assert_eq!(snapshot.destinations[0].bytes_transferred, 6 * MIB),
            3 => {
                let session = store.load_session(&key).await.unwrap().unwrap();
                assert_eq!(session.resync_count, 1);
                // Three chunks from the 5 MiB the service still holds
                assert_eq!(session.bytes_transferred, 8 * MIB);
            }
            _ => {}
        }
        assert!(transfers <= 4, "took more than four invocations");
    }

    assert_eq!(transfers, 4);
    assert_eq!(snapshot.phase, JobPhase::Complete);
    assert_eq!(snapshot.destinations[0].bytes_transferred, 10 * MIB);
    assert_eq!(snapshot.destinations[0].retry_count, 0);
    assert!(store.load_session(&key).await.unwrap().is_none());
    assert_eq!(service.upload.lock().unwrap().data, content);
}
