use std::sync::Arc;

use async_trait::async_trait;
use backup_core::{AdapterFactory, DestinationKind, StorageAdapter, StorageDestination, StorageError};
use backup_storage_local::LocalAdapter;
use backup_storage_remote::{HttpSessionAdapter, S3Adapter};
use tracing::debug;

/// Maps each destination kind to its adapter.
#[derive(Debug, Default)]
pub struct DefaultAdapterFactory;

#[async_trait]
impl AdapterFactory for DefaultAdapterFactory {
    async fn adapter_for(
        &self,
        destination: &StorageDestination,
    ) -> Result<Arc<dyn StorageAdapter>, StorageError> {
        debug!("Creating {} adapter for {}", destination.kind, destination.id);
        Ok(match destination.kind {
            DestinationKind::Local => Arc::new(LocalAdapter::from_destination(destination)),
            DestinationKind::S3 => Arc::new(S3Adapter::from_destination(destination).await?),
            DestinationKind::Http => Arc::new(HttpSessionAdapter::from_destination(destination)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_destination() {
        let destination = StorageDestination::new("nas", DestinationKind::Local, "/mnt/nas");
        let adapter = DefaultAdapterFactory.adapter_for(&destination).await.unwrap();
        assert_eq!(adapter.kind(), DestinationKind::Local);
    }

    #[tokio::test]
    async fn test_incomplete_remote_destinations() {
        let http = StorageDestination::new("svc", DestinationKind::Http, "");
        assert!(matches!(
            DefaultAdapterFactory.adapter_for(&http).await,
            Err(StorageError::InvalidArgument(_))
        ));

        let s3 = StorageDestination::new("bucket", DestinationKind::S3, "");
        assert!(matches!(
            DefaultAdapterFactory.adapter_for(&s3).await,
            Err(StorageError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_http_token_comes_from_environment() {
        let mut destination = StorageDestination::new("svc", DestinationKind::Http, "");
        destination.endpoint = Some("http://127.0.0.1:9".to_string());
        destination.token_env = Some("BACKUPCTL_TEST_TOKEN_UNSET".to_string());
        assert!(DefaultAdapterFactory.adapter_for(&destination).await.is_err());
    }
}
