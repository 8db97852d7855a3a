use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::path::join_path;

/// Closed set of destination types. Each kind is bound to one adapter implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    Local,
    S3,
    Http,
}

impl DestinationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DestinationKind::Local => "local",
            DestinationKind::S3 => "s3",
            DestinationKind::Http => "http",
        }
    }
}

impl fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DestinationKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(DestinationKind::Local),
            "s3" => Ok(DestinationKind::S3),
            "http" => Ok(DestinationKind::Http),
            other => Err(StorageError::InvalidArgument(format!(
                "unknown destination kind: {}",
                other
            ))),
        }
    }
}

/// A configured storage target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDestination {
    pub id: String,
    pub kind: DestinationKind,
    /// Root of the destination: a directory, a key prefix or a remote path prefix
    #[serde(default)]
    pub root: String,
    /// Sub-folder under the root where artifacts are placed
    #[serde(default)]
    pub folder: Option<String>,
    /// Service endpoint (S3-compatible URL or HTTP upload service)
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    /// Name of the environment variable holding the bearer token
    #[serde(default)]
    pub token_env: Option<String>,
    /// Keep only the N most recent artifacts of a job name
    #[serde(default)]
    pub keep_recent: Option<u32>,
    /// Chunk size override in bytes
    #[serde(default)]
    pub chunk_size: Option<u64>,
}

impl StorageDestination {
    pub fn new(id: impl Into<String>, kind: DestinationKind, root: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            root: root.into(),
            folder: None,
            endpoint: None,
            bucket: None,
            region: None,
            token_env: None,
            keep_recent: None,
            chunk_size: None,
        }
    }

    /// Folder (relative to the adapter root) that holds the artifacts.
    pub fn artifact_folder(&self) -> &str {
        self.folder.as_deref().unwrap_or("")
    }

    /// Path of an artifact relative to the adapter root.
    pub fn remote_path(&self, file_name: &str) -> String {
        join_path(self.artifact_folder(), file_name)
    }
}
