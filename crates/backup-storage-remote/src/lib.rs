//! Remote destinations: S3-compatible buckets through multipart uploads and
//! HTTP services through resumable upload sessions.

pub mod http;
pub mod s3;
mod sink;

pub use http::HttpSessionAdapter;
pub use s3::S3Adapter;
