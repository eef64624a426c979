//! Object-store and blob-store collaborators.
//!
//! The original relies on a shared object-store client for listing,
//! size-probing, downloading, and reading upstream build archives, plus a
//! separate key/value blob store for custom binaries addressed by opaque
//! key. Both are modeled here as `async_trait`s with a local-filesystem
//! implementation (sufficient for tests and single-machine use) and an
//! `aws-sdk-s3`-backed implementation gated behind the `upload` feature,
//! mirroring how this corpus gates its own S3-backed artifact store behind a
//! feature flag.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use provisioner_schema::ProvisionError;

/// Metadata about one listed object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Fully qualified object URL.
    pub url: String,
    /// Size in bytes.
    pub size: u64,
    /// Last-modified time, UTC-normalized.
    pub updated: DateTime<Utc>,
}

/// The upstream object-store contract: listing, size probing, copying, and
/// reading raw bytes. Implemented concretely against the local filesystem
/// for tests and against S3-compatible storage for real deployments.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List objects whose key starts with `prefix`.
    async fn list_blobs(&self, prefix: &str) -> Result<Vec<ObjectMeta>, ProvisionError>;

    /// Size in bytes of the object at `url`.
    async fn get_object_size(&self, url: &str) -> Result<u64, ProvisionError>;

    /// Download the object at `url` to `local_path`.
    async fn copy_file_from(&self, url: &str, local_path: &Path) -> Result<(), ProvisionError>;

    /// Last-modified time of the object at `url`.
    async fn updated(&self, url: &str) -> Result<DateTime<Utc>, ProvisionError>;

    /// Read the full contents of the object at `url`.
    async fn read_data(&self, url: &str) -> Result<Vec<u8>, ProvisionError>;

    /// Split a fully qualified object URL into its bucket name and object path.
    fn get_bucket_name_and_path(&self, url: &str) -> Result<(String, String), ProvisionError>;
}

/// The blob-store contract used for custom binaries addressed by an opaque
/// key rather than a bucket-relative path.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Fetch the blob identified by `key` to `local_path`, returning whether
    /// it was found.
    async fn read_blob_to_disk(&self, key: &str, local_path: &Path) -> Result<bool, ProvisionError>;
}

/// A local-filesystem-backed [`ObjectStore`], used for tests and for
/// single-machine deployments where "remote" archives already live on disk.
/// URLs are plain filesystem paths, optionally prefixed with `file://`.
#[derive(Debug, Clone, Default)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    /// Build a store rooted at `root`; all URLs are resolved relative to it.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, url: &str) -> PathBuf {
        let stripped = url.strip_prefix("file://").unwrap_or(url);
        let path = Path::new(stripped);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn list_blobs(&self, prefix: &str) -> Result<Vec<ObjectMeta>, ProvisionError> {
        let dir = self.resolve(prefix);
        let dir = if dir.is_dir() { dir } else { dir.parent().map(Path::to_path_buf).unwrap_or(dir) };
        let root = self.root.clone();

        tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            if !dir.is_dir() {
                return Ok(out);
            }
            for entry in walkdir::WalkDir::new(&dir).into_iter().filter_map(Result::ok) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let meta = entry.metadata().map_err(|e| {
                    ProvisionError::Transport(format!("failed to stat {}: {e}", entry.path().display()))
                })?;
                let modified: DateTime<Utc> = meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now());
                let relative = entry.path().strip_prefix(&root).unwrap_or(entry.path());
                out.push(ObjectMeta {
                    url: relative.to_string_lossy().replace('\\', "/"),
                    size: meta.len(),
                    updated: modified,
                });
            }
            Ok(out)
        })
        .await
        .map_err(|e| ProvisionError::Transport(format!("listing task panicked: {e}")))?
    }

    async fn get_object_size(&self, url: &str) -> Result<u64, ProvisionError> {
        let path = self.resolve(url);
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| ProvisionError::Transport(format!("stat {}: {e}", path.display())))?;
        Ok(meta.len())
    }

    async fn copy_file_from(&self, url: &str, local_path: &Path) -> Result<(), ProvisionError> {
        let path = self.resolve(url);
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(ProvisionError::Io)?;
        }
        tokio::fs::copy(&path, local_path)
            .await
            .map_err(|e| ProvisionError::Transport(format!("copy {} -> {}: {e}", path.display(), local_path.display())))?;
        Ok(())
    }

    async fn updated(&self, url: &str) -> Result<DateTime<Utc>, ProvisionError> {
        let path = self.resolve(url);
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| ProvisionError::Transport(format!("stat {}: {e}", path.display())))?;
        Ok(meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now()))
    }

    async fn read_data(&self, url: &str) -> Result<Vec<u8>, ProvisionError> {
        let path = self.resolve(url);
        tokio::fs::read(&path)
            .await
            .map_err(|e| ProvisionError::Transport(format!("read {}: {e}", path.display())))
    }

    fn get_bucket_name_and_path(&self, url: &str) -> Result<(String, String), ProvisionError> {
        let stripped = url.strip_prefix("file://").unwrap_or(url);
        let mut parts = stripped.splitn(2, '/');
        let bucket = parts.next().unwrap_or_default().to_string();
        let path = parts.next().unwrap_or_default().to_string();
        Ok((bucket, path))
    }
}

/// A local-filesystem-backed [`BlobStore`]: blobs are files named by key
/// under a root directory.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    /// Build a blob store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn read_blob_to_disk(&self, key: &str, local_path: &Path) -> Result<bool, ProvisionError> {
        let blob_path = self.root.join(key);
        if !tokio::fs::try_exists(&blob_path).await.unwrap_or(false) {
            return Ok(false);
        }
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(ProvisionError::Io)?;
        }
        tokio::fs::copy(&blob_path, local_path)
            .await
            .map_err(|e| ProvisionError::Transport(format!("blob copy {key}: {e}")))?;
        Ok(true)
    }
}

/// S3-compatible [`ObjectStore`], gated behind the `upload` feature. Mirrors
/// the teacher crate's R2-compatible artifact store: credentials and region
/// are supplied by the caller rather than discovered, and every call maps
/// `aws-sdk-s3` errors onto [`ProvisionError::Transport`].
#[cfg(feature = "upload")]
pub mod s3 {
    use super::{ObjectMeta, ObjectStore, ProvisionError};
    use async_trait::async_trait;
    use aws_sdk_s3 as s3_sdk;
    use chrono::{DateTime, Utc};
    use std::path::Path;

    /// An [`ObjectStore`] backed by a real S3-compatible bucket.
    #[derive(Debug, Clone)]
    pub struct S3ObjectStore {
        client: s3_sdk::Client,
        bucket: String,
    }

    impl S3ObjectStore {
        /// Wrap an already-configured `aws-sdk-s3` client pointed at `bucket`.
        pub fn new(client: s3_sdk::Client, bucket: impl Into<String>) -> Self {
            Self { client, bucket: bucket.into() }
        }

        fn key_of<'a>(&self, url: &'a str) -> &'a str {
            url.strip_prefix(&format!("s3://{}/", self.bucket)).unwrap_or(url)
        }
    }

    #[async_trait]
    impl ObjectStore for S3ObjectStore {
        async fn list_blobs(&self, prefix: &str) -> Result<Vec<ObjectMeta>, ProvisionError> {
            let mut out = Vec::new();
            let mut continuation = None;
            loop {
                let mut req = self.client.list_objects_v2().bucket(&self.bucket).prefix(prefix);
                if let Some(token) = continuation.take() {
                    req = req.continuation_token(token);
                }
                let resp = req
                    .send()
                    .await
                    .map_err(|e| ProvisionError::Transport(format!("list_objects_v2 {prefix}: {e}")))?;

                for obj in resp.contents() {
                    let Some(key) = obj.key() else { continue };
                    let updated = obj
                        .last_modified()
                        .and_then(|t| DateTime::from_timestamp(t.secs(), 0))
                        .unwrap_or_else(Utc::now);
                    out.push(ObjectMeta {
                        url: format!("s3://{}/{key}", self.bucket),
                        size: obj.size().unwrap_or(0).max(0) as u64,
                        updated,
                    });
                }

                if resp.is_truncated() == Some(true) {
                    continuation = resp.next_continuation_token().map(str::to_string);
                } else {
                    break;
                }
            }
            Ok(out)
        }

        async fn get_object_size(&self, url: &str) -> Result<u64, ProvisionError> {
            let key = self.key_of(url).to_string();
            let resp = self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| ProvisionError::Transport(format!("head_object {key}: {e}")))?;
            Ok(resp.content_length().unwrap_or(0).max(0) as u64)
        }

        async fn copy_file_from(&self, url: &str, local_path: &Path) -> Result<(), ProvisionError> {
            let key = self.key_of(url).to_string();
            let resp = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| ProvisionError::Transport(format!("get_object {key}: {e}")))?;

            let bytes = resp
                .body
                .collect()
                .await
                .map_err(|e| ProvisionError::Transport(format!("read body {key}: {e}")))?;

            if let Some(parent) = local_path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(ProvisionError::Io)?;
            }
            tokio::fs::write(local_path, bytes.into_bytes()).await.map_err(ProvisionError::Io)
        }

        async fn updated(&self, url: &str) -> Result<DateTime<Utc>, ProvisionError> {
            let key = self.key_of(url).to_string();
            let resp = self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| ProvisionError::Transport(format!("head_object {key}: {e}")))?;
            Ok(resp
                .last_modified()
                .and_then(|t| DateTime::from_timestamp(t.secs(), 0))
                .unwrap_or_else(Utc::now))
        }

        async fn read_data(&self, url: &str) -> Result<Vec<u8>, ProvisionError> {
            let key = self.key_of(url).to_string();
            let resp = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| ProvisionError::Transport(format!("get_object {key}: {e}")))?;
            let bytes = resp
                .body
                .collect()
                .await
                .map_err(|e| ProvisionError::Transport(format!("read body {key}: {e}")))?;
            Ok(bytes.to_vec())
        }

        fn get_bucket_name_and_path(&self, url: &str) -> Result<(String, String), ProvisionError> {
            Ok((self.bucket.clone(), self.key_of(url).to_string()))
        }
    }
}
