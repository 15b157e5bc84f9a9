//! Durable blob storage for snapshots and encoded track groups.
//!
//! The production backend is S3; a local-directory backend serves tests and
//! development. Snapshots are zstd-compressed (level 3); dated archives are
//! swept after a retention window by parsing the date out of the file name.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use chrono::NaiveDate;
use tracing::{info, warn};

// Level 3 trades well between ratio and CPU for snapshot-sized payloads.
const ZSTD_LEVEL: i32 = 3;

#[async_trait]
pub trait BlobStorage: Send + Sync {
    async fn save(&self, path: &str, bytes: &[u8]) -> Result<()>;
    async fn load(&self, path: &str) -> Result<Vec<u8>>;
    /// Paths under `prefix`, relative to the store root.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
    async fn delete(&self, path: &str) -> Result<()>;
}

pub struct S3Storage {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Storage {
    pub async fn new(bucket: impl Into<String>) -> Self {
        let config = aws_config::load_from_env().await;
        Self {
            client: aws_sdk_s3::Client::new(&config),
            bucket: bucket.into(),
        }
    }
}

#[async_trait]
impl BlobStorage for S3Storage {
    async fn save(&self, path: &str, bytes: &[u8]) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(path)
            .body(ByteStream::from(bytes.to_vec()))
            .send()
            .await
            .with_context(|| format!("failed to save s3://{}/{path}", self.bucket))?;
        Ok(())
    }

    async fn load(&self, path: &str) -> Result<Vec<u8>> {
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .with_context(|| format!("failed to load s3://{}/{path}", self.bucket))?;
        let bytes = object
            .body
            .collect()
            .await
            .context("failed to read object body")?
            .into_bytes();
        Ok(bytes.to_vec())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .send()
            .await
            .with_context(|| format!("failed to list s3://{}/{prefix}", self.bucket))?;
        Ok(output
            .contents()
            .iter()
            .filter_map(|object| object.key().map(str::to_string))
            .collect())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .with_context(|| format!("failed to delete s3://{}/{path}", self.bucket))?;
        Ok(())
    }
}

/// Directory-backed store with the same path semantics as S3 keys.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn collect_files(dir: &Path, root: &Path, out: &mut Vec<String>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                Self::collect_files(&path, root, out);
            } else if let Ok(relative) = path.strip_prefix(root) {
                out.push(relative.to_string_lossy().replace('\\', "/"));
            }
        }
    }
}

#[async_trait]
impl BlobStorage for LocalStorage {
    async fn save(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let full = self.full_path(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {parent:?}"))?;
        }
        tokio::fs::write(&full, bytes)
            .await
            .with_context(|| format!("failed to write {full:?}"))
    }

    async fn load(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.full_path(path);
        tokio::fs::read(&full)
            .await
            .with_context(|| format!("failed to read {full:?}"))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut out = Vec::new();
        Self::collect_files(&self.root, &self.root, &mut out);
        out.retain(|p| p.starts_with(prefix));
        out.sort();
        Ok(out)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full = self.full_path(path);
        tokio::fs::remove_file(&full)
            .await
            .with_context(|| format!("failed to delete {full:?}"))
    }
}

pub async fn save_compressed(storage: &dyn BlobStorage, path: &str, bytes: &[u8]) -> Result<()> {
    let compressed = zstd::encode_all(bytes, ZSTD_LEVEL).context("zstd compression failed")?;
    storage.save(path, &compressed).await
}

pub async fn load_compressed(storage: &dyn BlobStorage, path: &str) -> Result<Vec<u8>> {
    let compressed = storage.load(path).await?;
    zstd::decode_all(compressed.as_slice()).context("zstd decompression failed")
}

/// Date encoded in an archive path like `archive/2023-11-14.snap.zst`.
fn archive_date(path: &str) -> Option<NaiveDate> {
    let stem = Path::new(path).file_name()?.to_str()?.split('.').next()?;
    NaiveDate::parse_from_str(stem, "%Y-%m-%d").ok()
}

/// Deletes dated archives older than `retention_days`. Failures are logged
/// and do not interrupt the sweep.
pub async fn sweep_archives(
    storage: &dyn BlobStorage,
    prefix: &str,
    today: NaiveDate,
    retention_days: i64,
) -> Result<usize> {
    let cutoff = today - chrono::Duration::days(retention_days);
    let mut deleted = 0usize;
    for path in storage.list(prefix).await? {
        let Some(date) = archive_date(&path) else {
            warn!("unparsable archive name, skipping: {path}");
            continue;
        };
        if date < cutoff {
            match storage.delete(&path).await {
                Ok(()) => {
                    info!("swept expired archive {path}");
                    deleted += 1;
                }
                Err(error) => warn!("failed to sweep {path}: {error:#}"),
            }
        }
    }
    Ok(deleted)
}
