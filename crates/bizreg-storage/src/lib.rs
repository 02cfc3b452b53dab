//! Raw artifact storage, keyed CSV tables and the retrying HTTP fetcher.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

mod http;
mod table;

pub use http::{
    FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, RateLimit, RateLimiter,
    RetryPolicy,
};
pub use table::{DetailRow, KeyedTable, ListingRow, RecordRow, TableError, TableRow, UpsertStats};

pub const CRATE_NAME: &str = "bizreg-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed store for raw response bodies, one directory per run stamp and stage.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn relative_path_for(
        fetched_at: DateTime<Utc>,
        stage: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = match extension.trim().trim_start_matches('.') {
            "" => "bin",
            ext => ext,
        };
        PathBuf::from(fetched_at.format("%Y%m%d_%H%M%S").to_string())
            .join(stage)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Writes `bytes` under its hash path. An existing file at that path is left
    /// untouched and reported as deduplicated.
    pub async fn store(
        &self,
        fetched_at: DateTime<Utc>,
        stage: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::relative_path_for(fetched_at, stage, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let dir = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        let mut artifact = StoredArtifact {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: true,
        };

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating artifact directory {}", dir.display()))?;

        if fs::try_exists(&artifact.absolute_path)
            .await
            .with_context(|| format!("checking artifact path {}", artifact.absolute_path.display()))?
        {
            debug!(path = %artifact.relative_path.display(), "artifact already stored");
            return Ok(artifact);
        }

        let temp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));
        let write_result = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(bytes).await?;
            file.flush().await?;
            fs::rename(&temp_path, &artifact.absolute_path).await
        }
        .await;

        match write_result {
            Ok(()) => {
                artifact.deduplicated = false;
                Ok(artifact)
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                if err.kind() == std::io::ErrorKind::AlreadyExists {
                    return Ok(artifact);
                }
                Err(err).with_context(|| {
                    format!("writing artifact {}", artifact.absolute_path.display())
                })
            }
        }
    }
}
