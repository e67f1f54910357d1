use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::config::StorageConfig;

/// On-disk layout of the upload server
///
/// ```text
/// upload_dir/<upload_id>/<index>.part
/// output_dir/<upload_id>-<filename>
/// segment_dir/<recording_id>/<segment_id>.bin
/// ```
#[derive(Debug, Clone)]
pub struct ServerStorage {
    config: StorageConfig,
}

impl ServerStorage {
    pub async fn open(config: StorageConfig) -> Result<Self> {
        for dir in [&config.upload_dir, &config.output_dir, &config.segment_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create storage directory: {:?}", dir))?;
        }
        Ok(Self { config })
    }

    pub fn output_dir(&self) -> &Path {
        &self.config.output_dir
    }

    pub fn segment_dir(&self) -> &Path {
        &self.config.segment_dir
    }

    fn chunk_dir(&self, upload_id: &str) -> PathBuf {
        self.config.upload_dir.join(upload_id)
    }

    /// Store one chunk. Writing the same index twice replaces it.
    pub async fn write_chunk(&self, upload_id: &str, index: usize, data: &[u8]) -> Result<()> {
        let dir = self.chunk_dir(upload_id);
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join(format!("{:06}.part", index));
        let tmp_path = dir.join(format!("{:06}.part.tmp", index));
        tokio::fs::write(&tmp_path, data)
            .await
            .with_context(|| format!("Failed to write chunk {:?}", tmp_path))?;
        tokio::fs::rename(&tmp_path, &path).await?;

        debug!("Stored chunk {} of {} ({} bytes)", index, upload_id, data.len());
        Ok(())
    }

    /// Indices already on disk for an upload (survives server restarts)
    pub async fn stored_chunks(&self, upload_id: &str) -> Result<BTreeSet<usize>> {
        let dir = self.chunk_dir(upload_id);
        let mut indices = BTreeSet::new();

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(indices),
            Err(e) => return Err(e).with_context(|| format!("Failed to list {:?}", dir)),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".part")) else {
                continue;
            };
            if let Ok(index) = stem.parse::<usize>() {
                indices.insert(index);
            }
        }

        Ok(indices)
    }

    /// Concatenate chunks `0..total_chunks` into the output file.
    ///
    /// Returns the file name inside `output_dir` and its size.
    pub async fn assemble(
        &self,
        upload_id: &str,
        filename: &str,
        total_chunks: usize,
    ) -> Result<(String, u64)> {
        let output_name = format!("{}-{}", upload_id, sanitize_filename(filename));
        let output_path = self.config.output_dir.join(&output_name);
        let dir = self.chunk_dir(upload_id);

        let mut output = tokio::fs::File::create(&output_path)
            .await
            .with_context(|| format!("Failed to create {:?}", output_path))?;
        let mut size = 0u64;

        for index in 0..total_chunks {
            let part = dir.join(format!("{:06}.part", index));
            let data = tokio::fs::read(&part)
                .await
                .with_context(|| format!("Missing chunk {:?}", part))?;
            output.write_all(&data).await?;
            size += data.len() as u64;
        }
        output.flush().await?;

        info!(
            "Assembled upload {} into {:?} ({} chunks, {} bytes)",
            upload_id, output_path, total_chunks, size
        );
        Ok((output_name, size))
    }

    pub async fn remove_file(&self, name: &str) -> Result<()> {
        tokio::fs::remove_file(self.config.output_dir.join(name)).await?;
        Ok(())
    }

    pub async fn remove_chunks(&self, upload_id: &str) -> Result<()> {
        let dir = self.chunk_dir(upload_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {:?}", dir)),
        }
    }

    /// Store a live segment; returns its path relative to `segment_dir`
    pub async fn write_segment(
        &self,
        recording_id: &str,
        segment_id: &str,
        data: &[u8],
    ) -> Result<String> {
        let dir = self.config.segment_dir.join(recording_id);
        tokio::fs::create_dir_all(&dir).await?;

        let name = format!("{}.bin", segment_id);
        tokio::fs::write(dir.join(&name), data)
            .await
            .with_context(|| format!("Failed to write segment {}", segment_id))?;

        Ok(format!("{}/{}", recording_id, name))
    }
}

/// Identifiers become path components, so only a conservative alphabet is accepted
pub fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn sanitize_filename(filename: &str) -> String {
    let name = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload");

    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.trim_matches('.').is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}
