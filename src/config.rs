use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

use crate::segment::SegmentConfig;
use crate::upload::UploadConfig;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub upload: UploadConfig,
    pub segments: SegmentConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "matchcast".to_string(),
            http: HttpConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
    /// Largest request body accepted (chunks and segments)
    pub max_body_bytes: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8787,
            max_body_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Where the upload server keeps its files
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Received chunks, one directory per upload
    pub upload_dir: PathBuf,
    /// Assembled files
    pub output_dir: PathBuf,
    /// Live recording segments, one directory per recording
    pub segment_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: PathBuf::from(".matchcast/server/chunks"),
            output_dir: PathBuf::from(".matchcast/server/files"),
            segment_dir: PathBuf::from(".matchcast/server/segments"),
        }
    }
}

impl Config {
    /// Load `path` (any extension the `config` crate understands, optional)
    /// with `MATCHCAST__SECTION__KEY` environment overrides on top.
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("MATCHCAST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to read configuration from {}", path))?;

        let config: Config = settings
            .try_deserialize()
            .context("Invalid configuration")?;
        config.segments.validate()?;

        Ok(config)
    }
}
