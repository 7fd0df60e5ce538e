//! Image metadata pipeline: a two-activity sequential workflow that extracts
//! metadata from an image and persists it to a sink.
//!
//! Error strings use stable prefixes so workflow code and tests can classify
//! failures: "not found:", "decode error:", "sink write error:".
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::runtime::registry::{ActivityRegistryBuilder, WorkflowRegistryBuilder};
use crate::WorkflowContext;

pub const ACTIVITY_EXTRACT: &str = "ExtractMetadata";
pub const ACTIVITY_STORE: &str = "StoreMetadata";
pub const WORKFLOW_IMAGE_PIPELINE: &str = "ImagePipeline";

/// Metadata extracted from one image file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetadataRecord {
    pub file_name: String,
    pub file_size_kb: u64,
    pub width: u32,
    pub height: u32,
    pub format: String,
}

/// Source of image bytes keyed by file name. Missing files must error with
/// a "not found:" prefix.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn fetch(&self, file_name: &str) -> Result<Vec<u8>, String>;
}

/// Reads images from a directory on local disk.
pub struct FsImageSource {
    root: PathBuf,
}

impl FsImageSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ImageSource for FsImageSource {
    async fn fetch(&self, file_name: &str) -> Result<Vec<u8>, String> {
        let path = self.root.join(file_name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(format!("not found: {file_name}"))
            }
            Err(e) => Err(format!("read failed for {file_name}: {e}")),
        }
    }
}

/// Destination for extracted metadata. Failures must error with a
/// "sink write error:" prefix.
#[async_trait]
pub trait MetadataSink: Send + Sync {
    async fn persist(&self, record: &MetadataRecord) -> Result<(), String>;
}

/// Writes metadata rows into an `image_metadata` table.
pub struct SqliteMetadataSink {
    pool: SqlitePool,
}

impl SqliteMetadataSink {
    pub async fn new(path: &str) -> Result<Self, String> {
        use std::str::FromStr;
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{path}"))
            .map_err(|e| e.to_string())?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .map_err(|e| e.to_string())?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS image_metadata (
                file_name    TEXT PRIMARY KEY,
                file_size_kb INTEGER NOT NULL,
                width        INTEGER NOT NULL,
                height       INTEGER NOT NULL,
                format       TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl MetadataSink for SqliteMetadataSink {
    async fn persist(&self, record: &MetadataRecord) -> Result<(), String> {
        sqlx::query(
            "INSERT OR REPLACE INTO image_metadata \
             (file_name, file_size_kb, width, height, format) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&record.file_name)
        .bind(record.file_size_kb as i64)
        .bind(record.width as i64)
        .bind(record.height as i64)
        .bind(&record.format)
        .execute(&self.pool)
        .await
        .map_err(|e| format!("sink write error: {e}"))?;
        Ok(())
    }
}

/// Decode image bytes and build the metadata record for `file_name`.
pub fn extract_from_bytes(file_name: &str, bytes: &[u8]) -> Result<MetadataRecord, String> {
    let format = image::guess_format(bytes)
        .map_err(|e| format!("decode error: {file_name}: {e}"))?;
    let img = image::load_from_memory(bytes)
        .map_err(|e| format!("decode error: {file_name}: {e}"))?;
    Ok(MetadataRecord {
        file_name: file_name.to_string(),
        file_size_kb: bytes.len() as u64 / 1024,
        width: img.width(),
        height: img.height(),
        format: format!("{format:?}").to_uppercase(),
    })
}

/// Register the pipeline's activities against the given source and sink.
pub fn register_activities(
    builder: ActivityRegistryBuilder,
    source: Arc<dyn ImageSource>,
    sink: Arc<dyn MetadataSink>,
) -> ActivityRegistryBuilder {
    let builder = builder.register(ACTIVITY_EXTRACT, move |file_name: String| {
        let source = source.clone();
        async move {
            let bytes = source.fetch(&file_name).await?;
            let record = extract_from_bytes(&file_name, &bytes)?;
            info!(
                file_name,
                width = record.width,
                height = record.height,
                format = record.format,
                "extracted image metadata"
            );
            serde_json::to_string(&record).map_err(|e| e.to_string())
        }
    });
    builder.register(ACTIVITY_STORE, move |payload: String| {
        let sink = sink.clone();
        async move {
            let record: MetadataRecord =
                serde_json::from_str(&payload).map_err(|e| e.to_string())?;
            sink.persist(&record).await?;
            info!(file_name = record.file_name, "stored image metadata");
            Ok(payload)
        }
    })
}

/// Register the image pipeline workflow.
pub fn register_workflows(builder: WorkflowRegistryBuilder) -> WorkflowRegistryBuilder {
    builder.register_with_activities(
        WORKFLOW_IMAGE_PIPELINE,
        &[ACTIVITY_EXTRACT, ACTIVITY_STORE],
        image_pipeline,
    )
}

/// Two sequential steps: extract metadata, then store exactly the payload
/// extraction produced. The workflow output is that same payload.
async fn image_pipeline(ctx: WorkflowContext, input: String) -> Result<String, String> {
    let metadata = ctx.schedule_activity(ACTIVITY_EXTRACT, input).await?;
    ctx.schedule_activity(ACTIVITY_STORE, metadata.clone()).await?;
    Ok(metadata)
}
