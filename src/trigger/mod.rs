//! Storage trigger: watches a directory and starts one pipeline instance
//! per newly observed file. Instance ids derive from file names, so the
//! duplicate-instance conflict makes triggering idempotent across restarts.
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::client::{Client, ClientError};
use crate::pipeline::WORKFLOW_IMAGE_PIPELINE;

/// Stable instance id for a triggered file.
pub fn instance_id_for(file_name: &str) -> String {
    format!("img::{file_name}")
}

pub struct DirectoryWatcher {
    client: Client,
    dir: PathBuf,
    poll_interval: Duration,
    seen: HashSet<String>,
}

impl DirectoryWatcher {
    pub fn new(client: Client, dir: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            client,
            dir: dir.into(),
            poll_interval,
            seen: HashSet::new(),
        }
    }

    /// Poll the directory forever, starting a workflow per new file.
    pub async fn run(mut self) {
        info!(dir = %self.dir.display(), "watching for new images");
        loop {
            if let Err(e) = self.scan_once().await {
                warn!(error = e, "directory scan failed");
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// One pass over the directory. Returns the file names newly triggered.
    pub async fn scan_once(&mut self) -> Result<Vec<String>, String> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| format!("read_dir {}: {e}", self.dir.display()))?;
        let mut triggered = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| e.to_string())? {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if !file_type.is_file() {
                continue;
            }
            let Some(file_name) = entry.file_name().to_str().map(String::from) else {
                continue;
            };
            if self.seen.contains(&file_name) {
                continue;
            }
            match self.trigger(&file_name).await {
                Ok(started) => {
                    self.seen.insert(file_name.clone());
                    if started {
                        triggered.push(file_name);
                    }
                }
                Err(e) => warn!(file_name, error = %e, "failed to trigger pipeline"),
            }
        }
        Ok(triggered)
    }

    /// Start the pipeline for one file. Returns false when an instance for
    /// this file already exists.
    async fn trigger(&self, file_name: &str) -> Result<bool, ClientError> {
        let instance = instance_id_for(file_name);
        match self
            .client
            .start_workflow(WORKFLOW_IMAGE_PIPELINE, &instance, file_name)
            .await
        {
            Ok(()) => {
                info!(file_name, instance, "pipeline triggered");
                Ok(true)
            }
            Err(ClientError::DuplicateInstance) => {
                debug!(file_name, "already triggered");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
