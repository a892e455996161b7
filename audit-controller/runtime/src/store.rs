use anyhow::{bail, Context, Result};
use kubetrail_controller_core::{ChangeEvent, EventFilter, Store};
use std::path::{Path, PathBuf};
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::Mutex,
};
use tracing::warn;

/// Appends events to a file, one JSON document per line.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

// === impl FileStore ===

impl FileStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
        })
    }
}

#[async_trait::async_trait]
impl Store for FileStore {
    async fn save(&self, event: &ChangeEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        let Some(file) = file.as_mut() else {
            bail!("store is closed");
        };
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn query(&self, filter: &EventFilter) -> Result<Vec<ChangeEvent>> {
        // Hold the writer so that no partial line is read.
        let _writer = self.file.lock().await;
        let file = File::open(&self.path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut events = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<ChangeEvent>(&line) {
                Ok(event) => events.push(event),
                Err(error) => warn!(%error, path = %self.path.display(), "Skipping corrupt event"),
            }
        }
        Ok(filter.select(events.iter()))
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut file) = self.file.lock().await.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        Ok(())
    }
}
