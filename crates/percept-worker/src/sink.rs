//! JSON-lines persistence sink.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

use percept_models::PersistenceRecord;
use percept_tracking::{PersistenceSink, TrackingError, TrackingResult};

/// Appends one JSON object per record to a file.
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesSink {
    /// Open `path` for appending, creating it and its parent directories.
    pub async fn open(path: impl AsRef<Path>) -> TrackingResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path).await?;
        info!(path = %path.display(), "Opened persistence output");

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PersistenceSink for JsonLinesSink {
    async fn persist(&self, records: &[PersistenceRecord]) -> TrackingResult<()> {
        let mut buffer = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buffer, record)?;
            buffer.push(b'\n');
        }

        // One write per batch so a batch is never interleaved with another
        let mut file = self.file.lock().await;
        file.write_all(&buffer)
            .await
            .map_err(|e| TrackingError::sink_failed(e.to_string(), records.len()))?;
        file.flush()
            .await
            .map_err(|e| TrackingError::sink_failed(e.to_string(), records.len()))?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "json-lines"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use percept_models::{BoundingBox, IdentityId, SaveReason};

    fn record(label: &str, thumbnail: Option<Vec<u8>>) -> PersistenceRecord {
        PersistenceRecord {
            identity_id: IdentityId::new(),
            label: label.to_string(),
            confidence: 0.75,
            bounding_box: BoundingBox::new(0.1, 0.2, 0.3, 0.4),
            class_index: 56,
            thumbnail,
            recognized_as: None,
            reason: SaveReason::FirstOfClass,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("records.jsonl");
        let sink = JsonLinesSink::open(&path).await.unwrap();

        sink.persist(&[record("chair", None)]).await.unwrap();
        sink.persist(&[record("cup", Some(vec![0xff, 0xd8, 0x01]))]).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: PersistenceRecord = serde_json::from_str(lines[0]).unwrap();
        let second: PersistenceRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(first.label, "chair");
        assert_eq!(second.thumbnail, Some(vec![0xff, 0xd8, 0x01]));
    }

    #[tokio::test]
    async fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.jsonl");

        JsonLinesSink::open(&path).await.unwrap().persist(&[record("a", None)]).await.unwrap();
        JsonLinesSink::open(&path).await.unwrap().persist(&[record("b", None)]).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
