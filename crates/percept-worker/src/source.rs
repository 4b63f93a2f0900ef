//! JSON-lines detection source.
//!
//! Each input line is one frame:
//!
//! ```json
//! {"timestamp": "2024-05-01T12:00:00Z", "detections": [{"label": "cup", "confidence": 0.8,
//!  "boundingBox": {"x": 0.1, "y": 0.2, "w": 0.1, "h": 0.15}, "classIndex": 41}],
//!  "imagePath": "frames/000001.png"}
//! ```
//!
//! `timestamp` defaults to the time the line is read and `imagePath` is
//! optional. Malformed lines are logged and skipped.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use image::RgbImage;
use metrics::counter;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use percept_models::DetectionFrame;
use percept_tracking::{Frame, FrameSender};

use crate::error::{WorkerError, WorkerResult};

const SOURCE_LINES_REJECTED_TOTAL: &str = "percept_source_lines_rejected_total";

/// One line of input.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceLine {
    #[serde(flatten)]
    pub frame: DetectionFrame,
    #[serde(default)]
    pub image_path: Option<PathBuf>,
}

/// Totals for a source run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub lines: u64,
    pub published: u64,
    pub rejected: u64,
    pub images_failed: u64,
}

/// Open the input, or stdin when `path` is `None`.
pub async fn open_input(path: Option<&Path>) -> WorkerResult<Box<dyn AsyncBufRead + Unpin + Send>> {
    match path {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .map_err(|e| WorkerError::source_failed(format!("{}: {}", path.display(), e)))?;
            Ok(Box::new(BufReader::new(file)))
        }
        None => Ok(Box::new(BufReader::new(tokio::io::stdin()))),
    }
}

/// Parse one input line; blank lines yield `None`.
pub fn parse_line(line: &str) -> WorkerResult<Option<SourceLine>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line)?))
}

async fn load_image(path: PathBuf) -> WorkerResult<RgbImage> {
    tokio::task::spawn_blocking(move || -> WorkerResult<RgbImage> { Ok(image::open(&path)?.to_rgb8()) })
        .await
        .map_err(|e| WorkerError::task_failed(format!("image loading task failed: {}", e)))?
}

/// Replay input lines into the frame slot.
///
/// With a `period`, at most one line is published per period; otherwise
/// lines are published as fast as they are read. Stops at end of input,
/// on shutdown, or when the driver has gone away.
pub async fn replay<R>(
    reader: R,
    sender: &FrameSender,
    period: Option<Duration>,
    load_images: bool,
    shutdown: watch::Receiver<bool>,
) -> WorkerResult<SourceStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut stats = SourceStats::default();
    let mut ticker = period.map(|p| {
        let mut ticker = tokio::time::interval(p);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    while let Some(line) = lines.next_line().await? {
        if *shutdown.borrow() || sender.is_closed() {
            break;
        }
        stats.lines += 1;

        let parsed = match parse_line(&line) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => continue,
            Err(e) => {
                stats.rejected += 1;
                counter!(SOURCE_LINES_REJECTED_TOTAL).increment(1);
                warn!(line = stats.lines, error = %e, "Skipping malformed input line");
                continue;
            }
        };

        let mut frame = Frame::from_detections(0, parsed.frame);
        if let Some(path) = parsed.image_path.filter(|_| load_images) {
            match load_image(path.clone()).await {
                Ok(image) => frame = frame.with_image(Arc::new(image)),
                Err(e) => {
                    stats.images_failed += 1;
                    warn!(path = %path.display(), error = %e, "Failed to load frame image");
                }
            }
        }

        if let Some(ticker) = ticker.as_mut() {
            ticker.tick().await;
        }
        let index = sender.publish(frame);
        stats.published += 1;
        debug!(frame = index, "Frame published");
    }

    info!(
        lines = stats.lines,
        published = stats.published,
        rejected = stats.rejected,
        "Source finished"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use percept_tracking::frame_channel;

    #[test]
    fn test_parse_line() {
        let line = r#"{"timestamp": "2024-05-01T12:00:00Z", "detections": [{"label": "cup", "confidence": 0.8, "boundingBox": {"x": 0.1, "y": 0.2, "w": 0.1, "h": 0.15}, "classIndex": 41}], "imagePath": "f.png"}"#;
        let parsed = parse_line(line).unwrap().unwrap();

        assert_eq!(parsed.frame.detections.len(), 1);
        assert_eq!(parsed.frame.detections[0].class_index, 41);
        assert_eq!(parsed.image_path, Some(PathBuf::from("f.png")));
        assert!(parse_line("   ").unwrap().is_none());
        assert!(parse_line("{not json").is_err());
    }

    #[tokio::test]
    async fn test_replay_skips_bad_lines() {
        let input = concat!(
            r#"{"detections": []}"#,
            "\n",
            "garbage\n",
            "\n",
            r#"{"detections": [{"label": "dog", "confidence": 0.9, "boundingBox": {"x": 0.1, "y": 0.1, "w": 0.2, "h": 0.2}}]}"#,
            "\n",
        );
        let (sender, frames) = frame_channel();
        let (_tx, shutdown) = watch::channel(false);

        let stats = replay(input.as_bytes(), &sender, None, false, shutdown).await.unwrap();

        assert_eq!(stats.lines, 4);
        assert_eq!(stats.published, 2);
        assert_eq!(stats.rejected, 1);

        let latest = frames.borrow().clone().unwrap();
        assert_eq!(latest.index, 1);
        assert_eq!(latest.detections[0].label, "dog");
    }

    #[tokio::test]
    async fn test_replay_loads_images() {
        let dir = tempfile::tempdir().unwrap();
        let image_path = dir.path().join("frame.png");
        RgbImage::from_pixel(8, 6, image::Rgb([1, 2, 3])).save(&image_path).unwrap();

        let input = format!(
            "{{\"detections\": [], \"imagePath\": {}}}\n{{\"detections\": [], \"imagePath\": \"missing.png\"}}\n",
            serde_json::to_string(&image_path).unwrap()
        );
        let (sender, frames) = frame_channel();
        let (_tx, shutdown) = watch::channel(false);

        let stats = replay(input.as_bytes(), &sender, None, true, shutdown).await.unwrap();
        assert_eq!(stats.published, 2);
        assert_eq!(stats.images_failed, 1);
        assert!(frames.borrow().as_ref().unwrap().image.is_none());
    }

    #[tokio::test]
    async fn test_replay_stops_on_shutdown() {
        let (sender, _frames) = frame_channel();
        let (tx, shutdown) = watch::channel(false);
        tx.send(true).unwrap();

        let stats = replay(&b"{}\n{}\n"[..], &sender, None, false, shutdown).await.unwrap();
        assert_eq!(stats.published, 0);
    }
}
