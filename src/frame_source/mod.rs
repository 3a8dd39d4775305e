//! FrameSource - Capture Adapters
//!
//! ## Responsibilities
//!
//! - Poll an HTTP JPEG snapshot URL and publish each image to the distributor
//! - Follow an MJPEG (`multipart/x-mixed-replace`) response and split it on
//!   JPEG SOI/EOI markers
//!
//! Frames are numbered by the distributor (`publish_jpeg`), so a source never
//! tracks sequences itself.

use crate::error::{Error, Result};
use crate::frame_distributor::{FrameDistributor, PublishOutcome};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Upper bound on a buffered partial JPEG before the splitter resyncs
const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];

pub fn is_jpeg(data: &[u8]) -> bool {
    data.starts_with(&SOI)
}

/// Incremental JPEG extractor for concatenated or multipart byte streams
#[derive(Debug, Default)]
pub struct JpegSplitter {
    buf: BytesMut,
}

impl JpegSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk, returning every JPEG completed by it
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let Some(start) = find_marker(&self.buf, &SOI, 0) else {
                // Keep a trailing 0xFF, it may begin a marker split across chunks
                let keep = usize::from(self.buf.last() == Some(&0xFF));
                let drop_len = self.buf.len() - keep;
                let _ = self.buf.split_to(drop_len);
                break;
            };
            if start > 0 {
                let _ = self.buf.split_to(start);
            }
            match find_marker(&self.buf, &EOI, SOI.len()) {
                Some(end) => {
                    let frame = self.buf.split_to(end + EOI.len()).freeze();
                    frames.push(frame);
                }
                None => {
                    if self.buf.len() > MAX_FRAME_BYTES {
                        tracing::warn!(buffered = self.buf.len(), "JPEG without end marker, resyncing");
                        let _ = self.buf.split_to(SOI.len());
                        continue;
                    }
                    break;
                }
            }
        }
        frames
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

fn find_marker(data: &[u8], marker: &[u8; 2], from: usize) -> Option<usize> {
    if data.len() < from + 2 {
        return None;
    }
    data[from..]
        .windows(2)
        .position(|w| w == marker)
        .map(|p| p + from)
}

/// HTTP capture adapter shared by every polled camera
#[derive(Clone)]
pub struct HttpFrameSource {
    client: reqwest::Client,
    distributor: Arc<FrameDistributor>,
}

impl HttpFrameSource {
    pub fn new(distributor: Arc<FrameDistributor>) -> Result<Self> {
        // No overall timeout: an MJPEG response body never completes
        let client = reqwest::Client::builder()
            .connect_timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            distributor,
        })
    }

    /// Start capturing `url` into the camera's distributor channel.
    ///
    /// A snapshot endpoint is polled every `interval` (at least 100 ms). An
    /// MJPEG endpoint is read continuously and reconnected on failure. The
    /// task ends when the camera is no longer registered.
    pub fn spawn(&self, camera_id: &str, url: &str, interval: Duration) -> JoinHandle<()> {
        let source = self.clone();
        let camera_id = camera_id.to_string();
        let url = url.to_string();
        let interval = interval.max(MIN_POLL_INTERVAL);

        tokio::spawn(async move {
            tracing::info!(
                camera_id = %camera_id,
                url = %url,
                interval_ms = interval.as_millis() as u64,
                "Frame source started"
            );
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut failures: u64 = 0;

            loop {
                ticker.tick().await;
                if !source.distributor.is_registered(&camera_id).await {
                    break;
                }

                match source.poll_once(&camera_id, &url).await {
                    Ok(()) => {
                        if failures > 0 {
                            tracing::info!(camera_id = %camera_id, failures, "Frame source recovered");
                        }
                        failures = 0;
                    }
                    Err(e) => {
                        failures += 1;
                        if failures == 1 || failures % 50 == 0 {
                            tracing::warn!(camera_id = %camera_id, failures, error = %e, "Frame capture failed");
                        }
                        if matches!(e, Error::NotFound(_)) {
                            break;
                        }
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
            tracing::info!(camera_id = %camera_id, "Frame source stopped");
        })
    }

    /// One snapshot, or one MJPEG session until it ends
    async fn poll_once(&self, camera_id: &str, url: &str) -> Result<()> {
        let response = tokio::time::timeout(REQUEST_TIMEOUT, self.client.get(url).send())
            .await
            .map_err(|_| Error::Timeout(format!("request to {}", url)))??
            .error_for_status()?;
        let multipart = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.starts_with("multipart/"))
            .unwrap_or(false);

        if !multipart {
            let body = tokio::time::timeout(REQUEST_TIMEOUT, response.bytes())
                .await
                .map_err(|_| Error::Timeout(format!("snapshot body from {}", url)))??;
            if !is_jpeg(&body) {
                return Err(Error::Internal(format!("snapshot is not a JPEG ({} bytes)", body.len())));
            }
            return self.publish(camera_id, body).await;
        }

        let mut splitter = JpegSplitter::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for jpeg in splitter.push(&chunk) {
                self.publish(camera_id, jpeg).await?;
            }
        }
        Err(Error::ServiceUnavailable(format!("MJPEG stream for {} ended", camera_id)))
    }

    async fn publish(&self, camera_id: &str, jpeg: Bytes) -> Result<()> {
        match self.distributor.publish_jpeg(camera_id, jpeg).await {
            PublishOutcome::UnknownCamera => {
                Err(Error::NotFound(format!("camera {}", camera_id)))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut v = SOI.to_vec();
        v.extend_from_slice(body);
        v.extend_from_slice(&EOI);
        v
    }

    #[test]
    fn test_splitter_whole_frames() {
        let mut splitter = JpegSplitter::new();
        let mut data = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        data.extend(jpeg(b"one"));
        data.extend_from_slice(b"\r\n--frame\r\n\r\n");
        data.extend(jpeg(b"two"));

        let frames = splitter.push(&data);
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], &jpeg(b"one")[..]);
        assert_eq!(&frames[1][..], &jpeg(b"two")[..]);
    }

    #[test]
    fn test_splitter_marker_split_across_chunks() {
        let mut splitter = JpegSplitter::new();
        let data = jpeg(b"abcdef");

        assert!(splitter.push(&data[..1]).is_empty());
        assert!(splitter.push(&data[1..5]).is_empty());
        assert!(splitter.push(&data[5..data.len() - 1]).is_empty());
        let frames = splitter.push(&data[data.len() - 1..]);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &data[..]);
        assert_eq!(splitter.buffered(), 0);
    }

    #[test]
    fn test_splitter_discards_garbage() {
        let mut splitter = JpegSplitter::new();
        assert!(splitter.push(b"no image here").is_empty());
        assert_eq!(splitter.buffered(), 0);
    }

    #[test]
    fn test_is_jpeg() {
        assert!(is_jpeg(&jpeg(b"x")));
        assert!(!is_jpeg(b"GIF89a"));
    }
}
