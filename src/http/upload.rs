use crate::types::UploadProgress;
use bytes::Bytes;
use futures::Stream;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

pub const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_UPLOAD_FIELD: &str = "file";

pub type ProgressSender = mpsc::UnboundedSender<UploadProgress>;

#[derive(Debug, Clone)]
pub struct UploadFile {
    pub field: String,
    pub file_name: String,
    pub mime: Option<String>,
    pub content: Bytes,
}

impl UploadFile {
    pub fn new(file_name: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            field: DEFAULT_UPLOAD_FIELD.to_string(),
            file_name: file_name.into(),
            mime: None,
            content: content.into(),
        }
    }

    pub async fn from_path(path: &Path) -> std::io::Result<Self> {
        let content = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        Ok(Self::new(file_name, content))
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = field.into();
        self
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    pub fn total_bytes(&self) -> u64 {
        self.content.len() as u64
    }
}

struct TrackerInner {
    total: u64,
    sent: AtomicU64,
    finished: AtomicBool,
    tx: Option<ProgressSender>,
}

/// Turns raw byte counts into `UploadProgress` observations. Reported
/// values never go backwards, even when the body is replayed from the
/// start after a credential refresh.
#[derive(Clone)]
pub struct ProgressTracker {
    inner: Arc<TrackerInner>,
}

impl ProgressTracker {
    pub fn new(total: u64, tx: Option<ProgressSender>) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                total,
                sent: AtomicU64::new(0),
                finished: AtomicBool::new(false),
                tx,
            }),
        }
    }

    pub fn record(&self, bytes_sent: u64) {
        let bytes_sent = bytes_sent.min(self.inner.total);
        let previous = self.inner.sent.fetch_max(bytes_sent, Ordering::SeqCst);
        if bytes_sent > previous {
            self.emit(bytes_sent);
        }
    }

    /// Marks the upload as accepted by the server; the last observation is
    /// always the full size.
    pub fn finish(&self) {
        if self.inner.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        let total = self.inner.total;
        let previous = self.inner.sent.fetch_max(total, Ordering::SeqCst);
        if previous < total || total == 0 {
            self.emit(total);
        }
    }

    fn emit(&self, bytes_sent: u64) {
        if let Some(tx) = &self.inner.tx {
            let _ = tx.send(UploadProgress {
                bytes_sent,
                total_bytes: self.inner.total,
            });
        }
    }
}

/// Request body that hands the file to the transport chunk by chunk and
/// counts what has been handed over.
pub struct UploadStream {
    content: Bytes,
    offset: usize,
    chunk_size: usize,
    tracker: ProgressTracker,
}

impl UploadStream {
    pub fn new(content: Bytes, tracker: ProgressTracker) -> Self {
        Self::with_chunk_size(content, tracker, UPLOAD_CHUNK_SIZE)
    }

    pub fn with_chunk_size(content: Bytes, tracker: ProgressTracker, chunk_size: usize) -> Self {
        Self {
            content,
            offset: 0,
            chunk_size: chunk_size.max(1),
            tracker,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.content.len() as u64
    }
}

impl Stream for UploadStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let len = self.content.len();
        if self.offset >= len {
            return Poll::Ready(None);
        }
        let end = (self.offset + self.chunk_size).min(len);
        let chunk = self.content.slice(self.offset..end);
        self.offset = end;
        self.tracker.record(end as u64);
        Poll::Ready(Some(Ok(chunk)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.content.len().saturating_sub(self.offset);
        let chunks = remaining.div_ceil(self.chunk_size);
        (chunks, Some(chunks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn drain(rx: &mut mpsc::UnboundedReceiver<UploadProgress>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Ok(p) = rx.try_recv() {
            out.push(p.percent());
        }
        out
    }

    #[tokio::test]
    async fn stream_reports_each_chunk_and_finish_is_silent_when_complete() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tracker = ProgressTracker::new(10, Some(tx));
        let mut stream = UploadStream::with_chunk_size(Bytes::from(vec![0_u8; 10]), tracker.clone(), 3);

        let mut received = 0;
        while let Some(chunk) = stream.next().await {
            received += chunk.unwrap().len();
        }
        tracker.finish();

        assert_eq!(received, 10);
        assert_eq!(drain(&mut rx), vec![30, 60, 90, 100]);
    }

    #[tokio::test]
    async fn replayed_body_never_reports_backwards() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tracker = ProgressTracker::new(8, Some(tx));

        let first = UploadStream::with_chunk_size(Bytes::from(vec![1_u8; 8]), tracker.clone(), 4);
        let _ = first.take(1).collect::<Vec<_>>().await;
        let second = UploadStream::with_chunk_size(Bytes::from(vec![1_u8; 8]), tracker.clone(), 2);
        let _ = second.collect::<Vec<_>>().await;
        tracker.finish();

        let seen = drain(&mut rx);
        assert_eq!(seen, vec![50, 75, 100]);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn finish_reports_completion_for_empty_and_unsent_bodies() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let tracker = ProgressTracker::new(0, Some(tx));
        tracker.finish();
        tracker.finish();
        assert_eq!(drain(&mut rx), vec![100]);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let tracker = ProgressTracker::new(500, Some(tx));
        tracker.finish();
        assert_eq!(drain(&mut rx), vec![100]);
    }
}
