//! Splits an upstream body between the client and the usage extractor.

use std::io::Read;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use axum::body::Bytes;
use futures_util::Stream;
use futures_util::stream::BoxStream;
use tokio::sync::mpsc;

pub type UpstreamStream = BoxStream<'static, Result<Bytes, reqwest::Error>>;

/// Passes upstream chunks through unchanged while copying them into an
/// unbounded channel. The copy never waits on the reader, so the client path
/// is not slowed by usage extraction.
///
/// `completed` is set when the upstream body reached its end without a
/// transport error, even if the reader already stopped listening. Dropping
/// the tee early (client disconnect) closes the channel and cancels the
/// upstream body.
pub struct UsageTee {
    inner: UpstreamStream,
    tx: Option<mpsc::UnboundedSender<Bytes>>,
    completed: Arc<AtomicBool>,
    failed: bool,
}

impl UsageTee {
    pub fn new(inner: UpstreamStream, tx: mpsc::UnboundedSender<Bytes>, completed: Arc<AtomicBool>) -> Self {
        Self {
            inner,
            tx: Some(tx),
            completed,
            failed: false,
        }
    }
}

impl Stream for UsageTee {
    type Item = Result<Bytes, reqwest::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.as_mut().get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if let Some(tx) = &this.tx
                    && tx.send(chunk.clone()).is_err()
                {
                    this.tx = None;
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                let e = e.without_url();
                tracing::warn!(error = %e, "upstream body failed mid-stream");
                this.tx = None;
                this.failed = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                // 读取端可能已在 [DONE] 后提前退出
                this.tx = None;
                if !this.failed {
                    this.completed.store(true, Ordering::SeqCst);
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Blocking reader over the channel fed by [`UsageTee`]. Only use it from a
/// blocking worker thread.
pub struct ChannelReader {
    rx: mpsc::UnboundedReceiver<Bytes>,
    current: Bytes,
}

impl ChannelReader {
    pub fn new(rx: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self {
            rx,
            current: Bytes::new(),
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.current.is_empty() {
            match self.rx.blocking_recv() {
                Some(chunk) => self.current = chunk,
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len());
        buf[..n].copy_from_slice(&self.current[..n]);
        self.current = self.current.slice(n..);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader};

    use futures_util::StreamExt;

    use super::*;

    fn chunks(parts: &[&'static str]) -> UpstreamStream {
        let items: Vec<Result<Bytes, reqwest::Error>> =
            parts.iter().map(|p| Ok(Bytes::from_static(p.as_bytes()))).collect();
        futures_util::stream::iter(items).boxed()
    }

    #[tokio::test]
    async fn client_and_reader_see_identical_bytes() {
        let (tx, rx) = mpsc::unbounded_channel();
        let completed = Arc::new(AtomicBool::new(false));
        let tee = UsageTee::new(chunks(&["data: {\"a\"", ":1}\n\n", "data: [DONE]\n\n"]), tx, completed.clone());

        let reader = tokio::task::spawn_blocking(move || {
            let mut lines = Vec::new();
            for line in BufReader::new(ChannelReader::new(rx)).lines() {
                lines.push(line.unwrap());
            }
            lines
        });

        let client: Vec<Bytes> = tee.map(|c| c.unwrap()).collect().await;
        let client = client.concat();
        assert_eq!(client, b"data: {\"a\":1}\n\ndata: [DONE]\n\n");
        assert!(completed.load(Ordering::SeqCst));

        let lines = reader.await.unwrap();
        assert_eq!(lines, vec!["data: {\"a\":1}", "", "data: [DONE]", ""]);
    }

    #[tokio::test]
    async fn reader_finishing_first_still_completes() {
        let (tx, rx) = mpsc::unbounded_channel();
        let completed = Arc::new(AtomicBool::new(false));
        drop(rx);
        let tee = UsageTee::new(
            chunks(&["data: {\"completion\":\"ab\"}\n\ndata: [DONE]\n\n", "\n"]),
            tx,
            completed.clone(),
        );

        let client: Vec<Bytes> = tee.map(|c| c.unwrap()).collect().await;
        assert_eq!(client.len(), 2);
        assert!(completed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn dropping_tee_early_leaves_stream_incomplete() {
        let (tx, rx) = mpsc::unbounded_channel();
        let completed = Arc::new(AtomicBool::new(false));
        let mut tee = UsageTee::new(chunks(&["one", "two"]), tx, completed.clone());
        assert!(tee.next().await.is_some());
        drop(tee);

        let read = tokio::task::spawn_blocking(move || {
            let mut s = String::new();
            ChannelReader::new(rx).read_to_string(&mut s).unwrap();
            s
        })
        .await
        .unwrap();
        assert_eq!(read, "one");
        assert!(!completed.load(Ordering::SeqCst));
    }
}
