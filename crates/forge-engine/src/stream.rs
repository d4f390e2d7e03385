//! Sized byte payloads moved into and out of containers
//!
//! A [`Stream`] couples a reader with the number of bytes it will yield so
//! the consumer can build archive headers up front. A stream may own a
//! release callback (usually "close the container this came from") that runs
//! exactly once, after the payload has been drained or the stream is closed.

use crate::{Container, EngineError};
use futures::future::{BoxFuture, FutureExt};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, warn};

/// Deferred cleanup attached to a stream
pub type Release = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

pub struct Stream {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    size: u64,
    /// Bytes handed out through `AsyncRead`
    read: u64,
    release: Option<Release>,
}

impl Stream {
    pub fn new<R>(reader: R, size: u64) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            size,
            read: 0,
            release: None,
        }
    }

    pub fn from_bytes(data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        let size = data.len() as u64;
        Self::new(io::Cursor::new(data), size)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Run `release` once the stream is drained or closed, after any
    /// release already attached
    pub fn on_release(mut self, release: Release) -> Self {
        self.release = match self.release.take() {
            Some(previous) => Some(Box::new(move || {
                async move {
                    previous().await;
                    release().await;
                }
                .boxed()
            })),
            None => Some(release),
        };
        self
    }

    /// Hand the container's closing over to whoever consumes this stream
    pub fn bind_container(self, container: Box<dyn Container>) -> Self {
        self.on_release(Box::new(move || {
            async move {
                debug!("Stream drained, closing container {}", container.id());
                if let Err(e) = container.close().await {
                    warn!("Failed to close container {}: {}", container.id(), e);
                }
            }
            .boxed()
        }))
    }

    /// Copy exactly `size` bytes into `writer`, then release
    pub async fn out<W>(mut self, writer: &mut W) -> Result<u64, EngineError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let result = self.copy_exact(writer).await;
        self.release().await;
        result
    }

    pub async fn into_bytes(self) -> Result<Vec<u8>, EngineError> {
        let mut buffer = Vec::with_capacity(self.size as usize);
        self.out(&mut buffer).await?;
        Ok(buffer)
    }

    /// Release without consuming the payload
    pub async fn close(mut self) {
        self.release().await;
    }

    async fn copy_exact<W>(&mut self, writer: &mut W) -> Result<u64, EngineError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let expected = self.size;
        let mut limited = (&mut self.reader).take(expected);
        let actual = tokio::io::copy(&mut limited, writer).await?;
        writer.flush().await?;
        if actual != expected {
            return Err(EngineError::StreamLength { expected, actual });
        }
        Ok(actual)
    }

    async fn release(&mut self) {
        if let Some(release) = self.release.take() {
            release().await;
        }
    }

    fn spawn_release(&mut self) {
        if let Some(release) = self.release.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(release());
                }
                Err(_) => warn!("No async runtime available, stream release skipped"),
            }
        }
    }
}

/// Yields at most `size` bytes; running dry before that is an
/// `UnexpectedEof` carrying the length mismatch.
impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let remaining = this.size - this.read;
        if remaining == 0 {
            this.spawn_release();
            return Poll::Ready(Ok(()));
        }
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let limit = remaining.min(buf.remaining() as u64) as usize;
        let mut limited = ReadBuf::new(buf.initialize_unfilled_to(limit));
        match Pin::new(&mut this.reader).poll_read(cx, &mut limited) {
            Poll::Ready(Ok(())) => {
                let n = limited.filled().len();
                if n == 0 {
                    this.spawn_release();
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        EngineError::StreamLength {
                            expected: this.size,
                            actual: this.read,
                        },
                    )));
                }
                buf.advance(n);
                this.read += n as u64;
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.spawn_release();
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("size", &self.size)
            .field("release", &self.release.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::oneshot;
    use tokio::time::{timeout, Duration};

    fn counting_release(counter: Arc<AtomicUsize>) -> Release {
        Box::new(move || {
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_out_copies_declared_size() {
        let stream = Stream::from_bytes(b"droplet-bytes".to_vec());
        assert_eq!(stream.size(), 13);

        let mut out = Vec::new();
        let copied = stream.out(&mut out).await.unwrap();

        assert_eq!(copied, 13);
        assert_eq!(out, b"droplet-bytes");
    }

    #[tokio::test]
    async fn test_short_stream_is_an_error() {
        let stream = Stream::new(io::Cursor::new(b"abc".to_vec()), 10);

        let err = stream.into_bytes().await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::StreamLength {
                expected: 10,
                actual: 3
            }
        ));
    }

    #[test]
    fn test_close_without_release() {
        let stream = Stream::from_bytes(b"ignored".to_vec());
        assert_eq!(format!("{:?}", stream), "Stream { size: 7, release: false }");
        tokio_test::block_on(stream.close());
    }

    #[tokio::test]
    async fn test_short_stream_fails_when_read_directly() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut stream = Stream::new(io::Cursor::new(b"abc".to_vec()), 10)
            .on_release(counting_release(counter.clone()));

        let mut buffer = Vec::new();
        let err = stream.read_to_end(&mut buffer).await.unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert_eq!(
            err.to_string(),
            "Stream length mismatch: expected 10 bytes, got 3"
        );
        assert_eq!(buffer, b"abc");
        timeout(Duration::from_secs(1), async {
            while counter.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("release should run after a short read");
        drop(stream);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_direct_read_stops_at_declared_size() {
        let mut stream = Stream::new(io::Cursor::new(b"abcdef".to_vec()), 3);

        let mut out = Vec::new();
        let copied = tokio::io::copy(&mut stream, &mut out).await.unwrap();

        assert_eq!(copied, 3);
        assert_eq!(out, b"abc");
    }

    #[tokio::test]
    async fn test_release_runs_once_after_out() {
        let counter = Arc::new(AtomicUsize::new(0));
        let stream = Stream::from_bytes(b"data".to_vec()).on_release(counting_release(counter.clone()));

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        let bytes = stream.into_bytes().await.unwrap();

        assert_eq!(bytes, b"data");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_release_runs_even_when_length_mismatches() {
        let counter = Arc::new(AtomicUsize::new(0));
        let stream = Stream::new(io::Cursor::new(Vec::new()), 5)
            .on_release(counting_release(counter.clone()));

        assert!(stream.into_bytes().await.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_releases_chain_in_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let first = order.clone();
        let second = order.clone();

        let stream = Stream::from_bytes(Vec::new())
            .on_release(Box::new(move || {
                async move { first.lock().unwrap().push("first") }.boxed()
            }))
            .on_release(Box::new(move || {
                async move { second.lock().unwrap().push("second") }.boxed()
            }));
        stream.close().await;

        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_release_on_end_of_data_when_read_directly() {
        let (tx, rx) = oneshot::channel();
        let mut stream = Stream::from_bytes(b"payload".to_vec()).on_release(Box::new(move || {
            async move {
                let _ = tx.send(());
            }
            .boxed()
        }));

        let mut buffer = Vec::new();
        stream.read_to_end(&mut buffer).await.unwrap();

        assert_eq!(buffer, b"payload");
        timeout(Duration::from_secs(1), rx)
            .await
            .expect("release should run after end of data")
            .unwrap();
    }

    #[tokio::test]
    async fn test_release_on_drop() {
        let (tx, rx) = oneshot::channel();
        let stream = Stream::from_bytes(b"unread".to_vec()).on_release(Box::new(move || {
            async move {
                let _ = tx.send(());
            }
            .boxed()
        }));

        drop(stream);

        timeout(Duration::from_secs(1), rx)
            .await
            .expect("release should run when dropped")
            .unwrap();
    }
}
