//! Bounded single-producer/single-consumer byte relay.
//!
//! The relay decouples a producer (manifest downloader, transcoder stdout, local file)
//! from the network sender. It is only reachable through the [`RelayWriter`] /
//! [`RelayReader`] pair returned by [`BoundedRelay::new`]; neither half is `Clone`,
//! so the single-writer/single-reader contract is enforced by ownership.
//!
//! Backpressure uses hysteresis: once `written - read` reaches the capacity the
//! writer suspends until the reader has drained the buffer down to the low watermark.

mod mirror;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::RelayConfig;
use crate::error::FerryError;

pub use mirror::Mirror;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("relay cancelled")]
    Cancelled,

    #[error("write after the relay was completed")]
    WriteAfterComplete,

    #[error("producer went away without completing the relay")]
    WriterDropped,

    #[error("consumer went away while the producer was still writing")]
    ReaderDropped,
}

/// Point-in-time view of the relay cursors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayMetrics {
    pub written: u64,
    pub read: u64,
    pub buffered: u64,
    pub completed: bool,
}

struct RelayState {
    buffer: BytesMut,
    completed: bool,
    /// Writer hit the capacity and waits for the low watermark.
    paused: bool,
    writer_alive: bool,
    reader_alive: bool,
}

struct Shared {
    state: Mutex<RelayState>,
    written: AtomicU64,
    read: AtomicU64,
    data_ready: Notify,
    space_ready: Notify,
    capacity: usize,
    low_watermark: usize,
}

impl Shared {
    fn metrics(&self) -> RelayMetrics {
        let completed = self.state.lock().completed;
        let read = self.read.load(Ordering::Acquire);
        let written = self.written.load(Ordering::Acquire);
        RelayMetrics {
            written,
            read,
            buffered: written.saturating_sub(read),
            completed,
        }
    }
}

pub struct BoundedRelay;

impl BoundedRelay {
    /// Create a relay from configuration. The mirror, if configured, is attached
    /// separately with [`RelayWriter::attach_mirror`] because opening it is async.
    pub fn new(config: &RelayConfig, token: CancellationToken) -> (RelayWriter, RelayReader) {
        Self::with_watermarks(config.capacity, config.effective_low_watermark(), token)
    }

    pub fn with_capacity(capacity: usize, token: CancellationToken) -> (RelayWriter, RelayReader) {
        Self::with_watermarks(capacity, capacity / 2, token)
    }

    fn with_watermarks(
        capacity: usize,
        low_watermark: usize,
        token: CancellationToken,
    ) -> (RelayWriter, RelayReader) {
        let capacity = capacity.max(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(RelayState {
                buffer: BytesMut::with_capacity(capacity.min(1024 * 1024)),
                completed: false,
                paused: false,
                writer_alive: true,
                reader_alive: true,
            }),
            written: AtomicU64::new(0),
            read: AtomicU64::new(0),
            data_ready: Notify::new(),
            space_ready: Notify::new(),
            capacity,
            low_watermark: low_watermark.min(capacity - 1),
        });
        debug!(capacity, low_watermark, "Relay created");

        (
            RelayWriter {
                shared: Arc::clone(&shared),
                token: token.clone(),
                mirror: None,
            },
            RelayReader { shared, token },
        )
    }
}

/// Producer half of the relay.
pub struct RelayWriter {
    shared: Arc<Shared>,
    token: CancellationToken,
    mirror: Option<Mirror>,
}

impl RelayWriter {
    pub fn attach_mirror(&mut self, mirror: Mirror) {
        self.mirror = Some(mirror);
    }

    /// Append `data`, suspending while the relay is full.
    ///
    /// Returns once every byte has been accepted. Bytes accepted before a
    /// cancellation stay in the relay.
    pub async fn write(&mut self, mut data: &[u8]) -> Result<(), RelayError> {
        while !data.is_empty() {
            let accepted = {
                let mut state = self.shared.state.lock();
                if state.completed {
                    return Err(RelayError::WriteAfterComplete);
                }
                if !state.reader_alive {
                    return Err(RelayError::ReaderDropped);
                }

                let buffered = state.buffer.len();
                if state.paused && buffered <= self.shared.low_watermark {
                    state.paused = false;
                }

                let mut accepted = 0;
                if !state.paused {
                    accepted = (self.shared.capacity - buffered).min(data.len());
                    state.buffer.extend_from_slice(&data[..accepted]);
                    self.shared
                        .written
                        .fetch_add(accepted as u64, Ordering::Release);
                    if state.buffer.len() >= self.shared.capacity {
                        state.paused = true;
                    }
                }
                accepted
            };

            if accepted > 0 {
                if let Some(mirror) = self.mirror.as_mut() {
                    mirror.offer(&data[..accepted]);
                }
                data = &data[accepted..];
                self.shared.data_ready.notify_one();
                continue;
            }

            trace!("Relay full, writer waiting for the low watermark");
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return Err(RelayError::Cancelled),
                _ = self.shared.space_ready.notified() => {}
            }
        }
        Ok(())
    }

    /// Signal that no further writes follow. Idempotent.
    pub fn complete(&self) {
        let mut state = self.shared.state.lock();
        if !state.completed {
            state.completed = true;
            debug!(
                written = self.shared.written.load(Ordering::Acquire),
                "Relay completed by producer"
            );
        }
        drop(state);
        self.shared.data_ready.notify_one();
    }

    /// Pump an async reader (a file, a child's stdout) into the relay and complete it at EOF.
    pub async fn copy_from<R>(&mut self, mut source: R, chunk_size: usize) -> Result<u64, FerryError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; chunk_size.max(1)];
        let mut total = 0u64;
        loop {
            let n = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Err(FerryError::Cancelled),
                n = source.read(&mut buf) => n?,
            };
            if n == 0 {
                break;
            }
            self.write(&buf[..n]).await?;
            total += n as u64;
        }
        self.complete();
        Ok(total)
    }

    /// Flush and detach the diagnostic mirror, if any.
    pub async fn finish_mirror(&mut self) {
        if let Some(mut mirror) = self.mirror.take() {
            mirror.close().await;
        }
    }

    pub fn metrics(&self) -> RelayMetrics {
        self.shared.metrics()
    }
}

impl Drop for RelayWriter {
    fn drop(&mut self) {
        self.shared.state.lock().writer_alive = false;
        self.shared.data_ready.notify_one();
    }
}

/// Consumer half of the relay.
pub struct RelayReader {
    shared: Arc<Shared>,
    token: CancellationToken,
}

impl RelayReader {
    /// Copy available bytes into `buf`, suspending while the relay is empty.
    ///
    /// `Ok(0)` means end of stream: the producer completed and every byte has been
    /// read. Every later call returns `Ok(0)` again. An empty `buf` also yields `Ok(0)`.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, RelayError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            {
                let mut state = self.shared.state.lock();
                if !state.buffer.is_empty() {
                    let n = buf.len().min(state.buffer.len());
                    buf[..n].copy_from_slice(&state.buffer[..n]);
                    state.buffer.advance(n);
                    self.shared.read.fetch_add(n as u64, Ordering::Release);
                    drop(state);
                    self.shared.space_ready.notify_one();
                    return Ok(n);
                }
                if state.completed {
                    return Ok(0);
                }
                if self.token.is_cancelled() {
                    return Err(RelayError::Cancelled);
                }
                if !state.writer_alive {
                    return Err(RelayError::WriterDropped);
                }
            }

            tokio::select! {
                biased;
                _ = self.token.cancelled() => return Err(RelayError::Cancelled),
                _ = self.shared.data_ready.notified() => {}
            }
        }
    }

    /// Bytes taken out of the relay so far.
    pub fn consumed(&self) -> u64 {
        self.shared.read.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> RelayMetrics {
        self.shared.metrics()
    }
}

impl Drop for RelayReader {
    fn drop(&mut self) {
        self.shared.state.lock().reader_alive = false;
        self.shared.space_ready.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn drain(reader: &mut RelayReader, chunk: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = vec![0u8; chunk];
        loop {
            let n = reader.read(&mut buf).await.unwrap();
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[tokio::test]
    async fn bytes_come_out_in_write_order() {
        let (mut writer, mut reader) = BoundedRelay::with_capacity(64, CancellationToken::new());

        let expected: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let payload = expected.clone();
        let producer = tokio::spawn(async move {
            // Uneven chunk sizes, some larger than the capacity.
            let sizes = [1usize, 7, 64, 100, 3, 250];
            let mut rest = payload.as_slice();
            let mut i = 0;
            while !rest.is_empty() {
                let n = sizes[i % sizes.len()].min(rest.len());
                writer.write(&rest[..n]).await.unwrap();
                rest = &rest[n..];
                i += 1;
            }
            writer.complete();
            writer.metrics()
        });

        let received = drain(&mut reader, 13).await;
        let writer_metrics = producer.await.unwrap();

        assert_eq!(received, expected);
        assert_eq!(writer_metrics.written, expected.len() as u64);
        assert_eq!(reader.metrics().read, expected.len() as u64);
        assert_eq!(reader.metrics().buffered, 0);
    }

    #[tokio::test]
    async fn writer_suspends_at_capacity_until_reader_drains() {
        let (mut writer, mut reader) =
            BoundedRelay::with_capacity(4096, CancellationToken::new());

        let write = tokio::spawn(async move {
            writer.write(&[7u8; 5000]).await.unwrap();
            writer
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!write.is_finished(), "write of 5000 bytes must block at C = 4096");
        assert_eq!(reader.metrics().written, 4096);

        let mut buf = vec![0u8; 4096];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 4096);

        let writer = tokio::time::timeout(Duration::from_secs(1), write)
            .await
            .expect("writer resumes after drain")
            .unwrap();
        assert_eq!(writer.metrics().written, 5000);
    }

    #[tokio::test]
    async fn writer_stays_paused_above_low_watermark() {
        let (mut writer, mut reader) = BoundedRelay::with_capacity(100, CancellationToken::new());
        writer.write(&[1u8; 100]).await.unwrap();

        let write = tokio::spawn(async move {
            writer.write(&[2u8; 10]).await.unwrap();
        });

        // 100 -> 60 buffered, still above the watermark of 50.
        let mut buf = vec![0u8; 40];
        reader.read(&mut buf).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!write.is_finished());

        // 60 -> 40 buffered, below the watermark.
        let mut buf = vec![0u8; 20];
        reader.read(&mut buf).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), write)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn end_of_stream_is_reported_once_drained_and_stays() {
        let (mut writer, mut reader) = BoundedRelay::with_capacity(16, CancellationToken::new());
        writer.write(b"abc").await.unwrap();
        writer.complete();
        writer.complete();

        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
        assert!(reader.metrics().completed);

        assert_eq!(
            writer.write(b"late").await,
            Err(RelayError::WriteAfterComplete)
        );
    }

    #[tokio::test]
    async fn pending_read_wakes_on_complete() {
        let (writer, mut reader) = BoundedRelay::with_capacity(16, CancellationToken::new());
        let read = tokio::spawn(async move {
            let mut buf = [0u8; 4];
            reader.read(&mut buf).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer.complete();
        assert_eq!(read.await.unwrap(), Ok(0));
    }

    #[tokio::test]
    async fn cancellation_unblocks_both_sides() {
        let token = CancellationToken::new();
        let (mut writer, mut reader) = BoundedRelay::with_capacity(4, token.clone());
        writer.write(&[0u8; 4]).await.unwrap();

        let blocked_writer = tokio::spawn(async move { writer.write(&[1u8; 4]).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
        assert_eq!(blocked_writer.await.unwrap(), Err(RelayError::Cancelled));

        // Buffered bytes are still handed out; the next suspension sees the cancellation.
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).await, Ok(4));
        assert_eq!(reader.read(&mut buf).await, Err(RelayError::Cancelled));
    }

    #[tokio::test]
    async fn dropped_peers_surface_as_errors() {
        let (writer, mut reader) = BoundedRelay::with_capacity(8, CancellationToken::new());
        drop(writer);
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).await, Err(RelayError::WriterDropped));

        let (mut writer, reader) = BoundedRelay::with_capacity(8, CancellationToken::new());
        writer.write(&[0u8; 8]).await.unwrap();
        let blocked = tokio::spawn(async move { writer.write(&[0u8; 1]).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(reader);
        assert_eq!(blocked.await.unwrap(), Err(RelayError::ReaderDropped));
    }

    #[tokio::test]
    async fn copy_from_completes_the_relay() {
        let (mut writer, mut reader) = BoundedRelay::with_capacity(32, CancellationToken::new());
        let data: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
        let source = std::io::Cursor::new(data.clone());

        let producer = tokio::spawn(async move { writer.copy_from(source, 48).await });
        let received = drain(&mut reader, 17).await;

        assert_eq!(producer.await.unwrap().unwrap(), 1000);
        assert_eq!(received, data);
    }

    #[tokio::test]
    async fn mirror_sees_exactly_the_relayed_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirror.bin");

        let (mut writer, mut reader) = BoundedRelay::with_capacity(8, CancellationToken::new());
        writer.attach_mirror(Mirror::create(&path).await.unwrap());

        let producer = tokio::spawn(async move {
            writer.write(b"0123456789abcdef").await.unwrap();
            writer.complete();
            writer.finish_mirror().await;
        });
        let received = drain(&mut reader, 5).await;
        producer.await.unwrap();

        assert_eq!(received, b"0123456789abcdef");
        assert_eq!(std::fs::read(&path).unwrap(), b"0123456789abcdef");
    }
}
