//! One upload run: producer task → relay → upload channel task.
//!
//! The producer (manifest reader or raw byte stream) and the consumer (upload
//! session) communicate only through the relay. The first task to fail cancels its
//! sibling; the run then settles on the root cause and reports it with the progress
//! made so far.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::AsyncRead;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};
use url::Url;

use crate::config::FerryConfig;
use crate::error::FerryError;
use crate::relay::{BoundedRelay, Mirror, RelayMetrics, RelayReader, RelayWriter};
use crate::resilience::ResilientInvoker;
use crate::source::{SegmentSource, SegmentedSourceReader, SourceStats};
use crate::upload::{ChunkedUploadChannel, DuplexConnector, UploadSummary, UploadTarget};

/// Read size used when pumping a raw byte stream into the relay.
const COPY_CHUNK_SIZE: usize = 64 * 1024;

/// What feeds the relay.
pub enum MediaSource {
    /// A (possibly live) HLS playlist.
    Manifest {
        source: Arc<dyn SegmentSource>,
        url: Url,
    },
    /// Any byte stream: a local file, a transcoder's stdout.
    Reader(Box<dyn AsyncRead + Send + Unpin>),
}

impl fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Manifest { url, .. } => f.debug_struct("Manifest").field("url", url).finish(),
            Self::Reader(_) => f.write_str("Reader"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Source,
    Upload,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => f.write_str("source"),
            Self::Upload => f.write_str("upload"),
        }
    }
}

/// Classified failure of a run, with the progress that survived it.
#[derive(Debug, thiserror::Error)]
#[error("{stage} stage failed after {last_offset} bytes: {error}")]
pub struct PipelineFailure {
    pub stage: Stage,
    #[source]
    pub error: FerryError,
    /// Bytes the upload channel transmitted before the failure.
    pub last_offset: u64,
    /// Last segment written into the relay, for manifest sources.
    pub last_segment: Option<String>,
    pub source_stats: Option<SourceStats>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub upload: UploadSummary,
    pub source: Option<SourceStats>,
    pub relay: RelayMetrics,
}

type ProducerOutcome = (Result<(), FerryError>, Option<SourceStats>, RelayMetrics);

pub struct UploadPipeline<C> {
    connector: Arc<C>,
    invoker: ResilientInvoker,
    config: FerryConfig,
}

impl<C> UploadPipeline<C>
where
    C: DuplexConnector + 'static,
{
    pub fn new(connector: C, invoker: ResilientInvoker, config: FerryConfig) -> Self {
        Self {
            connector: Arc::new(connector),
            invoker,
            config,
        }
    }

    /// Run one upload to completion.
    ///
    /// `cancel` is the caller's token; the run works on a child of it.
    pub async fn run(
        &self,
        media: MediaSource,
        target: UploadTarget,
        cancel: &CancellationToken,
    ) -> Result<UploadReport, PipelineFailure> {
        let span = info_span!("pipeline", file = %target.file_name);
        self.run_inner(media, target, cancel).instrument(span).await
    }

    async fn run_inner(
        &self,
        media: MediaSource,
        target: UploadTarget,
        cancel: &CancellationToken,
    ) -> Result<UploadReport, PipelineFailure> {
        let token = cancel.child_token();
        let (writer, reader) = BoundedRelay::new(&self.config.relay, token.clone());
        let progress = Arc::new(AtomicU64::new(0));

        info!(
            ?media,
            capacity = self.config.relay.capacity,
            total_size = ?target.total_size,
            "Starting upload"
        );

        let producer = self.spawn_producer(media, writer, token.clone()).await;
        let consumer = self.spawn_consumer(reader, target, token.clone(), progress.clone());

        let (producer, consumer) = tokio::join!(producer, consumer);
        let (produced, source_stats, relay) = match producer {
            Ok(outcome) => outcome,
            Err(e) => (Err(join_failure("producer", e)), None, RelayMetrics::default()),
        };
        let uploaded = consumer.unwrap_or_else(|e| Err(join_failure("consumer", e)));

        let last_offset = progress.load(Ordering::Acquire);
        match settle(produced, uploaded) {
            Ok(upload) => {
                info!(
                    bytes = upload.bytes_sent,
                    frames = upload.frames_sent,
                    "Upload finished"
                );
                Ok(UploadReport {
                    upload,
                    source: source_stats,
                    relay,
                })
            }
            Err((stage, error)) => {
                warn!(%stage, error = %error, last_offset, "Upload failed");
                Err(PipelineFailure {
                    stage,
                    error,
                    last_offset,
                    last_segment: source_stats.as_ref().and_then(|s| s.last_segment.clone()),
                    source_stats,
                })
            }
        }
    }

    async fn spawn_producer(
        &self,
        media: MediaSource,
        mut writer: RelayWriter,
        token: CancellationToken,
    ) -> JoinHandle<ProducerOutcome> {
        if let Some(path) = &self.config.relay.mirror_path {
            match Mirror::create(path).await {
                Ok(mirror) => writer.attach_mirror(mirror),
                Err(e) => warn!(path = %path.display(), error = %e, "Relay mirror unavailable"),
            }
        }

        let source_config = self.config.source.clone();
        tokio::spawn(
            async move {
                let (result, stats) = match media {
                    MediaSource::Manifest { source, url } => {
                        let mut reader = SegmentedSourceReader::new(source, url, source_config);
                        let result = reader.run(&mut writer, &token).await.map(|_| ());
                        (result, Some(reader.stats().clone()))
                    }
                    MediaSource::Reader(input) => {
                        let result = writer
                            .copy_from(input, COPY_CHUNK_SIZE)
                            .await
                            .map(|_| ());
                        (result, None)
                    }
                };
                if let Err(e) = &result {
                    if !matches!(e, FerryError::Cancelled) {
                        warn!(error = %e, "Producer failed, cancelling upload");
                    }
                    token.cancel();
                }
                writer.finish_mirror().await;
                let metrics = writer.metrics();
                (result, stats, metrics)
            }
            .in_current_span(),
        )
    }

    fn spawn_consumer(
        &self,
        reader: RelayReader,
        target: UploadTarget,
        token: CancellationToken,
        progress: Arc<AtomicU64>,
    ) -> JoinHandle<Result<UploadSummary, FerryError>> {
        let reader = Arc::new(Mutex::new(reader));
        let connector = self.connector.clone();
        let invoker = self.invoker.clone();
        let upload_config = self.config.upload.clone();

        tokio::spawn(
            async move {
                let result = invoker
                    .invoke("upload session", &token, |credential| {
                        let reader = reader.clone();
                        let connector = connector.clone();
                        let config = upload_config.clone();
                        let target = target.clone();
                        let token = token.clone();
                        let progress = progress.clone();
                        async move {
                            let mut relay = reader.lock().await;
                            let mut channel =
                                ChunkedUploadChannel::open(&*connector, &credential, config).await?;
                            let result = channel.run(&target, &mut relay, &token).await;
                            progress.store(channel.offset(), Ordering::Release);

                            match result {
                                Err(err)
                                    if relay.consumed() > 0
                                        && !matches!(err, FerryError::Cancelled) =>
                                {
                                    // Bytes already left the relay; a new session would
                                    // restart at offset zero and corrupt the remote file.
                                    Err(FerryError::Interrupted {
                                        offset: channel.offset(),
                                        source: Box::new(err),
                                    })
                                }
                                other => other,
                            }
                        }
                    })
                    .await;
                if let Err(e) = &result {
                    if !matches!(e, FerryError::Cancelled) {
                        warn!(error = %e, "Upload session failed, cancelling producer");
                    }
                    token.cancel();
                }
                result
            }
            .in_current_span(),
        )
    }
}

fn join_failure(task: &str, e: tokio::task::JoinError) -> FerryError {
    if e.is_cancelled() {
        FerryError::Cancelled
    } else {
        FerryError::Io {
            source: std::io::Error::other(format!("{task} task panicked: {e}")),
        }
    }
}

/// Failures that are only consequences of the sibling's failure.
fn is_secondary(err: &FerryError) -> bool {
    matches!(err, FerryError::Cancelled | FerryError::Relay(_))
}

/// Pick the root cause of a run; the producer wins when both failed on their own.
fn settle(
    produced: Result<(), FerryError>,
    uploaded: Result<UploadSummary, FerryError>,
) -> Result<UploadSummary, (Stage, FerryError)> {
    match (produced, uploaded) {
        (Ok(()), Ok(summary)) => Ok(summary),
        (Err(p), Ok(_)) => Err((Stage::Source, p)),
        (Ok(()), Err(c)) => Err((Stage::Upload, c)),
        (Err(p), Err(c)) => {
            if !is_secondary(&p) || is_secondary(&c) {
                Err((Stage::Source, p))
            } else {
                Err((Stage::Upload, c))
            }
        }
    }
}
