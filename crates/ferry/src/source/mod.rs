//! Segmented-manifest source: turns a growing HLS playlist into one ordered byte stream.
//!
//! The reader polls the playlist, admits every newly listed segment exactly once,
//! discards whole segments to honour a start offset, downloads the rest in order and
//! writes them into the relay. It concludes when the origin marks the playlist
//! complete, when the duration cap is reached, or after a run of polls without new
//! segments.

mod http;
mod manifest;
mod session;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, trace};
use url::Url;

pub use http::{HttpSegmentSource, create_client};
pub use manifest::{
    ByteRange, MediaManifest, ParsedManifest, SegmentDescriptor, Variant, parse_manifest,
    select_variant,
};
pub use session::{Admission, ManifestSession};

use crate::config::SourceConfig;
use crate::error::FerryError;
use crate::relay::RelayWriter;
use crate::resilience::retry_with_backoff;

/// Where manifests and segments come from.
#[async_trait]
pub trait SegmentSource: Send + Sync {
    async fn fetch_manifest(&self, url: &Url) -> Result<Bytes, FerryError>;

    async fn fetch_segment(&self, segment: &SegmentDescriptor) -> Result<Bytes, FerryError>;
}

/// Progress of a source run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub polls: u64,
    pub segments_forwarded: u64,
    pub segments_skipped: u64,
    pub bytes_forwarded: u64,
    pub duration_forwarded: Duration,
    /// URL of the last segment written into the relay.
    pub last_segment: Option<String>,
}

pub struct SegmentedSourceReader {
    source: Arc<dyn SegmentSource>,
    manifest_url: Url,
    config: SourceConfig,
    stats: SourceStats,
}

impl SegmentedSourceReader {
    pub fn new(source: Arc<dyn SegmentSource>, manifest_url: Url, config: SourceConfig) -> Self {
        Self {
            source,
            manifest_url,
            config,
            stats: SourceStats::default(),
        }
    }

    pub fn stats(&self) -> &SourceStats {
        &self.stats
    }

    /// Feed the relay until the manifest session concludes, then complete the relay.
    pub async fn run(
        &mut self,
        writer: &mut RelayWriter,
        token: &CancellationToken,
    ) -> Result<SourceStats, FerryError> {
        let span = info_span!("source", manifest = %self.manifest_url);
        self.poll_loop(writer, token).instrument(span).await
    }

    async fn poll_loop(
        &mut self,
        writer: &mut RelayWriter,
        token: &CancellationToken,
    ) -> Result<SourceStats, FerryError> {
        let (media_url, mut pending_body) = self.resolve_media_url(token).await?;
        let mut session = ManifestSession::new(self.config.start_offset, self.config.max_duration);
        let mut playlist_target = Duration::ZERO;

        loop {
            let body = match pending_body.take() {
                Some(body) => body,
                None => self.fetch_manifest(&media_url, token).await?,
            };
            self.stats.polls += 1;

            let mut new_segments = 0usize;
            let mut complete = false;
            let mut target_reached = false;

            if session.observe_body(&body) {
                trace!(identical = session.identical_polls(), "Manifest unchanged");
            } else {
                let manifest = match parse_manifest(&body, &media_url)? {
                    ParsedManifest::Media(manifest) => manifest,
                    ParsedManifest::Master(_) => {
                        return Err(FerryError::protocol(
                            "manifest parse",
                            format!("{media_url} changed from a media to a master playlist"),
                        ));
                    }
                };
                playlist_target = manifest.target_duration;
                complete = manifest.complete;

                for segment in &manifest.segments {
                    match session.admit(segment) {
                        Admission::Duplicate => {}
                        Admission::Skip => {
                            new_segments += 1;
                            self.stats.segments_skipped += 1;
                            debug!(uri = %segment.uri, duration = ?segment.duration, "Skipping segment before start offset");
                        }
                        Admission::TargetReached => {
                            target_reached = true;
                            break;
                        }
                        Admission::Forward => {
                            new_segments += 1;
                            let data = self.fetch_segment(segment, token).await?;
                            writer.write(&data).await?;
                            session.record_forwarded(segment.duration);

                            self.stats.segments_forwarded += 1;
                            self.stats.bytes_forwarded += data.len() as u64;
                            self.stats.duration_forwarded = session.sent_duration();
                            self.stats.last_segment = Some(segment.uri.to_string());
                            debug!(uri = %segment.uri, len = data.len(), "Segment forwarded");

                            if session.target_reached() {
                                target_reached = true;
                                break;
                            }
                        }
                    }
                }
            }
            session.record_poll(new_segments);

            if target_reached {
                info!(sent = ?session.sent_duration(), "Duration cap reached");
                break;
            }
            if complete {
                if !session.ever_listed() {
                    return Err(FerryError::NoMedia {
                        url: media_url.to_string(),
                    });
                }
                info!(segments = self.stats.segments_forwarded, "Manifest complete");
                break;
            }

            let streak = session.no_new_segment_streak();
            if session.ever_listed() {
                if streak >= self.config.empty_poll_limit {
                    info!(polls = streak, "No new segments, concluding");
                    break;
                }
            } else if streak >= self.config.stall_poll_limit {
                return Err(FerryError::ManifestStalled {
                    url: media_url.to_string(),
                    polls: streak,
                });
            }

            let delay = session.next_poll_interval(
                playlist_target,
                self.config.poll_interval,
                self.config.min_poll_interval,
                self.config.max_poll_interval,
            );
            trace!(delay_ms = delay.as_millis() as u64, streak, "Waiting for next poll");
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(FerryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        writer.complete();
        Ok(self.stats.clone())
    }

    /// Follow a master playlist to the media playlist chosen by the variant policy.
    ///
    /// Also returns the body of the media playlist when it was the first fetch.
    async fn resolve_media_url(
        &self,
        token: &CancellationToken,
    ) -> Result<(Url, Option<Bytes>), FerryError> {
        let body = self.fetch_manifest(&self.manifest_url, token).await?;
        match parse_manifest(&body, &self.manifest_url)? {
            ParsedManifest::Media(_) => Ok((self.manifest_url.clone(), Some(body))),
            ParsedManifest::Master(variants) => {
                let variant = select_variant(&variants, self.config.variant_policy).ok_or_else(
                    || FerryError::NoMedia {
                        url: self.manifest_url.to_string(),
                    },
                )?;
                info!(
                    variant = %variant.uri,
                    bandwidth = variant.bandwidth,
                    policy = ?self.config.variant_policy,
                    "Selected variant"
                );
                Ok((variant.uri.clone(), None))
            }
        }
    }

    async fn fetch_manifest(
        &self,
        url: &Url,
        token: &CancellationToken,
    ) -> Result<Bytes, FerryError> {
        let source = &self.source;
        retry_with_backoff(&self.config.fetch_retry, token, move |_| async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => Err(FerryError::Cancelled),
                result = source.fetch_manifest(url) => result,
            }
        })
        .await
    }

    async fn fetch_segment(
        &self,
        segment: &SegmentDescriptor,
        token: &CancellationToken,
    ) -> Result<Bytes, FerryError> {
        let source = &self.source;
        let mut attempts = 0u32;
        let counter = &mut attempts;
        let result = retry_with_backoff(&self.config.fetch_retry, token, move |_| {
            *counter += 1;
            async move {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(FerryError::Cancelled),
                    result = source.fetch_segment(segment) => result,
                }
            }
        })
        .await;

        result.map_err(|err| {
            if matches!(err, FerryError::Cancelled) || err.is_authorization() {
                err
            } else {
                FerryError::SegmentUnavailable {
                    uri: segment.uri.to_string(),
                    attempts,
                    source: Box::new(err),
                }
            }
        })
    }
}
