//! Per-manifest bookkeeping: dedup, start offset, duration cap and poll pacing.

use std::collections::HashSet;
use std::time::Duration;

use bytes::Bytes;

use super::manifest::SegmentDescriptor;

/// Backoff steps stop growing after this many consecutive empty polls.
const MAX_BACKOFF_STEPS: u32 = 5;
const BACKOFF_FACTOR: f64 = 1.5;

/// Decision for one listed segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Already processed earlier in this session.
    Duplicate,
    /// New, but discarded to honour the start offset; not downloaded.
    Skip,
    /// New and should be downloaded and forwarded.
    Forward,
    /// New, but the duration cap has already been reached.
    TargetReached,
}

/// State of one manifest session.
#[derive(Debug)]
pub struct ManifestSession {
    seen: HashSet<String>,
    sent_duration: Duration,
    skip_remaining: Duration,
    target_duration: Option<Duration>,
    no_new_segment_streak: u32,
    identical_polls: u32,
    last_new_segments: usize,
    ever_listed: bool,
    last_body: Option<Bytes>,
}

impl ManifestSession {
    pub fn new(start_offset: Duration, target_duration: Option<Duration>) -> Self {
        Self {
            seen: HashSet::new(),
            sent_duration: Duration::ZERO,
            skip_remaining: start_offset,
            target_duration,
            no_new_segment_streak: 0,
            identical_polls: 0,
            last_new_segments: 0,
            ever_listed: false,
            last_body: None,
        }
    }

    /// Mark `segment` seen and decide what to do with it.
    pub fn admit(&mut self, segment: &SegmentDescriptor) -> Admission {
        self.ever_listed = true;
        if !self.seen.insert(segment.identity.clone()) {
            return Admission::Duplicate;
        }
        if !self.skip_remaining.is_zero() {
            self.skip_remaining = self.skip_remaining.saturating_sub(segment.duration);
            return Admission::Skip;
        }
        if self.target_reached() {
            return Admission::TargetReached;
        }
        Admission::Forward
    }

    pub fn record_forwarded(&mut self, duration: Duration) {
        self.sent_duration += duration;
    }

    pub fn target_reached(&self) -> bool {
        self.target_duration
            .is_some_and(|target| self.sent_duration >= target)
    }

    /// Remember the manifest body; returns true when it is byte-identical to the previous one.
    pub fn observe_body(&mut self, body: &Bytes) -> bool {
        let identical = self.last_body.as_ref() == Some(body);
        if identical {
            self.identical_polls += 1;
        } else {
            self.identical_polls = 0;
            self.last_body = Some(body.clone());
        }
        identical
    }

    /// Account for one completed poll that surfaced `new_segments` unseen segments.
    pub fn record_poll(&mut self, new_segments: usize) {
        self.last_new_segments = new_segments;
        if new_segments == 0 {
            self.no_new_segment_streak += 1;
        } else {
            self.no_new_segment_streak = 0;
        }
    }

    /// Delay before the next poll.
    ///
    /// Base is half the playlist target duration but never below `poll_interval`;
    /// each consecutive empty poll multiplies it by 1.5 (up to five steps). Catching
    /// up on several new segments polls at `min`.
    pub fn next_poll_interval(
        &self,
        playlist_target: Duration,
        poll_interval: Duration,
        min: Duration,
        max: Duration,
    ) -> Duration {
        let max = max.max(min);
        // The playlist target is remote input; clamp before scaling.
        let base = (playlist_target / 2).max(poll_interval).min(max);
        let interval = if self.last_new_segments >= 2 {
            min
        } else if self.no_new_segment_streak > 0 {
            let steps = self.no_new_segment_streak.min(MAX_BACKOFF_STEPS) as i32;
            Duration::try_from_secs_f64(base.as_secs_f64() * BACKOFF_FACTOR.powi(steps))
                .unwrap_or(max)
        } else {
            base
        };
        interval.max(min).min(max)
    }

    pub fn sent_duration(&self) -> Duration {
        self.sent_duration
    }

    pub fn no_new_segment_streak(&self) -> u32 {
        self.no_new_segment_streak
    }

    pub fn identical_polls(&self) -> u32 {
        self.identical_polls
    }

    /// Whether any poll has listed at least one segment.
    pub fn ever_listed(&self) -> bool {
        self.ever_listed
    }
}
