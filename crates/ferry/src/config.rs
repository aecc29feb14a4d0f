use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::resilience::{Backoff, RetryPolicy};
use crate::upload::LengthWidth;

pub const DEFAULT_USER_AGENT: &str = concat!("ferry/", env!("CARGO_PKG_VERSION"));

/// HTTP client options shared by manifest polling, segment downloads and login.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Overall timeout for a single request (zero disables it)
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Idle timeout for pooled connections
    pub pool_idle_timeout: Duration,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    /// User agent string
    pub user_agent: String,

    /// Custom HTTP headers for requests
    pub headers: HeaderMap,

    /// Custom query parameters appended to every manifest and segment request
    pub params: Vec<(String, String)>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            pool_idle_timeout: Duration::from_secs(30),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: HttpConfig::get_default_headers(),
            params: Vec::new(),
        }
    }
}

impl HttpConfig {
    /// Adds a header; invalid names or values are ignored.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));

        default_headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate"),
        );

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );
        default_headers
    }
}

/// Sizing of the producer/consumer relay.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Maximum number of buffered, unread bytes
    pub capacity: usize,
    /// A writer suspended at `capacity` resumes once the buffered byte count
    /// drops to this value. `None` means half the capacity.
    pub low_watermark: Option<usize>,
    /// Append-only diagnostic copy of every relayed chunk
    pub mirror_path: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            capacity: 4 * 1024 * 1024,
            low_watermark: None,
            mirror_path: None,
        }
    }
}

impl RelayConfig {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_mirror(mut self, path: impl Into<PathBuf>) -> Self {
        self.mirror_path = Some(path.into());
        self
    }

    pub(crate) fn effective_low_watermark(&self) -> usize {
        self.low_watermark
            .unwrap_or(self.capacity / 2)
            .min(self.capacity.saturating_sub(1))
    }
}

/// Variant selection when the manifest URL points at a master playlist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VariantPolicy {
    #[default]
    HighestBandwidth,
    LowestBandwidth,
    /// First variant that carries audio and no video
    AudioOnly,
}

/// Manifest polling and segment download behaviour.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Media to discard from the start of the stream
    pub start_offset: Duration,
    /// Stop forwarding once this much media has been sent (`None` = unbounded)
    pub max_duration: Option<Duration>,
    /// Base interval between manifest polls
    pub poll_interval: Duration,
    /// Lower clamp for the adaptive poll interval
    pub min_poll_interval: Duration,
    /// Upper clamp for the adaptive poll interval
    pub max_poll_interval: Duration,
    /// Consecutive polls without new segments before the session concludes
    pub empty_poll_limit: u32,
    /// Identical polls of a manifest that never listed a segment before giving up
    pub stall_poll_limit: u32,
    /// Retry policy for manifest and segment fetches
    pub fetch_retry: RetryPolicy,
    pub variant_policy: VariantPolicy,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            start_offset: Duration::ZERO,
            max_duration: None,
            poll_interval: Duration::from_secs(2),
            min_poll_interval: Duration::from_millis(500),
            max_poll_interval: Duration::from_secs(10),
            empty_poll_limit: 15,
            stall_poll_limit: 150,
            fetch_retry: RetryPolicy {
                max_retries: 3,
                backoff: Backoff::Fixed(Duration::from_secs(1)),
                max_delay: Duration::from_secs(1),
                jitter: false,
            },
            variant_policy: VariantPolicy::default(),
        }
    }
}

impl SourceConfig {
    pub fn with_start_offset(mut self, offset: Duration) -> Self {
        self.start_offset = offset;
        self
    }

    pub fn with_max_duration(mut self, duration: Option<Duration>) -> Self {
        self.max_duration = duration;
        self
    }

    /// Sets the base interval, lowering the minimum clamp when needed.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self.min_poll_interval = self.min_poll_interval.min(interval);
        self
    }
}

/// Where the credential travels on the duplex connection request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialPlacement {
    /// `Authorization: Bearer <token>`
    BearerHeader,
    /// `?<name>=<token>` on the endpoint URL
    QueryParameter(String),
}

/// Chunked upload channel options.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Client-side cap on the buffer size; the server's proposal wins when smaller
    pub max_buffer_size: Option<usize>,
    /// Width of the frame length field
    pub length_width: LengthWidth,
    pub credential_placement: CredentialPlacement,
    pub connect_timeout: Duration,
    /// How long to wait for the server to acknowledge the close frame
    pub close_timeout: Duration,
    /// Reason sent with the normal-closure frame
    pub close_reason: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_buffer_size: None,
            length_width: LengthWidth::U16,
            credential_placement: CredentialPlacement::BearerHeader,
            connect_timeout: Duration::from_secs(15),
            close_timeout: Duration::from_secs(10),
            close_reason: "file sent".to_owned(),
        }
    }
}

/// Retry and re-authentication policy applied by the resilient invoker.
#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    /// Transient-failure retry policy (innermost)
    pub retry: RetryPolicy,
    /// Re-authentication cycles per invocation (outermost)
    pub auth_retries: u32,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            auth_retries: 1,
        }
    }
}

/// Everything one pipeline needs, grouped.
#[derive(Debug, Clone, Default)]
pub struct FerryConfig {
    pub http: HttpConfig,
    pub relay: RelayConfig,
    pub source: SourceConfig,
    pub upload: UploadConfig,
    pub resilience: ResilienceConfig,
}
