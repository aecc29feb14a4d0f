use reqwest::StatusCode;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::relay::RelayError;

/// Failure class inspected by the resilience layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection reset, timeout, name resolution, abrupt channel loss.
    Transient,
    /// The remote service rejected the credential.
    Authorization,
    /// Malformed handshake, oversized frame, unparseable manifest.
    Protocol,
    /// Content or configuration errors that no retry can fix.
    Fatal,
    /// The operation observed the cancellation token.
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum FerryError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("HTTP request failed during {operation}: {source}")]
    Network {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("duplex channel error during {stage}: {source}")]
    Channel {
        stage: &'static str,
        #[source]
        source: Box<WsError>,
    },

    #[error("duplex channel closed by server with code {code}: {reason}")]
    ChannelClosed {
        code: u16,
        reason: String,
        authorization: bool,
    },

    #[error("credential rejected: {reason}")]
    Unauthorized { reason: String },

    #[error("operation timed out: {operation}")]
    Timeout { operation: &'static str },

    #[error("protocol violation during {stage}: {reason}")]
    Protocol { stage: &'static str, reason: String },

    #[error("frame payload of {len} bytes exceeds the negotiated limit of {limit} bytes")]
    FrameTooLarge { len: usize, limit: usize },

    #[error("manifest {url} references no extractable media")]
    NoMedia { url: String },

    #[error("manifest {url} listed no segment after {polls} polls")]
    ManifestStalled { url: String, polls: u32 },

    #[error("segment {uri} unavailable after {attempts} attempt(s): {source}")]
    SegmentUnavailable {
        uri: String,
        attempts: u32,
        #[source]
        source: Box<FerryError>,
    },

    #[error("upload interrupted after {offset} bytes: {source}")]
    Interrupted {
        offset: u64,
        #[source]
        source: Box<FerryError>,
    },

    #[error("relay error: {0}")]
    Relay(RelayError),

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl From<RelayError> for FerryError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Cancelled => Self::Cancelled,
            other => Self::Relay(other),
        }
    }
}

impl FerryError {
    pub fn invalid_url(input: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.to_string(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn network(operation: &'static str, source: reqwest::Error) -> Self {
        Self::Network { operation, source }
    }

    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn channel(stage: &'static str, source: WsError) -> Self {
        Self::Channel {
            stage,
            source: Box::new(source),
        }
    }

    pub fn protocol(stage: &'static str, reason: impl Into<String>) -> Self {
        Self::Protocol {
            stage,
            reason: reason.into(),
        }
    }

    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::Unauthorized {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Unauthorized { .. } => ErrorKind::Authorization,
            Self::ChannelClosed { authorization, .. } => {
                if *authorization {
                    ErrorKind::Authorization
                } else {
                    ErrorKind::Transient
                }
            }
            Self::Network { source, .. } => {
                if is_retryable_reqwest_error(source) {
                    ErrorKind::Transient
                } else {
                    ErrorKind::Fatal
                }
            }
            Self::HttpStatus { status, .. } => classify_status(*status),
            Self::Channel { source, .. } => classify_ws_error(source),
            Self::Timeout { .. } => ErrorKind::Transient,
            Self::Protocol { .. } | Self::FrameTooLarge { .. } => ErrorKind::Protocol,
            Self::Relay(RelayError::Cancelled) => ErrorKind::Cancelled,
            Self::InvalidUrl { .. }
            | Self::Configuration { .. }
            | Self::NoMedia { .. }
            | Self::ManifestStalled { .. }
            | Self::SegmentUnavailable { .. }
            | Self::Interrupted { .. }
            | Self::Relay(_)
            | Self::Io { .. } => ErrorKind::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn is_authorization(&self) -> bool {
        self.kind() == ErrorKind::Authorization
    }
}

/// Classify a reqwest error as retryable or non-retryable.
///
/// Retryable: connect, timeout, request, body read, and decode errors.
/// Non-retryable: redirect and builder errors.
pub fn is_retryable_reqwest_error(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() || e.is_decode()
}

fn classify_status(status: StatusCode) -> ErrorKind {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        ErrorKind::Authorization
    } else if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        ErrorKind::Transient
    } else {
        ErrorKind::Fatal
    }
}

fn classify_ws_error(error: &WsError) -> ErrorKind {
    match error {
        WsError::ConnectionClosed | WsError::AlreadyClosed | WsError::Io(_) => {
            ErrorKind::Transient
        }
        // Reset without a closing handshake and friends: the peer vanished.
        WsError::Protocol(_) => ErrorKind::Transient,
        WsError::Http(response) => {
            let status = StatusCode::from_u16(response.status().as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            classify_status(status)
        }
        WsError::Url(_) | WsError::HttpFormat(_) => ErrorKind::Fatal,
        WsError::Capacity(_) | WsError::AttackAttempt => ErrorKind::Protocol,
        _ => ErrorKind::Transient,
    }
}
