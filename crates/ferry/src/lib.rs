//! Ferry: streams media into a remote chunked-upload endpoint.
//!
//! A producer (a live HLS playlist or any byte stream) feeds a bounded relay; an
//! upload session drains the relay into offset-tagged binary frames over a
//! WebSocket. Transient failures are retried and expired credentials refreshed
//! before the session is abandoned.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod relay;
pub mod resilience;
pub mod source;
mod tls;
pub mod upload;

pub use config::{
    CredentialPlacement, FerryConfig, HttpConfig, RelayConfig, ResilienceConfig, SourceConfig,
    UploadConfig, VariantPolicy,
};
pub use error::{ErrorKind, FerryError};
pub use pipeline::{MediaSource, PipelineFailure, Stage, UploadPipeline, UploadReport};
pub use relay::{BoundedRelay, RelayError, RelayMetrics, RelayReader, RelayWriter};
pub use resilience::{
    Authenticator, Backoff, Credential, CredentialStore, FixedCredential, HttpAuthenticator,
    ResilientInvoker, RetryPolicy,
};
pub use source::{HttpSegmentSource, SegmentSource, SegmentedSourceReader, SourceStats};
pub use upload::{ChunkedUploadChannel, UploadSummary, UploadTarget, WsConnector};
