//! Chunked upload protocol over a duplex (WebSocket) connection.
//!
//! A session runs `Connecting → AwaitingServerCapabilities → Negotiated →
//! Streaming → Closing → Closed`, with `Failed` reachable from any non-terminal
//! state:
//!
//! 1. the server proposes a `BufferSize` in a JSON text message,
//! 2. the client answers with `FileName`, `TotalFileSize` and its chosen `BufferSize`,
//! 3. relay bytes travel as binary frames tagged with their running offset,
//! 4. a normal-closure frame ends the session once the relay is drained.

mod channel;
mod connector;
mod frame;
mod message;

pub use channel::{ChunkedUploadChannel, UploadState, UploadSummary, UploadTarget};
pub use connector::{DuplexConnector, MessageStream, WsConnector};
pub use frame::{FrameCodec, LengthWidth, OFFSET_FIELD_LEN};
pub use message::{ServerCapabilities, UploadDescriptor};
