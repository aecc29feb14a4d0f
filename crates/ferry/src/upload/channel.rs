use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::connector::{DuplexConnector, MessageStream};
use super::frame::FrameCodec;
use super::message::{ServerCapabilities, UploadDescriptor};
use crate::config::UploadConfig;
use crate::error::FerryError;
use crate::relay::{RelayError, RelayReader};
use crate::resilience::Credential;

/// Application close codes some servers use for rejected credentials.
const AUTH_CLOSE_CODES: [u16; 2] = [4001, 4003];

/// Lifecycle of one upload session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Connecting,
    AwaitingServerCapabilities,
    Negotiated,
    Streaming,
    Closing,
    Closed,
    Failed,
}

impl UploadState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

/// What is being uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub file_name: String,
    /// `None` for live or otherwise unbounded sources.
    pub total_size: Option<u64>,
}

impl UploadTarget {
    pub fn new(file_name: impl Into<String>, total_size: Option<u64>) -> Self {
        Self {
            file_name: file_name.into(),
            total_size,
        }
    }
}

/// Outcome of a completed session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSummary {
    pub bytes_sent: u64,
    pub frames_sent: u64,
    pub buffer_size: usize,
    /// Close code the server acknowledged with, if it sent one.
    pub close_code: Option<u16>,
}

/// Chunked upload protocol over one duplex connection.
pub struct ChunkedUploadChannel<S> {
    stream: S,
    config: UploadConfig,
    state: UploadState,
    codec: Option<FrameCodec>,
    buffer_size: usize,
    offset: u64,
    frames: u64,
}

impl<S: MessageStream> ChunkedUploadChannel<S> {
    /// Wrap an already-connected stream.
    pub fn new(stream: S, config: UploadConfig) -> Self {
        Self {
            stream,
            config,
            state: UploadState::AwaitingServerCapabilities,
            codec: None,
            buffer_size: 0,
            offset: 0,
            frames: 0,
        }
    }

    /// Connect through `connector` with `credential` attached.
    pub async fn open<C>(
        connector: &C,
        credential: &Credential,
        config: UploadConfig,
    ) -> Result<Self, FerryError>
    where
        C: DuplexConnector<Stream = S>,
    {
        trace!(state = ?UploadState::Connecting, "Upload channel state");
        let stream = connector.connect(credential).await?;
        Ok(Self::new(stream, config))
    }

    pub fn state(&self) -> UploadState {
        self.state
    }

    /// Bytes framed onto the wire so far; also the offset of the next frame.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames
    }

    /// Payload limit of the negotiated session.
    pub fn max_payload(&self) -> Option<usize> {
        self.codec.map(|codec| codec.max_payload())
    }

    fn transition(&mut self, next: UploadState) {
        trace!(from = ?self.state, to = ?next, "Upload channel state");
        self.state = next;
    }

    fn fail(&mut self, err: FerryError) -> FerryError {
        self.transition(UploadState::Failed);
        err
    }

    /// Wait for the server's capabilities and reply with the upload descriptor.
    ///
    /// Returns the buffer size the session will use.
    pub async fn negotiate(
        &mut self,
        target: &UploadTarget,
        token: &CancellationToken,
    ) -> Result<usize, FerryError> {
        if self.state != UploadState::AwaitingServerCapabilities {
            return Err(FerryError::protocol(
                "handshake",
                format!("cannot negotiate in state {:?}", self.state),
            ));
        }

        let wait = tokio::time::timeout(self.config.connect_timeout, self.next_capabilities());
        let capabilities = tokio::select! {
            biased;
            _ = token.cancelled() => {
                self.abort(CloseCode::Normal, "cancelled").await;
                return Err(FerryError::Cancelled);
            }
            result = wait => match result {
                Ok(Ok(caps)) => caps,
                Ok(Err(e)) => return Err(self.fail(e)),
                Err(_) => {
                    return Err(self.fail(FerryError::Timeout {
                        operation: "server capabilities",
                    }));
                }
            },
        };

        let buffer_size = match self.config.max_buffer_size {
            Some(cap) => capabilities.buffer_size.min(cap),
            None => capabilities.buffer_size,
        };
        let codec = match FrameCodec::new(self.config.length_width, buffer_size) {
            Ok(codec) => codec,
            Err(e) => return Err(self.fail(e)),
        };

        let descriptor = UploadDescriptor {
            file_name: target.file_name.clone(),
            total_file_size: target.total_size,
            buffer_size,
        };
        let json = descriptor.to_json().map_err(|e| self.fail(e))?;
        if let Err(e) = self.stream.send(Message::text(json)).await {
            return Err(self.fail(FerryError::channel("handshake", e)));
        }

        info!(
            proposed = capabilities.buffer_size,
            buffer_size,
            max_payload = codec.max_payload(),
            file_name = %target.file_name,
            total_size = ?target.total_size,
            "Upload session negotiated"
        );
        self.codec = Some(codec);
        self.buffer_size = buffer_size;
        self.transition(UploadState::Negotiated);
        Ok(buffer_size)
    }

    async fn next_capabilities(&mut self) -> Result<ServerCapabilities, FerryError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return ServerCapabilities::parse(text.as_str()),
                Some(Ok(Message::Binary(data))) => {
                    let text = std::str::from_utf8(&data).map_err(|_| {
                        FerryError::protocol("handshake", "capabilities message is not UTF-8")
                    })?;
                    return ServerCapabilities::parse(text);
                }
                Some(Ok(Message::Close(frame))) => return Err(closed_by_server(frame)),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(FerryError::channel("handshake", e)),
                None => return Err(FerryError::channel("handshake", WsError::ConnectionClosed)),
            }
        }
    }

    /// Send one data frame at the current offset.
    pub async fn send_frame(&mut self, payload: &[u8]) -> Result<(), FerryError> {
        let Some(codec) = self.codec else {
            return Err(FerryError::protocol(
                "streaming",
                "data frame before the session was negotiated",
            ));
        };
        match self.state {
            UploadState::Negotiated => self.transition(UploadState::Streaming),
            UploadState::Streaming => {}
            other => {
                return Err(FerryError::protocol(
                    "streaming",
                    format!("cannot send data in state {other:?}"),
                ));
            }
        }

        // Refused before anything reaches the wire; the session stays usable.
        let frame = codec.encode(self.offset, payload)?;
        if let Err(e) = self.stream.send(Message::Binary(frame)).await {
            return Err(self.fail(FerryError::channel("streaming", e)));
        }
        self.offset += payload.len() as u64;
        self.frames += 1;
        trace!(offset = self.offset, len = payload.len(), "Frame sent");
        Ok(())
    }

    /// Frame everything the relay yields until its end of stream.
    ///
    /// Server messages are watched while waiting for data so a policy close is
    /// reported as such instead of surfacing later as a send failure.
    pub async fn pump(
        &mut self,
        reader: &mut RelayReader,
        token: &CancellationToken,
    ) -> Result<u64, FerryError> {
        let Some(codec) = self.codec else {
            return Err(FerryError::protocol(
                "streaming",
                "relay pumped before the session was negotiated",
            ));
        };
        let mut buf = vec![0u8; codec.max_payload()];

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    self.abort(CloseCode::Normal, "cancelled").await;
                    return Err(FerryError::Cancelled);
                }
                incoming = self.stream.next() => self.on_incoming(incoming)?,
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        debug!(bytes = self.offset, frames = self.frames, "Relay drained");
                        return Ok(self.offset);
                    }
                    Ok(n) => self.send_frame(&buf[..n]).await?,
                    Err(RelayError::Cancelled) => {
                        self.abort(CloseCode::Normal, "cancelled").await;
                        return Err(FerryError::Cancelled);
                    }
                    Err(e) => {
                        self.abort(CloseCode::Error, "source failed").await;
                        return Err(FerryError::Relay(e));
                    }
                },
            }
        }
    }

    fn on_incoming(&mut self, incoming: Option<Result<Message, WsError>>) -> Result<(), FerryError> {
        match incoming {
            Some(Ok(Message::Text(text))) => {
                debug!(message = %text.as_str(), "Server progress");
                Ok(())
            }
            Some(Ok(Message::Close(frame))) => Err(self.fail(closed_by_server(frame))),
            Some(Ok(_)) => Ok(()),
            Some(Err(e)) => Err(self.fail(FerryError::channel("streaming", e))),
            None => Err(self.fail(FerryError::channel("streaming", WsError::ConnectionClosed))),
        }
    }

    /// Send the normal-closure frame and wait for the server's acknowledgement.
    ///
    /// A teardown without an acknowledgement also completes the close.
    pub async fn close(&mut self) -> Result<Option<u16>, FerryError> {
        match self.state {
            UploadState::Negotiated | UploadState::Streaming => {}
            other => {
                return Err(FerryError::protocol(
                    "close",
                    format!("cannot close in state {other:?}"),
                ));
            }
        }
        self.transition(UploadState::Closing);

        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: self.config.close_reason.clone().into(),
        };
        if let Err(e) = self.stream.send(Message::Close(Some(frame))).await {
            return Err(self.fail(FerryError::channel("close", e)));
        }

        let ack = tokio::time::timeout(self.config.close_timeout, self.await_close_ack()).await;
        let code = match ack {
            Ok(Ok(code)) => code,
            Ok(Err(e)) => return Err(self.fail(e)),
            Err(_) => {
                warn!(
                    timeout = ?self.config.close_timeout,
                    "Server did not acknowledge the close, tearing down"
                );
                None
            }
        };
        self.transition(UploadState::Closed);
        info!(
            bytes = self.offset,
            frames = self.frames,
            close_code = ?code,
            "Upload channel closed"
        );
        Ok(code)
    }

    async fn await_close_ack(&mut self) -> Result<Option<u16>, FerryError> {
        while let Some(incoming) = self.stream.next().await {
            match incoming {
                Ok(Message::Close(frame)) => {
                    let Some(frame) = frame else {
                        return Ok(None);
                    };
                    let code = u16::from(frame.code);
                    if is_authorization_close(code, frame.reason.as_str()) {
                        return Err(closed_by_server(Some(frame)));
                    }
                    return Ok(Some(code));
                }
                Ok(Message::Text(text)) => debug!(message = %text.as_str(), "Server progress"),
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "Connection torn down while closing");
                    return Ok(None);
                }
            }
        }
        Ok(None)
    }

    /// Best-effort close used on cancellation and local failures.
    async fn abort(&mut self, code: CloseCode, reason: &str) {
        if self.state.is_terminal() {
            return;
        }
        self.transition(UploadState::Closing);
        let frame = CloseFrame {
            code,
            reason: reason.to_owned().into(),
        };
        let send = self.stream.send(Message::Close(Some(frame)));
        match tokio::time::timeout(self.config.close_timeout, send).await {
            Ok(Ok(())) => debug!(reason, "Upload channel aborted"),
            Ok(Err(e)) => debug!(error = %e, "Close frame not delivered"),
            Err(_) => debug!("Timed out sending close frame"),
        }
        self.transition(if code == CloseCode::Normal {
            UploadState::Closed
        } else {
            UploadState::Failed
        });
    }

    /// Negotiate, stream the relay to its end and close.
    pub async fn run(
        &mut self,
        target: &UploadTarget,
        reader: &mut RelayReader,
        token: &CancellationToken,
    ) -> Result<UploadSummary, FerryError> {
        self.negotiate(target, token).await?;
        self.pump(reader, token).await?;
        let close_code = self.close().await?;
        Ok(UploadSummary {
            bytes_sent: self.offset,
            frames_sent: self.frames,
            buffer_size: self.buffer_size,
            close_code,
        })
    }
}

fn is_authorization_close(code: u16, reason: &str) -> bool {
    code == u16::from(CloseCode::Policy)
        || AUTH_CLOSE_CODES.contains(&code)
        || reason.to_ascii_lowercase().contains("unauthorized")
}

fn closed_by_server(frame: Option<CloseFrame>) -> FerryError {
    let (code, reason) = match frame {
        Some(frame) => (u16::from(frame.code), frame.reason.as_str().to_owned()),
        None => (u16::from(CloseCode::Status), String::new()),
    };
    FerryError::ChannelClosed {
        authorization: is_authorization_close(code, &reason),
        code,
        reason,
    }
}
