use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, Stream};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, header::AUTHORIZATION};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;
use url::Url;

use crate::config::{CredentialPlacement, UploadConfig};
use crate::error::FerryError;
use crate::resilience::Credential;

/// Message stream the upload channel runs over.
pub trait MessageStream:
    Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Send + Unpin
{
}

impl<T> MessageStream for T where
    T: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Send + Unpin
{
}

/// Opens an authenticated duplex connection to the upload endpoint.
#[async_trait]
pub trait DuplexConnector: Send + Sync {
    type Stream: MessageStream;

    async fn connect(&self, credential: &Credential) -> Result<Self::Stream, FerryError>;
}

/// WebSocket connector; the credential travels as a bearer header or a query parameter.
#[derive(Debug, Clone)]
pub struct WsConnector {
    endpoint: Url,
    placement: CredentialPlacement,
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(endpoint: Url, config: &UploadConfig) -> Result<Self, FerryError> {
        match endpoint.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(FerryError::invalid_url(
                    endpoint.as_str(),
                    format!("unsupported scheme `{other}`, expected ws or wss"),
                ));
            }
        }
        Ok(Self {
            endpoint,
            placement: config.credential_placement.clone(),
            connect_timeout: config.connect_timeout,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl DuplexConnector for WsConnector {
    type Stream = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn connect(&self, credential: &Credential) -> Result<Self::Stream, FerryError> {
        let mut url = self.endpoint.clone();
        if let CredentialPlacement::QueryParameter(name) = &self.placement {
            url.query_pairs_mut().append_pair(name, credential.secret());
        }

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| FerryError::channel("connect", e))?;
        if self.placement == CredentialPlacement::BearerHeader {
            let value = HeaderValue::from_str(&format!("Bearer {}", credential.secret()))
                .map_err(|_| FerryError::configuration("credential is not a valid header value"))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        crate::tls::install_rustls_provider();
        debug!(endpoint = %self.endpoint, "Connecting upload channel");
        let (stream, response) = tokio::time::timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| FerryError::Timeout {
                operation: "upload channel connect",
            })?
            .map_err(|e| FerryError::channel("connect", e))?;
        debug!(status = %response.status(), "Upload channel connected");
        Ok(stream)
    }
}
