use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use reqwest::header::RANGE;
use tracing::trace;
use url::Url;

use super::SegmentSource;
use super::manifest::{ByteRange, SegmentDescriptor};
use crate::config::HttpConfig;
use crate::error::FerryError;

/// Build the shared HTTP client from `config`.
pub fn create_client(config: &HttpConfig) -> Result<Client, FerryError> {
    crate::tls::install_rustls_provider();

    let mut builder = Client::builder()
        .pool_max_idle_per_host(5)
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.timeout.is_zero() {
        builder = builder.timeout(config.timeout);
    }

    if !config.connect_timeout.is_zero() {
        builder = builder.connect_timeout(config.connect_timeout);
    }

    if !config.pool_idle_timeout.is_zero() {
        builder = builder.pool_idle_timeout(config.pool_idle_timeout);
    }

    builder
        .build()
        .map_err(|e| FerryError::configuration(format!("failed to build HTTP client: {e}")))
}

/// Manifests and segments over plain HTTP(S) GET.
#[derive(Debug, Clone)]
pub struct HttpSegmentSource {
    client: Client,
    params: Vec<(String, String)>,
}

impl HttpSegmentSource {
    pub fn new(config: &HttpConfig) -> Result<Self, FerryError> {
        Ok(Self::with_client(create_client(config)?, config.params.clone()))
    }

    pub fn with_client(client: Client, params: Vec<(String, String)>) -> Self {
        Self { client, params }
    }

    async fn get(
        &self,
        url: &Url,
        range: Option<ByteRange>,
        operation: &'static str,
    ) -> Result<Bytes, FerryError> {
        let mut request = self.client.get(url.clone()).query(&self.params);
        if let Some(range) = range {
            request = request.header(RANGE, range.header_value());
        }

        let response = request
            .send()
            .await
            .map_err(|e| FerryError::network(operation, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FerryError::http_status(status, url.as_str(), operation));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FerryError::network(operation, e))?;
        trace!(url = %url, len = body.len(), operation, "Fetched");
        Ok(body)
    }
}

#[async_trait]
impl SegmentSource for HttpSegmentSource {
    async fn fetch_manifest(&self, url: &Url) -> Result<Bytes, FerryError> {
        self.get(url, None, "manifest fetch").await
    }

    async fn fetch_segment(&self, segment: &SegmentDescriptor) -> Result<Bytes, FerryError> {
        self.get(&segment.uri, segment.byte_range, "segment fetch").await
    }
}
