use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info_span, warn};

use super::auth::{Credential, CredentialStore};
use super::retry::retry_with_backoff;
use crate::config::ResilienceConfig;
use crate::error::FerryError;

/// Policy wrapper applied around every network operation.
///
/// Authorization recovery runs outermost: a rejected credential triggers one
/// re-authentication followed by one more run of the transient-retry loop, which
/// wraps the literal network call.
#[derive(Debug, Clone)]
pub struct ResilientInvoker {
    config: ResilienceConfig,
    credentials: CredentialStore,
    span: Span,
}

impl ResilientInvoker {
    pub fn new(config: ResilienceConfig, credentials: CredentialStore, span: Span) -> Self {
        Self {
            config,
            credentials,
            span,
        }
    }

    /// Run `operation` under the retry and re-authentication policies.
    ///
    /// `operation` receives the credential to use for that attempt. When
    /// re-authentication fails the original authorization error is returned.
    pub async fn invoke<T, F, Fut>(
        &self,
        name: &'static str,
        token: &CancellationToken,
        mut operation: F,
    ) -> Result<T, FerryError>
    where
        F: FnMut(Arc<Credential>) -> Fut,
        Fut: Future<Output = Result<T, FerryError>>,
    {
        let span = info_span!(parent: &self.span, "invoke", operation = name);
        async move {
            let mut reauths = 0u32;
            loop {
                let generation = self.credentials.current().generation();
                let result = retry_with_backoff(&self.config.retry, token, |attempt| {
                    if attempt > 0 {
                        debug!(attempt, "Retrying operation");
                    }
                    operation(self.credentials.current())
                })
                .await;

                let err = match result {
                    Err(err) if err.is_authorization() && reauths < self.config.auth_retries => {
                        err
                    }
                    other => return other,
                };
                reauths += 1;
                warn!(error = %err, "Credential rejected, re-authenticating");

                if let Err(reauth_err) = self.credentials.refresh(generation).await {
                    warn!(error = %reauth_err, "Re-authentication failed");
                    return Err(err);
                }
            }
        }
        .instrument(span)
        .await
    }
}
