//! Retry, backoff and credential recovery around network operations.

mod auth;
mod invoker;
mod retry;

pub use auth::{Authenticator, Credential, CredentialStore, FixedCredential, HttpAuthenticator};
pub use invoker::ResilientInvoker;
pub use retry::{Backoff, RetryPolicy, retry_with_backoff};
