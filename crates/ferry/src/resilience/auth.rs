//! Credentials and re-authentication.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use url::Url;

use crate::error::FerryError;

/// Opaque credential plus the generation it was issued in.
///
/// A credential is never mutated; re-authentication replaces it wholesale.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    secret: Arc<str>,
    generation: u64,
}

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: Arc::from(secret.into()),
            generation: 0,
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("secret", &"***")
            .field("generation", &self.generation)
            .finish()
    }
}

/// Obtains a fresh credential from previously supplied login material.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self) -> Result<Credential, FerryError>;
}

/// Shared, read-mostly credential holder for one client session.
///
/// Cloning is cheap; clones observe the same credential.
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    current: RwLock<Arc<Credential>>,
    refresh: Mutex<()>,
    authenticator: Arc<dyn Authenticator>,
}

impl CredentialStore {
    pub fn new(initial: Credential, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                current: RwLock::new(Arc::new(initial)),
                refresh: Mutex::new(()),
                authenticator,
            }),
        }
    }

    /// Authenticate once and start the session with the result.
    pub async fn login(authenticator: Arc<dyn Authenticator>) -> Result<Self, FerryError> {
        let credential = authenticator.authenticate().await?;
        Ok(Self::new(credential.with_generation(0), authenticator))
    }

    pub fn current(&self) -> Arc<Credential> {
        self.inner.current.read().clone()
    }

    /// Replace the credential held by `stale_generation`.
    ///
    /// Concurrent callers holding the same stale generation are serialised: the
    /// first one authenticates, the others get the credential it obtained.
    pub async fn refresh(&self, stale_generation: u64) -> Result<Arc<Credential>, FerryError> {
        let _guard = self.inner.refresh.lock().await;

        let current = self.current();
        if current.generation() != stale_generation {
            debug!(
                generation = current.generation(),
                "Credential already refreshed by another operation"
            );
            return Ok(current);
        }

        let fresh = self.inner.authenticator.authenticate().await?;
        let fresh = Arc::new(fresh.with_generation(stale_generation + 1));
        *self.inner.current.write() = fresh.clone();
        info!(generation = fresh.generation(), "Credential replaced");
        Ok(fresh)
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("current", &self.current())
            .finish_non_exhaustive()
    }
}

/// A static token; "re-authenticating" hands out the same secret again.
pub struct FixedCredential {
    secret: String,
}

impl FixedCredential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

#[async_trait]
impl Authenticator for FixedCredential {
    async fn authenticate(&self) -> Result<Credential, FerryError> {
        Ok(Credential::new(self.secret.clone()))
    }
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    #[serde(alias = "access_token", alias = "Token")]
    token: String,
}

/// Username/password login against a JSON endpoint returning `{"token": "..."}`.
pub struct HttpAuthenticator {
    client: Client,
    login_url: Url,
    username: String,
    password: String,
}

impl HttpAuthenticator {
    pub fn new(
        client: Client,
        login_url: Url,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            client,
            login_url,
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for HttpAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpAuthenticator")
            .field("login_url", &self.login_url.as_str())
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
    async fn authenticate(&self) -> Result<Credential, FerryError> {
        debug!(url = %self.login_url, username = %self.username, "Logging in");
        let response = self
            .client
            .post(self.login_url.clone())
            .json(&LoginRequest {
                username: &self.username,
                password: &self.password,
            })
            .send()
            .await
            .map_err(|e| FerryError::network("login", e))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(FerryError::unauthorized(format!(
                "login rejected with HTTP {status}"
            )));
        }
        if !status.is_success() {
            return Err(FerryError::http_status(
                status,
                self.login_url.as_str(),
                "login",
            ));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| FerryError::network("login", e))?;
        let login: LoginResponse = serde_json::from_slice(&body)
            .map_err(|e| FerryError::protocol("login", format!("unexpected response: {e}")))?;
        if login.token.is_empty() {
            return Err(FerryError::protocol("login", "empty token"));
        }
        Ok(Credential::new(login.token))
    }
}
