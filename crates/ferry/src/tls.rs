use std::sync::OnceLock;

use tracing::debug;

/// Install the aws-lc-rs rustls provider used by both reqwest and the upload channel.
///
/// Safe to call from every constructor; only the first call does anything.
pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}
