use std::sync::Arc;

pub(crate) type Provider = Arc<rustls::crypto::CryptoProvider>;

/// The process-wide provider if one was installed, otherwise aws-lc-rs.
pub(crate) fn provider() -> Provider {
	if let Some(provider) = rustls::crypto::CryptoProvider::get_default() {
		return provider.clone();
	}

	Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}
