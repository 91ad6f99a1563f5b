use std::future::Future;
use std::path::PathBuf;
use std::{fs, io, net, sync::Arc, time::Duration};

use anyhow::Context;
use rustls::RootCertStore;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use url::Url;
use wtpub::{Application, Connection, ConnectionConfig, Outbox, Side, WindowBits};

use crate::crypto;
use crate::driver::{self, Driver, State};

/// TLS configuration for the client.
#[derive(Clone, Default, Debug, clap::Args, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
#[non_exhaustive]
pub struct ClientTls {
	/// Use the TLS root at this path, encoded as PEM.
	///
	/// This value can be provided multiple times for multiple roots.
	/// If this is empty, system roots will be used instead
	#[serde(skip_serializing_if = "Vec::is_empty")]
	#[arg(id = "tls-root", long = "tls-root", env = "WTPUB_CLIENT_TLS_ROOT")]
	pub root: Vec<PathBuf>,

	/// Danger: Disable TLS certificate verification.
	///
	/// Fine for local development against a self-signed broker, but dangerous in production.
	#[serde(skip_serializing_if = "Option::is_none")]
	#[arg(
		id = "tls-disable-verify",
		long = "tls-disable-verify",
		env = "WTPUB_CLIENT_TLS_DISABLE_VERIFY",
		default_missing_value = "true",
		num_args = 0..=1,
		value_parser = clap::value_parser!(bool),
	)]
	pub disable_verify: Option<bool>,
}

/// Configuration for the QUIC client.
#[derive(Clone, Debug, clap::Args, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields, default)]
#[non_exhaustive]
pub struct ClientConfig {
	/// Listen for UDP packets on the given address.
	#[arg(
		id = "client-bind",
		long = "client-bind",
		default_value = "[::]:0",
		env = "WTPUB_CLIENT_BIND"
	)]
	pub bind: net::SocketAddr,

	/// Close the connection after this much silence. Keepalives are sent ten times as often.
	#[arg(
		id = "client-idle-timeout",
		long = "client-idle-timeout",
		default_value = "30s",
		value_parser = humantime::parse_duration,
		env = "WTPUB_CLIENT_IDLE_TIMEOUT"
	)]
	#[serde(with = "humantime_serde")]
	pub idle_timeout: Duration,

	/// How long to wait for each application to exit when shutting down.
	#[arg(
		id = "client-finish-timeout",
		long = "client-finish-timeout",
		default_value = "5s",
		value_parser = humantime::parse_duration,
		env = "WTPUB_CLIENT_FINISH_TIMEOUT"
	)]
	#[serde(with = "humantime_serde")]
	pub finish_timeout: Duration,

	#[command(flatten)]
	#[serde(default)]
	pub tls: ClientTls,
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			bind: net::SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 0], 0)),
			idle_timeout: Duration::from_secs(30),
			finish_timeout: Duration::from_secs(5),
			tls: ClientTls::default(),
		}
	}
}

impl ClientConfig {
	pub fn init(self) -> anyhow::Result<Client> {
		Client::new(self)
	}
}

/// Opens WebTransport sessions over QUIC.
///
/// Create via [`ClientConfig::init`] or [`Client::new`].
#[derive(Clone)]
pub struct Client {
	quic: quinn::Endpoint,
	tls: rustls::ClientConfig,
	transport: Arc<quinn::TransportConfig>,
	connection: ConnectionConfig,
}

impl Client {
	pub fn new(config: ClientConfig) -> anyhow::Result<Self> {
		let provider = crypto::provider();

		// Create a list of acceptable root certificates.
		let mut roots = RootCertStore::empty();

		if config.tls.root.is_empty() {
			let native = rustls_native_certs::load_native_certs();

			// Log any errors that occurred while loading the native root certificates.
			for err in native.errors {
				tracing::warn!(%err, "failed to load root cert");
			}

			for cert in native.certs {
				roots.add(cert).context("failed to add root cert")?;
			}
		} else {
			for root in &config.tls.root {
				let root = fs::File::open(root).context("failed to open root cert file")?;
				let mut root = io::BufReader::new(root);

				let root = rustls_pemfile::certs(&mut root)
					.next()
					.context("no roots found")?
					.context("failed to read root cert")?;

				roots.add(root).context("failed to add root cert")?;
			}
		}

		let mut tls = rustls::ClientConfig::builder_with_provider(provider.clone())
			.with_protocol_versions(&[&rustls::version::TLS13])?
			.with_root_certificates(roots)
			.with_no_client_auth();

		if config.tls.disable_verify.unwrap_or_default() {
			tracing::warn!("TLS server certificate verification is disabled; A man-in-the-middle attack is possible.");

			let noop = NoCertificateVerification(provider.clone());
			tls.dangerous().set_certificate_verifier(Arc::new(noop));
		}

		tls.alpn_protocols = vec![web_transport_quinn::ALPN.as_bytes().to_vec()];

		let socket = std::net::UdpSocket::bind(config.bind).context("failed to bind UDP socket")?;

		let mut transport = quinn::TransportConfig::default();
		transport.max_idle_timeout(Some(config.idle_timeout.try_into().context("idle timeout too large")?));
		transport.mtu_discovery_config(None); // Disable MTU discovery
		let transport = Arc::new(transport);

		// There's a bit more boilerplate to make a generic endpoint.
		let runtime = quinn::default_runtime().context("no async runtime")?;
		let endpoint_config = quinn::EndpointConfig::default();

		let quic =
			quinn::Endpoint::new(endpoint_config, None, socket, runtime).context("failed to create QUIC endpoint")?;

		let connection = ConnectionConfig {
			keepalive: Some(config.idle_timeout / 10),
			finish_timeout: config.finish_timeout,
			window_bits: WindowBits::default(),
		};

		Ok(Self {
			quic,
			tls,
			transport,
			connection,
		})
	}

	/// Use a different deflate window for compressed sessions.
	pub fn with_window_bits(mut self, window_bits: WindowBits) -> Self {
		self.connection.window_bits = window_bits;
		self
	}

	/// Open a session to `url` and run `app` on it.
	///
	/// Returns once the session is over, or after `shutdown` resolves and the application has finished.
	#[tracing::instrument("client", skip_all, fields(url = %crate::redact(&url)))]
	pub async fn run(&self, url: Url, app: Arc<dyn Application>, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
		let host = url.host_str().context("invalid DNS name")?.to_string();
		let port = url.port().unwrap_or(443);

		// Look up the DNS entry.
		let ip = tokio::net::lookup_host((host.clone(), port))
			.await
			.context("failed DNS lookup")?
			.next()
			.context("no DNS entries")?;

		let config: quinn::crypto::rustls::QuicClientConfig = self.tls.clone().try_into()?;
		let mut config = quinn::ClientConfig::new(Arc::new(config));
		config.transport_config(self.transport.clone());

		tracing::info!(%ip, "connecting");

		let conn = self.quic.connect_with(config, ip, &host)?.await?;

		let (outbox, commands) = Outbox::new(Side::Client);
		let mut connection = Connection::client(Arc::new(outbox)).with_config(self.connection.clone());

		let response = connection.connect(driver::request(&url, None), app);
		tokio::spawn(async move {
			match response.accepted().await {
				Ok(()) => tracing::info!("connected"),
				Err(err) => tracing::warn!(%err, "refused"),
			}
		});

		let driver = Driver::new(connection, commands, State::Connect(conn, url));
		let res = driver.run(shutdown).await;

		tracing::info!("closed");
		res
	}

	pub fn local_addr(&self) -> anyhow::Result<net::SocketAddr> {
		self.quic.local_addr().context("failed to get local address")
	}
}

#[derive(Debug)]
struct NoCertificateVerification(crypto::Provider);

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
	fn verify_server_cert(
		&self,
		_end_entity: &CertificateDer<'_>,
		_intermediates: &[CertificateDer<'_>],
		_server_name: &ServerName<'_>,
		_ocsp: &[u8],
		_now: UnixTime,
	) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
		Ok(rustls::client::danger::ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &rustls::DigitallySignedStruct,
	) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
		rustls::crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
	}

	fn verify_tls13_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &rustls::DigitallySignedStruct,
	) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
		rustls::crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
	}

	fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
		self.0.signature_verification_algorithms.supported_schemes()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use clap::Parser;

	#[derive(clap::Parser)]
	struct Cli {
		#[command(flatten)]
		client: ClientConfig,
	}

	#[test]
	fn toml_disable_verify_survives_update_from() {
		let toml = r#"
			tls.disable_verify = true
		"#;

		let client: ClientConfig = toml::from_str(toml).unwrap();
		assert_eq!(client.tls.disable_verify, Some(true));

		// TOML loaded, then CLI args re-applied without --tls-disable-verify.
		let mut cli = Cli { client };
		cli.update_from(["test"]);
		assert_eq!(cli.client.tls.disable_verify, Some(true));
	}

	#[test]
	fn cli_disable_verify_flag() {
		let cli = Cli::parse_from(["test", "--tls-disable-verify"]);
		assert_eq!(cli.client.tls.disable_verify, Some(true));

		let cli = Cli::parse_from(["test", "--tls-disable-verify", "false"]);
		assert_eq!(cli.client.tls.disable_verify, Some(false));

		let cli = Cli::parse_from(["test"]);
		assert_eq!(cli.client.tls.disable_verify, None);
	}

	#[test]
	fn idle_timeout() {
		let cli = Cli::parse_from(["test", "--client-idle-timeout", "1m"]);
		assert_eq!(cli.client.idle_timeout, Duration::from_secs(60));
		assert_eq!(ClientConfig::default().idle_timeout, Duration::from_secs(30));
	}
}
