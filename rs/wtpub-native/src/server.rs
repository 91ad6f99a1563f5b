use std::path::PathBuf;
use std::sync::Arc;
use std::{fs, io, net, time::Duration};

use anyhow::Context;
use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use url::Url;
use wtpub::{Application, Connection, ConnectionConfig, Event, Outbox, Side};

use crate::crypto;
use crate::driver::{self, Driver, SESSION_ID, State};

/// TLS configuration for the server.
///
/// Certificate and keys must currently be files on disk.
/// Alternatively, you can generate a self-signed certificate given a list of hostnames.
#[derive(clap::Args, Clone, Default, Debug, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
#[non_exhaustive]
pub struct ServerTlsConfig {
	/// Load the given certificate chain from disk, encoded as PEM.
	#[arg(long = "tls-cert", id = "tls-cert", env = "WTPUB_SERVER_TLS_CERT")]
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub cert: Option<PathBuf>,

	/// Load the given private key from disk, encoded as PEM.
	#[arg(long = "tls-key", id = "tls-key", env = "WTPUB_SERVER_TLS_KEY")]
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub key: Option<PathBuf>,

	/// Or generate a new certificate and key with the given hostnames.
	/// This won't be valid unless the client disables verification.
	#[arg(
		long = "tls-generate",
		id = "tls-generate",
		value_delimiter = ',',
		env = "WTPUB_SERVER_TLS_GENERATE"
	)]
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub generate: Vec<String>,
}

impl ServerTlsConfig {
	fn load(&self) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
		match (&self.cert, &self.key) {
			(Some(cert), Some(key)) => {
				let cert = fs::File::open(cert).context("failed to open certificate")?;
				let chain = rustls_pemfile::certs(&mut io::BufReader::new(cert))
					.collect::<Result<Vec<_>, _>>()
					.context("failed to read certificate")?;
				anyhow::ensure!(!chain.is_empty(), "no certificates found");

				let key = fs::File::open(key).context("failed to open key")?;
				let key = rustls_pemfile::private_key(&mut io::BufReader::new(key))
					.context("failed to read key")?
					.context("no private key found")?;

				Ok((chain, key))
			}
			(None, None) if !self.generate.is_empty() => {
				let key = rcgen::KeyPair::generate().context("failed to generate key")?;
				let params = rcgen::CertificateParams::new(self.generate.clone()).context("invalid hostnames")?;
				let cert = params.self_signed(&key).context("failed to generate certificate")?;

				tracing::warn!(hostnames = ?self.generate, "using a self-signed certificate");

				let key = PrivatePkcs8KeyDer::from(key.serialize_der());
				Ok((vec![cert.der().clone()], key.into()))
			}
			_ => anyhow::bail!("either --tls-cert and --tls-key or --tls-generate is required"),
		}
	}
}

/// Configuration for the QUIC server.
#[derive(clap::Args, Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields, default)]
#[non_exhaustive]
pub struct ServerConfig {
	/// Listen for UDP packets on the given address.
	/// Defaults to `[::]:4433` if not provided.
	#[serde(alias = "listen", skip_serializing_if = "Option::is_none")]
	#[arg(id = "server-bind", long = "server-bind", alias = "listen", env = "WTPUB_SERVER_BIND")]
	pub bind: Option<net::SocketAddr>,

	/// Close connections after this much silence.
	/// Defaults to 2h if not provided.
	#[arg(
		id = "server-idle-timeout",
		long = "server-idle-timeout",
		value_parser = humantime::parse_duration,
		env = "WTPUB_SERVER_IDLE_TIMEOUT"
	)]
	#[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
	pub idle_timeout: Option<Duration>,

	/// Bytes of incoming datagrams buffered per connection.
	/// Defaults to 64KiB if not provided.
	#[arg(id = "server-datagram-buffer", long = "server-datagram-buffer", env = "WTPUB_SERVER_DATAGRAM_BUFFER")]
	#[serde(skip_serializing_if = "Option::is_none")]
	pub datagram_buffer: Option<usize>,

	#[command(flatten)]
	#[serde(default)]
	pub tls: ServerTlsConfig,
}

impl ServerConfig {
	pub const DEFAULT_BIND: net::SocketAddr = net::SocketAddr::new(net::IpAddr::V6(net::Ipv6Addr::UNSPECIFIED), 4433);
	pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(7200);
	pub const DEFAULT_DATAGRAM_BUFFER: usize = 64 * 1024;

	pub fn init(self) -> anyhow::Result<Server> {
		Server::new(self)
	}
}

/// Accepts WebTransport sessions over QUIC.
///
/// Create via [`ServerConfig::init`] or [`Server::new`].
pub struct Server {
	quic: quinn::Endpoint,
	accept: FuturesUnordered<BoxFuture<'static, anyhow::Result<Incoming>>>,
}

impl Server {
	pub fn new(config: ServerConfig) -> anyhow::Result<Self> {
		let provider = crypto::provider();
		let (chain, key) = config.tls.load()?;

		let mut tls = rustls::ServerConfig::builder_with_provider(provider)
			.with_protocol_versions(&[&rustls::version::TLS13])?
			.with_no_client_auth()
			.with_single_cert(chain, key)
			.context("invalid certificate")?;
		tls.alpn_protocols = vec![web_transport_quinn::ALPN.as_bytes().to_vec()];

		let tls: quinn::crypto::rustls::QuicServerConfig = tls.try_into()?;

		let idle_timeout = config.idle_timeout.unwrap_or(ServerConfig::DEFAULT_IDLE_TIMEOUT);
		let datagram_buffer = config.datagram_buffer.unwrap_or(ServerConfig::DEFAULT_DATAGRAM_BUFFER);

		let mut transport = quinn::TransportConfig::default();
		transport.max_idle_timeout(Some(idle_timeout.try_into().context("idle timeout too large")?));
		transport.datagram_receive_buffer_size(Some(datagram_buffer));

		let mut server = quinn::ServerConfig::with_crypto(Arc::new(tls));
		server.transport_config(Arc::new(transport));

		let bind = config.bind.unwrap_or(ServerConfig::DEFAULT_BIND);
		let socket = std::net::UdpSocket::bind(bind).context("failed to bind UDP socket")?;
		tracing::info!(%bind, "listening");

		// There's a bit more boilerplate to make a generic endpoint.
		let runtime = quinn::default_runtime().context("no async runtime")?;
		let endpoint_config = quinn::EndpointConfig::default();

		let quic = quinn::Endpoint::new(endpoint_config, Some(server), socket, runtime)
			.context("failed to create QUIC endpoint")?;

		Ok(Self {
			quic,
			accept: Default::default(),
		})
	}

	/// Returns the next WebTransport session that completed its handshake.
	///
	/// Handshakes run concurrently. Returns `None` on ctrl-c or once the endpoint is closed.
	pub async fn accept(&mut self) -> Option<Incoming> {
		loop {
			tokio::select! {
				res = self.quic.accept() => {
					let incoming = res?;
					self.accept.push(Self::accept_session(incoming).boxed());
				}
				Some(res) = self.accept.next() => {
					match res {
						Ok(incoming) => return Some(incoming),
						Err(err) => tracing::debug!(%err, "failed to accept session"),
					}
				}
				_ = tokio::signal::ctrl_c() => {
					self.close();
					tokio::time::sleep(Duration::from_millis(100)).await;
					return None;
				}
			}
		}
	}

	async fn accept_session(incoming: quinn::Incoming) -> anyhow::Result<Incoming> {
		let conn = incoming.await.context("failed to complete QUIC handshake")?;
		let peer = conn.remote_address();

		let request = web_transport_quinn::Request::accept(conn)
			.await
			.context("failed to receive WebTransport request")?;

		Ok(Incoming { request, peer })
	}

	pub fn local_addr(&self) -> anyhow::Result<net::SocketAddr> {
		self.quic.local_addr().context("failed to get local address")
	}

	pub fn close(&mut self) {
		self.quic.close(quinn::VarInt::from_u32(0), b"server shutdown");
	}
}

/// A WebTransport CONNECT that has not been answered yet.
pub struct Incoming {
	request: web_transport_quinn::Request,
	peer: net::SocketAddr,
}

impl Incoming {
	/// Returns the URL provided by the client.
	pub fn url(&self) -> &Url {
		self.request.url()
	}

	pub fn peer(&self) -> net::SocketAddr {
		self.peer
	}

	/// Run `app` for this session until it closes.
	///
	/// The application decides whether the session is accepted.
	pub async fn serve(self, app: Arc<dyn Application>, config: ConnectionConfig) -> anyhow::Result<()> {
		let headers = driver::connect_headers(self.request.url());

		let (outbox, commands) = Outbox::new(Side::Server);
		let connection = Connection::server(Arc::new(outbox), app)
			.with_config(config)
			.with_peer(self.peer);

		let driver = Driver::new(connection, commands, State::Request(self.request));
		driver.push(Event::Headers {
			stream_id: SESSION_ID,
			headers,
			stream_ended: false,
		});

		driver.run(std::future::pending()).await
	}
}
