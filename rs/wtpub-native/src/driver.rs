use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;

use anyhow::Context;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use url::Url;
use wtpub::{Command, Connection, Event, Headers, Side, StreamId, header};

/// The CONNECT stream of the only session on a native connection.
pub(crate) const SESSION_ID: StreamId = 0;

pub(crate) enum State {
	/// Server: the CONNECT arrived and waits for the application's answer.
	Request(web_transport_quinn::Request),

	/// Client: the QUIC connection is up and the CONNECT has not been sent yet.
	Connect(quinn::Connection, Url),

	Session(web_transport_quinn::Session),
	Closed,
}

/// Runs a [Connection] against a single web-transport-quinn session.
///
/// Engine activity is turned into [Event]s and the [Command]s queued by the core are executed in order.
pub(crate) struct Driver {
	side: Side,
	connection: Connection,
	commands: mpsc::UnboundedReceiver<Command>,
	state: State,

	events_tx: mpsc::UnboundedSender<Event>,
	events: mpsc::UnboundedReceiver<Event>,

	streams: HashMap<StreamId, web_transport_quinn::SendStream>,
	readers: JoinSet<()>,
}

impl Driver {
	pub fn new(connection: Connection, commands: mpsc::UnboundedReceiver<Command>, state: State) -> Self {
		let (events_tx, events) = mpsc::unbounded_channel();

		Self {
			side: connection.side(),
			connection,
			commands,
			state,
			events_tx,
			events,
			streams: HashMap::new(),
			readers: JoinSet::new(),
		}
	}

	/// Queue an event as if the engine produced it.
	pub fn push(&self, event: Event) {
		let _ = self.events_tx.send(event);
	}

	/// Run until the session is over or `shutdown` resolves, then let every application finish.
	pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
		tokio::pin!(shutdown);

		loop {
			tokio::select! {
				biased;
				Some(command) = self.commands.recv() => self.execute(command).await,
				Some(event) = self.events.recv() => {
					let terminated = matches!(event, Event::Terminated { .. });
					self.connection.handle_event(event);
					if terminated {
						self.state = State::Closed;
					}
				}
				_ = &mut shutdown => {
					tracing::debug!("shutting down");
					break;
				}
			}

			if matches!(self.state, State::Closed) {
				break;
			}
		}

		// Deliver anything that raced the exit, so pending connects see why they failed.
		while let Ok(event) = self.events.try_recv() {
			self.connection.handle_event(event);
		}

		self.connection.shutdown().await;

		// Flush whatever the applications queued on their way out.
		while let Ok(command) = self.commands.try_recv() {
			self.execute(command).await;
		}

		if let State::Session(session) = &self.state {
			session.close(0, b"");
		}

		self.readers.abort_all();
		Ok(())
	}

	async fn execute(&mut self, command: Command) {
		if let Err(err) = self.try_execute(command).await {
			tracing::warn!(%err, "transport error");
			self.push(Event::Terminated {
				code: 0,
				reason: err.to_string(),
			});
		}
	}

	async fn try_execute(&mut self, command: Command) -> anyhow::Result<()> {
		match command {
			Command::Headers { headers, .. } => self.headers(headers).await?,
			Command::Data { end_stream: true, .. } => {
				if let State::Session(session) = &self.state {
					session.close(0, b"");
				}
				self.state = State::Closed;
			}
			Command::Data { .. } => {}
			Command::OpenUni { stream_id, .. } => {
				let session = self.session()?;
				let stream = session.open_uni().await.context("failed to open stream")?;
				self.streams.insert(stream_id, stream);
			}
			Command::StreamData {
				stream_id,
				data,
				end_stream,
			} => {
				let stream = self.streams.get_mut(&stream_id).context("unknown stream")?;
				stream.write_all(&data).await.context("failed to write stream")?;

				if end_stream {
					if let Some(mut stream) = self.streams.remove(&stream_id) {
						stream.finish().context("failed to finish stream")?;
					}
				}
			}
			Command::Datagram { data, .. } => {
				self.session()?.send_datagram(data).context("failed to send datagram")?;
			}
			// A keepalive is an empty datagram; the receiving driver drops it.
			Command::Ping => {
				if let Ok(session) = self.session() {
					session.send_datagram(Bytes::new()).context("failed to send ping")?;
				}
			}
			// quinn flushes on its own.
			Command::Transmit => {}
		}

		Ok(())
	}

	// The only headers the core sends are a CONNECT (client) or a response (server).
	async fn headers(&mut self, headers: Headers) -> anyhow::Result<()> {
		match std::mem::replace(&mut self.state, State::Closed) {
			State::Request(request) => {
				let status = header(&headers, ":status")
					.and_then(|status| status.parse::<u16>().ok())
					.context("missing status")?;

				if status == 200 {
					let session = request.ok().await.context("failed to accept session")?;
					self.start(session);
				} else {
					let status = web_transport_quinn::http::StatusCode::from_u16(status).context("invalid status code")?;
					request.close(status).await.context("failed to reject session")?;
				}
			}
			State::Connect(connection, url) => {
				match web_transport_quinn::Session::connect(connection, url).await {
					Ok(session) => {
						self.start(session);
						self.push(Event::Headers {
							stream_id: SESSION_ID,
							headers: vec![(":status".to_string(), "200".to_string())],
							stream_ended: false,
						});
					}
					Err(err) => self.push(Event::Terminated {
						code: 0,
						reason: err.to_string(),
					}),
				}
			}
			state => self.state = state,
		}

		Ok(())
	}

	fn session(&self) -> anyhow::Result<&web_transport_quinn::Session> {
		match &self.state {
			State::Session(session) => Ok(session),
			_ => anyhow::bail!("session is not established"),
		}
	}

	fn start(&mut self, session: web_transport_quinn::Session) {
		// Streams opened by the peer use the peer's initiator bit.
		let initiator = match self.side {
			Side::Client => 1,
			Side::Server => 0,
		};

		let events = self.events_tx.clone();
		let streams = session.clone();
		self.readers.spawn(async move {
			let mut index: u64 = 0;
			while let Ok(stream) = streams.accept_uni().await {
				let stream_id = (index << 2) | 2 | initiator;
				index += 1;
				tokio::spawn(read_stream(stream, stream_id, events.clone()));
			}
		});

		let events = self.events_tx.clone();
		let datagrams = session.clone();
		self.readers.spawn(async move {
			while let Ok(data) = datagrams.read_datagram().await {
				if data.is_empty() {
					continue;
				}

				let _ = events.send(Event::Datagram {
					session_id: SESSION_ID,
					data,
				});
			}
		});

		let events = self.events_tx.clone();
		let closed = session.clone();
		self.readers.spawn(async move {
			let err = closed.closed().await;
			let _ = events.send(Event::Terminated {
				code: 0,
				reason: err.to_string(),
			});
		});

		self.state = State::Session(session);
	}
}

async fn read_stream(mut stream: web_transport_quinn::RecvStream, stream_id: StreamId, events: mpsc::UnboundedSender<Event>) {
	let mut buf = vec![0u8; 64 * 1024];

	loop {
		let (data, stream_ended) = match stream.read(&mut buf).await {
			Ok(Some(size)) => (Bytes::copy_from_slice(&buf[..size]), false),
			Ok(None) => (Bytes::new(), true),
			Err(err) => {
				tracing::debug!(stream_id, %err, "stream reset");
				return;
			}
		};

		let event = Event::StreamData {
			session_id: SESSION_ID,
			stream_id,
			data,
			stream_ended,
		};

		if events.send(event).is_err() || stream_ended {
			return;
		}
	}
}

/// The CONNECT header block equivalent to a WebTransport URL, credentials included.
pub(crate) fn connect_headers(url: &Url) -> Headers {
	let mut authority = String::new();
	if !url.username().is_empty() {
		authority.push_str(url.username());
		if let Some(password) = url.password() {
			authority.push(':');
			authority.push_str(password);
		}
		authority.push('@');
	}
	authority.push_str(url.host_str().unwrap_or_default());
	if let Some(port) = url.port() {
		authority.push_str(&format!(":{port}"));
	}

	let path = match url.query() {
		Some(query) => format!("{}?{}", url.path(), query),
		None => url.path().to_string(),
	};

	vec![
		(":method".to_string(), "CONNECT".to_string()),
		(":protocol".to_string(), "webtransport".to_string()),
		(":scheme".to_string(), url.scheme().to_string()),
		(":authority".to_string(), authority),
		(":path".to_string(), path),
	]
}

/// The normalized request for a WebTransport URL.
pub(crate) fn request(url: &Url, peer: Option<SocketAddr>) -> wtpub::Request {
	wtpub::Request::from_headers(&connect_headers(url), peer)
}
