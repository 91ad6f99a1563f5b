use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::session::Remove;
use crate::transport::Link;
use crate::{
	Application, Context, Error, Event, Headers, Inbound, Request, Result, Role, Session, Side, StreamId, Transport,
	WindowBits, header,
};

/// Tunables for a [Connection].
#[derive(Clone, Debug)]
pub struct ConnectionConfig {
	/// Ping after this much silence while a client session is active.
	pub keepalive: Option<Duration>,

	/// How long to wait for an application to exit during shutdown.
	pub finish_timeout: Duration,

	/// The deflate window for session-level compression.
	pub window_bits: WindowBits,
}

impl Default for ConnectionConfig {
	fn default() -> Self {
		Self {
			keepalive: None,
			finish_timeout: Duration::from_secs(5),
			window_bits: WindowBits::default(),
		}
	}
}

/// Demultiplexes the events of one QUIC connection across its WebTransport sessions.
///
/// The owner feeds every engine event into [Connection::handle_event] from a single task.
pub struct Connection {
	side: Side,
	link: Link,
	config: ConnectionConfig,
	peer: Option<SocketAddr>,

	// Runs every incoming session on the server.
	app: Option<Arc<dyn Application>>,

	sessions: HashMap<StreamId, Session>,
	connecting: HashMap<StreamId, Connecting>,

	// Removed sessions whose application is still unwinding.
	finishing: Vec<Session>,

	removed_tx: mpsc::UnboundedSender<StreamId>,
	removed: mpsc::UnboundedReceiver<StreamId>,

	keepalive: Option<JoinHandle<()>>,
}

// A client session waiting for its CONNECT response.
struct Connecting {
	app: Arc<dyn Application>,
	context: Context,
	response: oneshot::Sender<Result<()>>,
}

impl Connection {
	/// Accept sessions, running `app` for each of them.
	pub fn server(transport: Arc<dyn Transport>, app: Arc<dyn Application>) -> Self {
		let mut connection = Self::new(Side::Server, transport);
		connection.app = Some(app);
		connection
	}

	/// Open sessions with [Connection::connect].
	pub fn client(transport: Arc<dyn Transport>) -> Self {
		Self::new(Side::Client, transport)
	}

	fn new(side: Side, transport: Arc<dyn Transport>) -> Self {
		let (removed_tx, removed) = mpsc::unbounded_channel();

		Self {
			side,
			link: Link::new(transport),
			config: ConnectionConfig::default(),
			peer: None,
			app: None,
			sessions: HashMap::new(),
			connecting: HashMap::new(),
			finishing: Vec::new(),
			removed_tx,
			removed,
			keepalive: None,
		}
	}

	pub fn with_config(mut self, config: ConnectionConfig) -> Self {
		self.config = config;
		self
	}

	pub fn with_peer(mut self, peer: SocketAddr) -> Self {
		self.peer = Some(peer);
		self
	}

	pub fn side(&self) -> Side {
		self.side
	}

	pub fn session(&self, id: StreamId) -> Option<&Session> {
		self.sessions.get(&id)
	}

	pub fn len(&self) -> usize {
		self.sessions.len()
	}

	pub fn is_empty(&self) -> bool {
		self.sessions.is_empty()
	}

	/// Route an engine event to the session it belongs to.
	pub fn handle_event(&mut self, event: Event) {
		self.link.touch();

		match event {
			Event::Terminated { .. } => self.terminate(event),
			Event::Headers {
				stream_id,
				headers,
				stream_ended,
			} => {
				if self.connecting.contains_key(&stream_id) {
					self.on_response(stream_id, &headers);
				} else if let Some(session) = self.sessions.get(&stream_id) {
					session.handle_event(Event::Headers {
						stream_id,
						headers,
						stream_ended,
					});
				} else if self.side == Side::Server {
					self.on_request(stream_id, &headers);
				} else {
					tracing::debug!(stream_id, "headers for unknown stream");
				}
			}
			event => match event.session_id().and_then(|id| self.sessions.get(&id)) {
				Some(session) => session.handle_event(event),
				None => tracing::trace!(kind = ?event.kind(), session = ?event.session_id(), "event for unknown session"),
			},
		}

		self.reap();
	}

	/// Send a CONNECT request for a new session, running `app` once it is accepted.
	pub fn connect(&mut self, request: Request, app: Arc<dyn Application>) -> Response {
		let stream_id = self.link.next_request_id();
		let compression = request.compression();

		let (session, mut receiver) =
			Session::new(stream_id, Side::Client, self.link.clone(), self.remover(), compression);

		if compression.is_enabled() {
			match request.role() {
				Some(Role::Publisher) => session.enable_compression(self.config.window_bits),
				Some(Role::Subscriber) => receiver.decompress(self.config.window_bits),
				None => {}
			}
		}

		tracing::info!(id = stream_id, authority = %request.authority, path = %request.path, query = %request.query, "connecting");

		self.link.send_headers(stream_id, request.to_headers(), false);
		self.link.transmit();

		let (tx, rx) = oneshot::channel();
		self.sessions.insert(stream_id, session.clone());
		self.connecting.insert(
			stream_id,
			Connecting {
				app,
				context: Context {
					request,
					session,
					receiver,
				},
				response: tx,
			},
		);

		Response(rx)
	}

	/// Ask every application to stop, wait for them, and stop the keepalive.
	///
	/// This includes applications of sessions that already ended but have not exited yet.
	pub async fn shutdown(&mut self) {
		let sessions: Vec<Session> = self
			.sessions
			.values()
			.cloned()
			.chain(self.finishing.drain(..))
			.collect();
		let timeout = self.config.finish_timeout;
		futures::future::join_all(sessions.iter().map(|session| session.finish(timeout))).await;

		for (_, connecting) in self.connecting.drain() {
			let _ = connecting.response.send(Err(Error::Closed));
		}

		self.stop_keepalive();
		self.reap();
	}

	fn on_request(&mut self, stream_id: StreamId, headers: &Headers) {
		let Some(app) = self.app.clone() else {
			return;
		};

		let request = Request::from_headers(headers, self.peer);

		if !request.is_webtransport() {
			tracing::debug!(stream_id, method = %request.method, "rejecting request");
			self.link
				.send_headers(stream_id, vec![(":status".to_string(), "400".to_string())], true);
			self.link.transmit();
			return;
		}

		tracing::info!(
			id = stream_id,
			client = ?request.client,
			user = ?request.principal.user,
			path = %request.path,
			query = %request.query,
			"session requested"
		);

		let (session, receiver) = Session::new(
			stream_id,
			Side::Server,
			self.link.clone(),
			self.remover(),
			request.compression(),
		);

		session.endpoint().deliver(Inbound::Connect);
		self.sessions.insert(stream_id, session.clone());

		let context = Context {
			request,
			session: session.clone(),
			receiver,
		};
		session.spawn(app, context);
	}

	fn on_response(&mut self, stream_id: StreamId, headers: &Headers) {
		let Some(connecting) = self.connecting.remove(&stream_id) else {
			return;
		};

		let status = header(headers, ":status")
			.and_then(|status| status.parse::<u16>().ok())
			.unwrap_or_default();

		let session = connecting.context.session.clone();

		if status == 200 {
			tracing::info!(id = stream_id, "connected");
			session.activate();
			session.spawn(connecting.app, connecting.context);
			self.start_keepalive();
			let _ = connecting.response.send(Ok(()));
		} else {
			tracing::warn!(id = stream_id, status, "refused");
			session.refused();
			let _ = connecting.response.send(Err(Error::Refused(status)));
		}
	}

	fn terminate(&mut self, event: Event) {
		let reason = match &event {
			Event::Terminated { reason, .. } => reason.clone(),
			_ => String::new(),
		};

		tracing::debug!(sessions = self.sessions.len(), %reason, "connection terminated");

		let sessions: Vec<Session> = self.sessions.values().cloned().collect();
		for session in sessions {
			session.handle_event(event.clone());
		}

		for (_, connecting) in self.connecting.drain() {
			let _ = connecting.response.send(Err(Error::Terminated(reason.clone())));
		}

		self.stop_keepalive();
	}

	fn remover(&self) -> Remove {
		let removed = self.removed_tx.clone();
		Arc::new(move |id| {
			let _ = removed.send(id);
		})
	}

	fn reap(&mut self) {
		while let Ok(id) = self.removed.try_recv() {
			if let Some(session) = self.sessions.remove(&id) {
				tracing::debug!(id, "session removed");
				if session.is_running() {
					self.finishing.push(session);
				}
			}
			self.connecting.remove(&id);
		}

		self.finishing.retain(|session| session.is_running());

		if self.sessions.is_empty() {
			self.stop_keepalive();
		}
	}

	fn start_keepalive(&mut self) {
		if self.side != Side::Client || self.keepalive.is_some() {
			return;
		}

		let Some(period) = self.config.keepalive else {
			return;
		};

		let link = self.link.clone();
		self.keepalive = Some(tokio::spawn(async move {
			loop {
				tokio::select! {
					_ = tokio::time::sleep(period) => {
						tracing::trace!("keepalive ping");
						link.ping();
					}
					_ = link.active() => {}
				}
			}
		}));
	}

	fn stop_keepalive(&mut self) {
		if let Some(keepalive) = self.keepalive.take() {
			keepalive.abort();
		}
	}
}

impl Drop for Connection {
	fn drop(&mut self) {
		self.stop_keepalive();
	}
}

/// The outcome of a client CONNECT.
pub struct Response(oneshot::Receiver<Result<()>>);

impl Response {
	/// Wait for the server to accept or refuse the session.
	pub async fn accepted(self) -> Result<()> {
		self.0.await.unwrap_or(Err(Error::Closed))
	}
}
