use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::transport::Link;
use crate::{
	Application, Compression, Context, Decoder, Deflater, Endpoint, Error, Event, Headers, Inbound, Outbound, Result,
	Side, StreamId, WindowBits,
};

/// The lifecycle of a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
	/// Waiting for the application (server) or the response (client).
	Pending,
	Accepted,
	Refused,
	Closed,
}

impl Status {
	pub fn is_closed(&self) -> bool {
		matches!(self, Self::Refused | Self::Closed)
	}
}

/// Invoked exactly once when a session is finished, so the owner can forget it.
pub(crate) type Remove = Arc<dyn Fn(StreamId) + Send + Sync>;

/// A single WebTransport session.
///
/// Transport events are fed in through [Session::handle_event] and turned into [Inbound] messages for the
/// application, which talks back through [Session::send]. Cloning is cheap and refers to the same session.
#[derive(Clone)]
pub struct Session {
	inner: Arc<Inner>,
}

struct Inner {
	id: StreamId,
	side: Side,
	link: Link,
	state: Mutex<State>,
	queue: mpsc::UnboundedSender<Inbound>,
	closed: watch::Sender<bool>,
	removed: AtomicBool,
	remove: Remove,
	task: Mutex<Option<JoinHandle<()>>>,
}

struct State {
	status: Status,

	// Events received before acceptance, replayed in order.
	backlog: VecDeque<Event>,

	// Stream bytes waiting for their stream to finish.
	partial: HashMap<StreamId, BytesMut>,

	// Deliver stream fragments as they arrive; the compression framing carries the boundaries.
	passthrough: bool,

	persistent: Option<StreamId>,
	deflater: Option<Deflater>,
}

impl Session {
	pub(crate) fn new(
		id: StreamId,
		side: Side,
		link: Link,
		remove: Remove,
		compression: Compression,
	) -> (Self, SessionReceiver) {
		let (queue, rx) = mpsc::unbounded_channel();

		let state = State {
			status: Status::Pending,
			backlog: VecDeque::new(),
			partial: HashMap::new(),
			passthrough: compression.is_enabled(),
			persistent: None,
			deflater: None,
		};

		let inner = Inner {
			id,
			side,
			link,
			state: Mutex::new(state),
			queue,
			closed: watch::Sender::new(false),
			removed: AtomicBool::new(false),
			remove,
			task: Mutex::new(None),
		};

		let session = Self { inner: Arc::new(inner) };
		(session, SessionReceiver::new(rx))
	}

	/// The session id, which is the id of its CONNECT stream.
	pub fn id(&self) -> StreamId {
		self.inner.id
	}

	pub fn side(&self) -> Side {
		self.inner.side
	}

	pub fn status(&self) -> Status {
		self.inner.state.lock().status
	}

	pub fn is_closed(&self) -> bool {
		self.status().is_closed()
	}

	/// A delivery endpoint feeding this session's receiver, used to subscribe to a topic.
	pub fn endpoint(&self) -> Endpoint {
		Endpoint::new(self.inner.queue.clone())
	}

	/// Compress every stream payload sent from now on over the persistent stream.
	pub fn enable_compression(&self, window_bits: WindowBits) {
		self.inner.state.lock().deflater = Some(Deflater::new(window_bits));
	}

	/// Wait until the session is closed or asked to finish.
	pub async fn closed(&self) {
		let mut closed = self.inner.closed.subscribe();
		// The sender lives as long as the session.
		let _ = closed.wait_for(|closed| *closed).await;
	}

	/// Feed a transport event that belongs to this session.
	pub fn handle_event(&self, event: Event) {
		let remove = {
			let mut state = self.inner.state.lock();
			self.dispatch(&mut state, event)
		};

		if remove {
			self.remove();
		}
	}

	/// Perform an application request.
	pub fn send(&self, message: Outbound) -> Result<()> {
		tracing::trace!(id = self.inner.id, message = message.name(), "send");

		let mut state = self.inner.state.lock();
		let link = &self.inner.link;

		let remove = match message {
			Outbound::Accept => self.accept(&mut state)?,
			Outbound::Refuse => self.end(&mut state, Status::Refused),
			Outbound::Close => self.end(&mut state, Status::Closed),
			Outbound::Datagram(data) => {
				Self::ensure_open(&state)?;
				link.send_datagram(self.inner.id, data);
				false
			}
			Outbound::Stream(data) => {
				Self::ensure_open(&state)?;
				match Self::compress(&mut state, &data)? {
					Some(unit) => self.write_persistent(&mut state, unit),
					None => {
						let stream_id = link.open_uni(self.inner.id);
						link.send_stream_data(stream_id, data, true);
					}
				}
				false
			}
			Outbound::PersistentStream(data) => {
				Self::ensure_open(&state)?;
				let data = Self::compress(&mut state, &data)?.unwrap_or(data);
				self.write_persistent(&mut state, data);
				false
			}
		};

		drop(state);
		link.transmit();

		if remove {
			self.remove();
		}

		Ok(())
	}

	/// Close the session if it is still open. Never fails.
	pub fn close(&self) {
		if let Err(err) = self.send(Outbound::Close) {
			tracing::debug!(id = self.inner.id, %err, "close failed");
		}
	}

	/// Signal the application to stop and wait for it, aborting it after `timeout`.
	pub async fn finish(&self, timeout: Duration) {
		self.signal_end();

		let task = self.inner.task.lock().take();
		let Some(mut task) = task else {
			return;
		};

		if tokio::time::timeout(timeout, &mut task).await.is_err() {
			tracing::warn!(id = self.inner.id, ?timeout, "application did not finish, aborting");
			task.abort();
		}
	}

	/// The application task was spawned and has not exited yet.
	pub(crate) fn is_running(&self) -> bool {
		self.inner.task.lock().as_ref().is_some_and(|task| !task.is_finished())
	}

	/// Run the application for this session in a new task.
	pub(crate) fn spawn(&self, app: Arc<dyn Application>, context: Context) {
		let session = self.clone();
		let span = tracing::info_span!("session", id = self.inner.id);

		let task = tokio::spawn(
			async move {
				if let Err(err) = app.run(context).await {
					tracing::warn!(%err, "application failed");
				}

				session.close();
			}
			.instrument(span),
		);

		*self.inner.task.lock() = Some(task);
	}

	/// The client received a 200 response.
	pub(crate) fn activate(&self) {
		let remove = {
			let mut state = self.inner.state.lock();
			if state.status != Status::Pending {
				return;
			}

			state.status = Status::Accepted;
			self.replay(&mut state)
		};

		if remove {
			self.remove();
		}
	}

	/// The client received a non-200 response.
	pub(crate) fn refused(&self) {
		let remove = {
			let mut state = self.inner.state.lock();
			self.terminate(&mut state, Status::Refused)
		};

		if remove {
			self.remove();
		}
	}

	fn dispatch(&self, state: &mut State, event: Event) -> bool {
		if state.status.is_closed() {
			return false;
		}

		if let Event::Terminated { code, reason } = &event {
			tracing::debug!(id = self.inner.id, code, %reason, "connection terminated");
			return self.terminate(state, Status::Closed);
		}

		if state.status == Status::Pending {
			state.backlog.push_back(event);
			return false;
		}

		match event {
			Event::Datagram { data, .. } => self.deliver(Inbound::Datagram(data)),
			Event::StreamData {
				stream_id,
				data,
				stream_ended,
				..
			} => self.reassemble(state, stream_id, data, stream_ended),
			Event::Headers { stream_ended: true, .. } | Event::Data { stream_ended: true, .. } => {
				return self.terminate(state, Status::Closed);
			}
			Event::Headers { .. } | Event::Data { .. } | Event::Terminated { .. } => {}
		}

		false
	}

	fn reassemble(&self, state: &mut State, stream_id: StreamId, data: Bytes, stream_ended: bool) {
		if state.passthrough {
			if !data.is_empty() {
				self.deliver(Inbound::Stream { stream_id, data });
			}
			return;
		}

		if !stream_ended {
			state.partial.entry(stream_id).or_default().extend_from_slice(&data);
			return;
		}

		let data = match state.partial.remove(&stream_id) {
			Some(mut buffer) => {
				buffer.extend_from_slice(&data);
				buffer.freeze()
			}
			None => data,
		};

		self.deliver(Inbound::Stream { stream_id, data });
	}

	fn replay(&self, state: &mut State) -> bool {
		let mut remove = false;
		while let Some(event) = state.backlog.pop_front() {
			remove |= self.dispatch(state, event);
		}
		remove
	}

	fn accept(&self, state: &mut State) -> Result<bool> {
		if state.status != Status::Pending {
			return Err(Error::InvalidState("accept"));
		}

		state.status = Status::Accepted;

		if self.inner.side == Side::Server {
			self.inner.link.send_headers(self.inner.id, accept_headers(), false);
		}

		Ok(self.replay(state))
	}

	// Application-initiated refuse or close.
	fn end(&self, state: &mut State, status: Status) -> bool {
		if state.status.is_closed() {
			return false;
		}

		if state.status == Status::Pending && self.inner.side == Side::Server {
			let code = match status {
				Status::Refused => "401",
				_ => "400",
			};
			self.inner
				.link
				.send_headers(self.inner.id, vec![(":status".to_string(), code.to_string())], false);
		}

		self.inner.link.send_data(self.inner.id, Bytes::new(), true);
		self.terminate(state, status)
	}

	fn terminate(&self, state: &mut State, status: Status) -> bool {
		if state.status.is_closed() {
			return false;
		}

		state.status = status;
		state.backlog.clear();
		state.partial.clear();
		self.signal_end();

		true
	}

	fn ensure_open(state: &State) -> Result<()> {
		match state.status.is_closed() {
			true => Err(Error::Closed),
			false => Ok(()),
		}
	}

	fn compress(state: &mut State, data: &[u8]) -> Result<Option<Bytes>> {
		state.deflater.as_mut().map(|deflater| deflater.compress(data)).transpose()
	}

	fn write_persistent(&self, state: &mut State, data: Bytes) {
		let link = &self.inner.link;
		let stream_id = *state.persistent.get_or_insert_with(|| link.open_uni(self.inner.id));
		link.send_stream_data(stream_id, data, false);
	}

	fn deliver(&self, message: Inbound) {
		// The receiver is gone once the application exits, which is fine.
		let _ = self.inner.queue.send(message);
	}

	fn signal_end(&self) {
		self.deliver(Inbound::End);
		self.inner.closed.send_replace(true);
	}

	fn remove(&self) {
		if !self.inner.removed.swap(true, Ordering::AcqRel) {
			(self.inner.remove)(self.inner.id);
		}
	}
}

impl std::fmt::Debug for Session {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Session")
			.field("id", &self.inner.id)
			.field("side", &self.inner.side)
			.field("status", &self.status())
			.finish()
	}
}

fn accept_headers() -> Headers {
	let mut headers = vec![
		(":status".to_string(), "200".to_string()),
		("server".to_string(), concat!("wtpub/", env!("CARGO_PKG_VERSION")).to_string()),
	];

	let format = time::macros::format_description!(
		"[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
	);
	if let Ok(date) = time::OffsetDateTime::now_utc().format(&format) {
		headers.push(("date".to_string(), date));
	}

	headers.push(("sec-webtransport-http3-draft".to_string(), "draft02".to_string()));
	headers
}

/// The receiving half of a session, owned by its application.
pub struct SessionReceiver {
	queue: mpsc::UnboundedReceiver<Inbound>,
	decoder: Option<Decoder>,
	ready: VecDeque<Inbound>,
	ended: bool,
}

impl SessionReceiver {
	fn new(queue: mpsc::UnboundedReceiver<Inbound>) -> Self {
		Self {
			queue,
			decoder: None,
			ready: VecDeque::new(),
			ended: false,
		}
	}

	/// Inflate stream payloads, yielding one [Inbound::Stream] per sync-flush unit.
	pub fn decompress(&mut self, window_bits: WindowBits) {
		self.decoder = Some(Decoder::new(window_bits));
	}

	/// Wait for the next message.
	///
	/// Returns [Inbound::End] once the session is over, and again on every later call.
	pub async fn recv(&mut self) -> Inbound {
		loop {
			if let Some(message) = self.ready.pop_front() {
				return message;
			}

			if self.ended {
				return Inbound::End;
			}

			let message = self.queue.recv().await.unwrap_or(Inbound::End);

			match (&mut self.decoder, message) {
				(_, Inbound::End) => {
					self.ended = true;
					return Inbound::End;
				}
				(Some(decoder), Inbound::Stream { stream_id, data }) => {
					decoder.push(&data);
					while let Some(unit) = decoder.next_unit() {
						match unit {
							Ok(data) => self.ready.push_back(Inbound::Stream { stream_id, data }),
							Err(err) => tracing::warn!(%err, "dropping undecodable unit"),
						}
					}
				}
				(_, message) => return message,
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{Command, Outbox, header};
	use std::sync::atomic::AtomicUsize;

	struct Harness {
		session: Session,
		receiver: SessionReceiver,
		commands: mpsc::UnboundedReceiver<Command>,
		removed: Arc<AtomicUsize>,
	}

	impl Harness {
		fn new(side: Side, compression: Compression) -> Self {
			let (outbox, commands) = Outbox::new(side);
			let removed = Arc::new(AtomicUsize::new(0));

			let counter = removed.clone();
			let remove: Remove = Arc::new(move |_| {
				counter.fetch_add(1, Ordering::SeqCst);
			});

			let (session, receiver) = Session::new(0, side, Link::new(Arc::new(outbox)), remove, compression);
			Self {
				session,
				receiver,
				commands,
				removed,
			}
		}

		fn server() -> Self {
			Self::new(Side::Server, Compression::None)
		}

		fn commands(&mut self) -> Vec<Command> {
			let mut out = Vec::new();
			while let Ok(command) = self.commands.try_recv() {
				if command != Command::Transmit {
					out.push(command);
				}
			}
			out
		}

		fn removed(&self) -> usize {
			self.removed.load(Ordering::SeqCst)
		}
	}

	fn stream(stream_id: StreamId, data: &'static [u8], stream_ended: bool) -> Event {
		Event::StreamData {
			session_id: 0,
			stream_id,
			data: Bytes::from_static(data),
			stream_ended,
		}
	}

	fn received(stream_id: StreamId, data: &'static [u8]) -> Inbound {
		Inbound::Stream {
			stream_id,
			data: Bytes::from_static(data),
		}
	}

	#[tokio::test]
	async fn backlog_replays_in_order() {
		let mut h = Harness::server();

		h.session.handle_event(stream(2, b"one", true));
		h.session.handle_event(Event::Datagram {
			session_id: 0,
			data: Bytes::from_static(b"dgram"),
		});
		h.session.handle_event(stream(6, b"two", true));
		assert!(h.receiver.queue.try_recv().is_err());

		h.session.send(Outbound::Accept).unwrap();
		assert_eq!(h.session.status(), Status::Accepted);

		assert_eq!(h.receiver.recv().await, received(2, b"one"));
		assert_eq!(h.receiver.recv().await, Inbound::Datagram(Bytes::from_static(b"dgram")));
		assert_eq!(h.receiver.recv().await, received(6, b"two"));

		let commands = h.commands();
		let Command::Headers { headers, .. } = &commands[0] else {
			panic!("expected headers, got {commands:?}");
		};
		assert_eq!(header(headers, ":status"), Some("200"));
		assert_eq!(header(headers, "sec-webtransport-http3-draft"), Some("draft02"));
		assert!(header(headers, "date").is_some_and(|date| date.ends_with(" GMT")));
		assert!(header(headers, "server").is_some());
	}

	#[tokio::test]
	async fn accept_twice_is_invalid() {
		let h = Harness::server();
		h.session.send(Outbound::Accept).unwrap();
		assert_eq!(h.session.send(Outbound::Accept), Err(Error::InvalidState("accept")));
	}

	#[tokio::test]
	async fn reassembles_fragments() {
		let mut h = Harness::server();
		h.session.send(Outbound::Accept).unwrap();

		// Two streams interleaved, each split into several fragments.
		h.session.handle_event(stream(2, b"hel", false));
		h.session.handle_event(stream(6, b"wor", false));
		h.session.handle_event(stream(2, b"lo ", false));
		h.session.handle_event(stream(6, b"ld", true));
		h.session.handle_event(stream(2, b"there", true));

		assert_eq!(h.receiver.recv().await, received(6, b"world"));
		assert_eq!(h.receiver.recv().await, received(2, b"hello there"));
	}

	#[tokio::test]
	async fn compressed_sessions_pass_fragments_through() {
		let mut h = Harness::new(Side::Server, Compression::Zlib);
		h.session.send(Outbound::Accept).unwrap();

		h.session.handle_event(stream(2, b"ab", false));
		h.session.handle_event(stream(2, b"cd", false));
		h.session.handle_event(stream(2, b"", true));

		assert_eq!(h.receiver.recv().await, received(2, b"ab"));
		assert_eq!(h.receiver.recv().await, received(2, b"cd"));
		assert!(h.receiver.queue.try_recv().is_err());
	}

	#[tokio::test]
	async fn one_shot_streams() {
		let mut h = Harness::server();
		h.session.send(Outbound::Accept).unwrap();
		h.commands();

		h.session.send(Outbound::Stream(Bytes::from_static(b"a"))).unwrap();
		h.session.send(Outbound::Stream(Bytes::from_static(b"b"))).unwrap();

		assert_eq!(
			h.commands(),
			vec![
				Command::OpenUni {
					session_id: 0,
					stream_id: 3
				},
				Command::StreamData {
					stream_id: 3,
					data: Bytes::from_static(b"a"),
					end_stream: true
				},
				Command::OpenUni {
					session_id: 0,
					stream_id: 7
				},
				Command::StreamData {
					stream_id: 7,
					data: Bytes::from_static(b"b"),
					end_stream: true
				},
			]
		);
	}

	#[tokio::test]
	async fn persistent_stream_is_reused() {
		let mut h = Harness::server();
		h.session.send(Outbound::Accept).unwrap();
		h.commands();

		h.session.send(Outbound::PersistentStream(Bytes::from_static(b"a"))).unwrap();
		h.session.send(Outbound::PersistentStream(Bytes::from_static(b"b"))).unwrap();

		assert_eq!(
			h.commands(),
			vec![
				Command::OpenUni {
					session_id: 0,
					stream_id: 3
				},
				Command::StreamData {
					stream_id: 3,
					data: Bytes::from_static(b"a"),
					end_stream: false
				},
				Command::StreamData {
					stream_id: 3,
					data: Bytes::from_static(b"b"),
					end_stream: false
				},
			]
		);
	}

	#[tokio::test]
	async fn compressed_round_trip() {
		let mut sender = Harness::new(Side::Client, Compression::Zlib);
		sender.session.enable_compression(WindowBits::default());
		sender.session.activate();

		let payloads: Vec<Bytes> = (0..10)
			.map(|i| Bytes::from(format!("PUBLISHER_FIXED_DATA_{i:06}_{:010}", 42 + i)))
			.collect();

		for payload in &payloads {
			sender.session.send(Outbound::Stream(payload.clone())).unwrap();
		}

		let mut wire = Vec::new();
		for command in sender.commands() {
			match command {
				Command::OpenUni { .. } => {}
				Command::StreamData { data, end_stream, .. } => {
					assert!(!end_stream);
					wire.push(data);
				}
				other => panic!("unexpected {other:?}"),
			}
		}
		assert_eq!(wire.len(), payloads.len());

		let mut receiver = Harness::new(Side::Server, Compression::Zlib);
		receiver.receiver.decompress(WindowBits::default());
		receiver.session.send(Outbound::Accept).unwrap();

		// Pairs of units arrive concatenated in a single read.
		for pair in wire.chunks(2) {
			let joined: Vec<u8> = pair.iter().flat_map(|unit| unit.iter().copied()).collect();
			receiver.session.handle_event(Event::StreamData {
				session_id: 0,
				stream_id: 2,
				data: joined.into(),
				stream_ended: false,
			});
		}

		for payload in payloads {
			assert_eq!(
				receiver.receiver.recv().await,
				Inbound::Stream {
					stream_id: 2,
					data: payload
				}
			);
		}
	}

	#[tokio::test]
	#[tracing_test::traced_test]
	async fn undecodable_unit_is_dropped() {
		let mut h = Harness::new(Side::Server, Compression::Zlib);
		h.receiver.decompress(WindowBits::default());
		h.session.send(Outbound::Accept).unwrap();

		// A reserved block type, terminated by the marker.
		h.session.handle_event(stream(2, &[0xff, 0x00, 0x00, 0xff, 0xff], false));

		let mut deflater = Deflater::new(WindowBits::default());
		h.session.handle_event(Event::StreamData {
			session_id: 0,
			stream_id: 2,
			data: deflater.compress(b"hello").unwrap(),
			stream_ended: false,
		});

		assert_eq!(h.receiver.recv().await, received(2, b"hello"));
		assert!(logs_contain("dropping undecodable unit"));
	}

	#[tokio::test]
	async fn refuse_before_accept() {
		let mut h = Harness::server();
		h.session.send(Outbound::Refuse).unwrap();

		assert_eq!(h.session.status(), Status::Refused);
		assert_eq!(h.receiver.recv().await, Inbound::End);
		assert_eq!(h.removed(), 1);

		assert_eq!(
			h.commands(),
			vec![
				Command::Headers {
					stream_id: 0,
					headers: vec![(":status".to_string(), "401".to_string())],
					end_stream: false
				},
				Command::Data {
					stream_id: 0,
					data: Bytes::new(),
					end_stream: true
				},
			]
		);
	}

	#[tokio::test]
	async fn close_before_accept() {
		let mut h = Harness::server();
		h.session.close();

		let commands = h.commands();
		assert_eq!(
			commands[0],
			Command::Headers {
				stream_id: 0,
				headers: vec![(":status".to_string(), "400".to_string())],
				end_stream: false
			}
		);
		assert_eq!(h.session.status(), Status::Closed);
	}

	#[tokio::test]
	async fn close_is_idempotent() {
		let mut h = Harness::server();
		h.session.send(Outbound::Accept).unwrap();

		h.session.close();
		h.session.close();
		h.session.handle_event(Event::Terminated {
			code: 0,
			reason: "gone".into(),
		});

		assert_eq!(h.removed(), 1);
		assert_eq!(h.receiver.recv().await, Inbound::End);
		assert_eq!(h.receiver.recv().await, Inbound::End);

		// Only one end of stream is written.
		let ends = h
			.commands()
			.into_iter()
			.filter(|c| matches!(c, Command::Data { end_stream: true, .. }))
			.count();
		assert_eq!(ends, 1);
	}

	#[tokio::test]
	async fn events_after_close_are_ignored() {
		let mut h = Harness::server();
		h.session.send(Outbound::Accept).unwrap();
		h.session.handle_event(Event::Data {
			stream_id: 0,
			data: Bytes::new(),
			stream_ended: true,
		});

		assert_eq!(h.session.status(), Status::Closed);
		assert_eq!(h.removed(), 1);

		h.session.handle_event(stream(2, b"late", true));
		assert_eq!(h.receiver.recv().await, Inbound::End);
		assert_eq!(h.receiver.recv().await, Inbound::End);

		assert_eq!(
			h.session.send(Outbound::Datagram(Bytes::from_static(b"x"))),
			Err(Error::Closed)
		);
	}

	#[tokio::test]
	async fn termination_while_pending() {
		let mut h = Harness::server();
		h.session.handle_event(stream(2, b"buffered", true));
		h.session.handle_event(Event::Terminated {
			code: 0,
			reason: "idle".into(),
		});

		assert_eq!(h.session.status(), Status::Closed);
		assert_eq!(h.receiver.recv().await, Inbound::End);
		assert_eq!(h.removed(), 1);
		assert_eq!(h.session.send(Outbound::Accept), Err(Error::InvalidState("accept")));
	}

	#[tokio::test]
	async fn closed_signal() {
		let h = Harness::server();
		let session = h.session.clone();
		let waiter = tokio::spawn(async move { session.closed().await });

		h.session.send(Outbound::Accept).unwrap();
		h.session.close();
		waiter.await.unwrap();
	}

	struct Echo;

	impl Application for Echo {
		fn run(&self, mut context: Context) -> futures::future::BoxFuture<'static, Result<()>> {
			Box::pin(async move {
				loop {
					match context.receiver.recv().await {
						Inbound::End => return Ok(()),
						Inbound::Datagram(data) => context.session.send(Outbound::Datagram(data))?,
						_ => {}
					}
				}
			})
		}
	}

	struct Stuck;

	impl Application for Stuck {
		fn run(&self, _context: Context) -> futures::future::BoxFuture<'static, Result<()>> {
			Box::pin(std::future::pending())
		}
	}

	fn context(h: Harness) -> (Session, Context, mpsc::UnboundedReceiver<Command>, Arc<AtomicUsize>) {
		let context = Context {
			request: crate::Request::connect("localhost", "/"),
			session: h.session.clone(),
			receiver: h.receiver,
		};
		(h.session, context, h.commands, h.removed)
	}

	#[tokio::test]
	async fn finish_waits_for_application() {
		let (session, context, _commands, removed) = context(Harness::server());
		session.send(Outbound::Accept).unwrap();
		session.spawn(Arc::new(Echo), context);

		session.finish(Duration::from_secs(1)).await;

		// The application saw the end, returned, and the session closed behind it.
		assert_eq!(session.status(), Status::Closed);
		assert_eq!(removed.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn finish_aborts_stuck_application() {
		let (session, context, _commands, removed) = context(Harness::server());
		session.send(Outbound::Accept).unwrap();
		session.spawn(Arc::new(Stuck), context);

		session.finish(Duration::from_secs(5)).await;

		// Aborted, so nothing closed the session.
		assert_eq!(session.status(), Status::Accepted);
		assert_eq!(removed.load(Ordering::SeqCst), 0);
	}
}
