use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::{Notify, mpsc};

use crate::{Headers, StreamId};

/// Which end of the QUIC connection we are.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Side {
	Client,
	Server,
}

/// The capabilities the session layer needs from the HTTP/3 engine.
///
/// Every call is non-blocking; the engine is expected to queue the work and flush it on [Transport::transmit].
pub trait Transport: Send + Sync + 'static {
	/// Send a HEADERS frame on a request stream.
	fn send_headers(&self, stream_id: StreamId, headers: Headers, end_stream: bool);

	/// Send a DATA frame on a request stream.
	fn send_data(&self, stream_id: StreamId, data: Bytes, end_stream: bool);

	/// Open a new unidirectional WebTransport stream for the given session.
	fn open_uni(&self, session_id: StreamId) -> StreamId;

	/// Write to a WebTransport stream previously returned by [Transport::open_uni].
	fn send_stream_data(&self, stream_id: StreamId, data: Bytes, end_stream: bool);

	/// Send an HTTP datagram for the given session.
	fn send_datagram(&self, session_id: StreamId, data: Bytes);

	/// Allocate the next bidirectional stream for a CONNECT request.
	fn next_request_id(&self) -> StreamId;

	/// Flush anything queued.
	fn transmit(&self);

	/// Issue a transport-level ping.
	fn ping(&self);
}

/// A unit of work queued by an [Outbox].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
	Headers {
		stream_id: StreamId,
		headers: Headers,
		end_stream: bool,
	},
	Data {
		stream_id: StreamId,
		data: Bytes,
		end_stream: bool,
	},
	OpenUni {
		session_id: StreamId,
		stream_id: StreamId,
	},
	StreamData {
		stream_id: StreamId,
		data: Bytes,
		end_stream: bool,
	},
	Datagram {
		session_id: StreamId,
		data: Bytes,
	},
	Transmit,
	Ping,
}

/// A [Transport] that records every call as a [Command] on a channel.
///
/// Stream ids follow QUIC numbering: the two low bits encode the initiator and directionality.
pub struct Outbox {
	side: Side,
	next_bi: AtomicU64,
	next_uni: AtomicU64,
	commands: mpsc::UnboundedSender<Command>,
}

impl Outbox {
	pub fn new(side: Side) -> (Self, mpsc::UnboundedReceiver<Command>) {
		let (commands, rx) = mpsc::unbounded_channel();
		let outbox = Self {
			side,
			next_bi: AtomicU64::new(0),
			next_uni: AtomicU64::new(0),
			commands,
		};
		(outbox, rx)
	}

	fn stream_id(&self, counter: &AtomicU64, uni: bool) -> StreamId {
		let index = counter.fetch_add(1, Ordering::Relaxed);
		let initiator = match self.side {
			Side::Client => 0,
			Side::Server => 1,
		};
		(index << 2) | ((uni as u64) << 1) | initiator
	}

	fn push(&self, command: Command) {
		// The receiver is gone when the driver has exited, in which case there is nobody to send to.
		let _ = self.commands.send(command);
	}
}

impl Transport for Outbox {
	fn send_headers(&self, stream_id: StreamId, headers: Headers, end_stream: bool) {
		self.push(Command::Headers {
			stream_id,
			headers,
			end_stream,
		});
	}

	fn send_data(&self, stream_id: StreamId, data: Bytes, end_stream: bool) {
		self.push(Command::Data {
			stream_id,
			data,
			end_stream,
		});
	}

	fn open_uni(&self, session_id: StreamId) -> StreamId {
		let stream_id = self.stream_id(&self.next_uni, true);
		self.push(Command::OpenUni { session_id, stream_id });
		stream_id
	}

	fn send_stream_data(&self, stream_id: StreamId, data: Bytes, end_stream: bool) {
		self.push(Command::StreamData {
			stream_id,
			data,
			end_stream,
		});
	}

	fn send_datagram(&self, session_id: StreamId, data: Bytes) {
		self.push(Command::Datagram { session_id, data });
	}

	fn next_request_id(&self) -> StreamId {
		self.stream_id(&self.next_bi, false)
	}

	fn transmit(&self) {
		self.push(Command::Transmit);
	}

	fn ping(&self) {
		self.push(Command::Ping);
	}
}

/// The transport handle shared by a connection and its sessions.
///
/// Every transmit counts as connection activity, which resets the client keepalive.
#[derive(Clone)]
pub(crate) struct Link {
	transport: Arc<dyn Transport>,
	activity: Arc<Notify>,
}

impl Link {
	pub fn new(transport: Arc<dyn Transport>) -> Self {
		Self {
			transport,
			activity: Default::default(),
		}
	}

	pub fn send_headers(&self, stream_id: StreamId, headers: Headers, end_stream: bool) {
		self.transport.send_headers(stream_id, headers, end_stream);
	}

	pub fn send_data(&self, stream_id: StreamId, data: Bytes, end_stream: bool) {
		self.transport.send_data(stream_id, data, end_stream);
	}

	pub fn open_uni(&self, session_id: StreamId) -> StreamId {
		self.transport.open_uni(session_id)
	}

	pub fn send_stream_data(&self, stream_id: StreamId, data: Bytes, end_stream: bool) {
		self.transport.send_stream_data(stream_id, data, end_stream);
	}

	pub fn send_datagram(&self, session_id: StreamId, data: Bytes) {
		self.transport.send_datagram(session_id, data);
	}

	pub fn next_request_id(&self) -> StreamId {
		self.transport.next_request_id()
	}

	pub fn transmit(&self) {
		self.transport.transmit();
		self.touch();
	}

	/// Ping without counting as activity, otherwise the keepalive would reset itself.
	pub fn ping(&self) {
		self.transport.ping();
		self.transport.transmit();
	}

	pub fn touch(&self) {
		self.activity.notify_one();
	}

	pub async fn active(&self) {
		self.activity.notified().await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn client_stream_ids() {
		let (outbox, _rx) = Outbox::new(Side::Client);
		assert_eq!(outbox.next_request_id(), 0);
		assert_eq!(outbox.next_request_id(), 4);
		assert_eq!(outbox.open_uni(0), 2);
		assert_eq!(outbox.open_uni(0), 6);
	}

	#[test]
	fn server_stream_ids() {
		let (outbox, mut rx) = Outbox::new(Side::Server);
		assert_eq!(outbox.open_uni(0), 3);
		assert_eq!(outbox.open_uni(4), 7);

		assert_eq!(
			rx.try_recv().unwrap(),
			Command::OpenUni {
				session_id: 0,
				stream_id: 3
			}
		);
		assert_eq!(
			rx.try_recv().unwrap(),
			Command::OpenUni {
				session_id: 4,
				stream_id: 7
			}
		);
	}

	#[test]
	fn commands_are_queued_in_order() {
		let (outbox, mut rx) = Outbox::new(Side::Server);
		outbox.send_datagram(0, Bytes::from_static(b"a"));
		outbox.transmit();
		outbox.ping();

		assert!(matches!(rx.try_recv().unwrap(), Command::Datagram { session_id: 0, .. }));
		assert_eq!(rx.try_recv().unwrap(), Command::Transmit);
		assert_eq!(rx.try_recv().unwrap(), Command::Ping);
		assert!(rx.try_recv().is_err());
	}
}
