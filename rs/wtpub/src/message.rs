use bytes::Bytes;

use crate::StreamId;

/// A message delivered to a session's application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
	/// The peer asked to open the session; always the first message on the server.
	Connect,

	/// An HTTP datagram.
	Datagram(Bytes),

	/// A payload received on a unidirectional stream.
	///
	/// Without compression this is a whole stream. With compression it is one decoded unit.
	Stream { stream_id: StreamId, data: Bytes },

	/// A payload fanned out by the broker for this subscriber.
	Publish(Bytes),

	/// The session is over. Repeated forever once observed.
	End,
}

impl Inbound {
	pub fn name(&self) -> &'static str {
		match self {
			Self::Connect => "connect",
			Self::Datagram(_) => "datagram-receive",
			Self::Stream { .. } => "stream-receive",
			Self::Publish(_) => "publish",
			Self::End => "stream-end",
		}
	}

	/// The payload carried by this message, if any.
	pub fn payload(&self) -> Option<&Bytes> {
		match self {
			Self::Datagram(data) | Self::Stream { data, .. } | Self::Publish(data) => Some(data),
			Self::Connect | Self::End => None,
		}
	}
}

/// A message sent by a session's application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
	/// Approve the CONNECT request.
	Accept,

	/// Reject the CONNECT request.
	Refuse,

	/// Close the session.
	Close,

	/// Send an HTTP datagram.
	Datagram(Bytes),

	/// Open a unidirectional stream, write the payload and finish it.
	Stream(Bytes),

	/// Write the payload to the session's long-lived unidirectional stream.
	PersistentStream(Bytes),
}

impl Outbound {
	pub fn name(&self) -> &'static str {
		match self {
			Self::Accept => "accept",
			Self::Refuse => "refuse",
			Self::Close => "close",
			Self::Datagram(_) => "datagram-send",
			Self::Stream(_) => "stream-send",
			Self::PersistentStream(_) => "persistent-stream-send",
		}
	}
}
