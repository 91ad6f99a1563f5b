use bytes::Bytes;

/// A QUIC stream identifier, also used to identify a WebTransport session by its CONNECT stream.
pub type StreamId = u64;

/// A list of HTTP/3 header fields, pseudo-headers included.
pub type Headers = Vec<(String, String)>;

/// A discrete protocol event emitted by the HTTP/3 engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
	/// A HEADERS frame on a request stream.
	Headers {
		stream_id: StreamId,
		headers: Headers,
		stream_ended: bool,
	},

	/// A DATA frame on a request stream.
	Data {
		stream_id: StreamId,
		data: Bytes,
		stream_ended: bool,
	},

	/// An HTTP datagram associated with a session.
	Datagram { session_id: StreamId, data: Bytes },

	/// Bytes received on a WebTransport stream belonging to a session.
	StreamData {
		session_id: StreamId,
		stream_id: StreamId,
		data: Bytes,
		stream_ended: bool,
	},

	/// The QUIC connection is gone.
	Terminated { code: u64, reason: String },
}

/// The discriminant of an [Event], used for routing and logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
	Headers,
	Data,
	Datagram,
	StreamData,
	Terminated,
}

impl Event {
	pub fn kind(&self) -> EventKind {
		match self {
			Self::Headers { .. } => EventKind::Headers,
			Self::Data { .. } => EventKind::Data,
			Self::Datagram { .. } => EventKind::Datagram,
			Self::StreamData { .. } => EventKind::StreamData,
			Self::Terminated { .. } => EventKind::Terminated,
		}
	}

	/// The session this event belongs to, if any.
	///
	/// Request stream events are keyed by their own stream id, which is the session id.
	pub fn session_id(&self) -> Option<StreamId> {
		match self {
			Self::Headers { stream_id, .. } | Self::Data { stream_id, .. } => Some(*stream_id),
			Self::Datagram { session_id, .. } | Self::StreamData { session_id, .. } => Some(*session_id),
			Self::Terminated { .. } => None,
		}
	}
}

/// Returns the value of the first header with the given name.
pub fn header<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
	headers
		.iter()
		.find(|(key, _)| key.eq_ignore_ascii_case(name))
		.map(|(_, value)| value.as_str())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn session_id_routing() {
		let headers = Event::Headers {
			stream_id: 4,
			headers: vec![],
			stream_ended: false,
		};
		assert_eq!(headers.kind(), EventKind::Headers);
		assert_eq!(headers.session_id(), Some(4));

		let data = Event::StreamData {
			session_id: 0,
			stream_id: 7,
			data: Bytes::from_static(b"x"),
			stream_ended: true,
		};
		assert_eq!(data.kind(), EventKind::StreamData);
		assert_eq!(data.session_id(), Some(0));

		let terminated = Event::Terminated {
			code: 0,
			reason: "bye".into(),
		};
		assert_eq!(terminated.session_id(), None);
	}

	#[test]
	fn header_lookup_is_case_insensitive() {
		let headers = vec![(":status".to_string(), "200".to_string()), ("Server".to_string(), "x".to_string())];
		assert_eq!(header(&headers, ":status"), Some("200"));
		assert_eq!(header(&headers, "server"), Some("x"));
		assert_eq!(header(&headers, "date"), None);
	}
}
