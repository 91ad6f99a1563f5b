/// A list of possible errors that can occur within a session or the broker core.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
	/// The session is already closed or refused.
	#[error("session closed")]
	Closed,

	/// The operation is not valid in the session's current state.
	#[error("invalid state: {0}")]
	InvalidState(&'static str),

	/// The peer answered the CONNECT with a non-200 status.
	#[error("refused status={0}")]
	Refused(u16),

	/// The QUIC connection went away.
	#[error("connection terminated: {0}")]
	Terminated(String),

	#[error("unknown topic: {0}")]
	UnknownTopic(String),

	#[error("missing parameter: {0}")]
	MissingParameter(&'static str),

	#[error("unexpected message: {0}")]
	UnexpectedMessage(&'static str),

	#[error("compression failed: {0}")]
	Compress(String),

	#[error("decompression failed: {0}")]
	Decompress(String),

	/// Deflate window bits must be in 9..=15.
	#[error("invalid window bits: {0}")]
	WindowBits(u8),

	/// The payload source failed to produce the next payload.
	#[error("payload source: {0}")]
	Source(String),
}

pub type Result<T> = std::result::Result<T, Error>;
