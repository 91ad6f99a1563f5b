//! Stream compression shared by sessions and compression groups.
//!
//! Payloads are compressed with raw deflate and flushed with a sync flush after each payload,
//! so every payload becomes one independently decodable unit ending in [SYNC_FLUSH_MARKER].
//! A receiver buffers raw bytes, splits on the marker and inflates each unit in order.

use bytes::{Buf, Bytes, BytesMut};
use flate2::{Compress, Decompress, FlushCompress, FlushDecompress, Status};

use crate::{Error, Result};

/// The trailer produced by a deflate sync flush: an empty stored block.
///
/// This is the framing contract between a compressing sender and its receiver.
pub const SYNC_FLUSH_MARKER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// The compression negotiated via the `compression` query parameter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Compression {
	#[default]
	None,
	Zlib,
}

impl Compression {
	/// Parse the query parameter value; anything other than `zlib` means no compression.
	pub fn from_param(value: Option<&str>) -> Self {
		match value {
			Some(value) if value.eq_ignore_ascii_case("zlib") => Self::Zlib,
			_ => Self::None,
		}
	}

	pub fn as_param(&self) -> Option<&'static str> {
		match self {
			Self::None => None,
			Self::Zlib => Some("zlib"),
		}
	}

	pub fn is_enabled(&self) -> bool {
		matches!(self, Self::Zlib)
	}
}

/// The deflate window size as a power of two.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WindowBits(u8);

impl WindowBits {
	pub const MIN: u8 = 9;
	pub const MAX: u8 = 15;

	pub fn new(bits: u8) -> Result<Self> {
		match bits {
			Self::MIN..=Self::MAX => Ok(Self(bits)),
			_ => Err(Error::WindowBits(bits)),
		}
	}

	pub fn get(&self) -> u8 {
		self.0
	}

	/// The number of raw bytes after which a compression group becomes mergeable.
	pub fn threshold(&self) -> u64 {
		1 << self.0
	}
}

impl Default for WindowBits {
	fn default() -> Self {
		Self(Self::MAX)
	}
}

impl TryFrom<u8> for WindowBits {
	type Error = Error;

	fn try_from(bits: u8) -> Result<Self> {
		Self::new(bits)
	}
}

/// A persistent deflate stream that emits one sync-flush unit per payload.
pub struct Deflater {
	inner: Compress,
}

impl Deflater {
	pub fn new(window_bits: WindowBits) -> Self {
		Self {
			inner: Compress::new_with_window_bits(flate2::Compression::default(), false, window_bits.get()),
		}
	}

	/// Compress the payload and flush, returning a unit ending in [SYNC_FLUSH_MARKER].
	///
	/// An empty payload still flushes, producing a unit that inflates to nothing.
	pub fn compress(&mut self, payload: &[u8]) -> Result<Bytes> {
		let mut output = Vec::with_capacity(payload.len() + 64);
		let mut offset = 0;

		loop {
			if output.len() == output.capacity() {
				output.reserve(4096);
			}

			let before = self.inner.total_in();
			self.inner
				.compress_vec(&payload[offset..], &mut output, FlushCompress::Sync)
				.map_err(|err| Error::Compress(err.to_string()))?;
			offset += (self.inner.total_in() - before) as usize;

			// The flush is complete once all input is consumed and zlib left room in the output.
			if offset == payload.len() && output.len() < output.capacity() {
				break;
			}
		}

		Ok(output.into())
	}
}

/// Reassembles and inflates sync-flush units from an arbitrarily fragmented byte stream.
pub struct Decoder {
	inner: Decompress,
	window_bits: WindowBits,
	buffer: BytesMut,

	// How far the buffer has been searched for a marker already.
	scanned: usize,
}

impl Decoder {
	pub fn new(window_bits: WindowBits) -> Self {
		Self {
			inner: Decompress::new_with_window_bits(false, window_bits.get()),
			window_bits,
			buffer: BytesMut::new(),
			scanned: 0,
		}
	}

	/// Append raw bytes received from the transport.
	pub fn push(&mut self, data: &[u8]) {
		self.buffer.extend_from_slice(data);
	}

	/// The number of bytes waiting for a marker.
	pub fn buffered(&self) -> usize {
		self.buffer.len()
	}

	/// Return the next complete unit, inflated.
	///
	/// Returns `None` once no complete unit is buffered.
	/// A unit that fails to inflate is consumed and returned as an error; the remaining buffer is kept.
	pub fn next_unit(&mut self) -> Option<Result<Bytes>> {
		let start = self.scanned.saturating_sub(SYNC_FLUSH_MARKER.len() - 1);
		let found = self.buffer[start..]
			.windows(SYNC_FLUSH_MARKER.len())
			.position(|window| window == SYNC_FLUSH_MARKER);

		let Some(position) = found else {
			self.scanned = self.buffer.len();
			return None;
		};

		let unit = self.buffer.split_to(start + position + SYNC_FLUSH_MARKER.len()).freeze();
		self.scanned = 0;

		Some(self.inflate(unit))
	}

	fn inflate(&mut self, mut unit: Bytes) -> Result<Bytes> {
		let mut output = Vec::with_capacity(unit.len() * 4 + 64);

		loop {
			if output.len() == output.capacity() {
				output.reserve(unit.len().max(4096));
			}

			let before_in = self.inner.total_in();
			let before_out = self.inner.total_out();

			let status = match self.inner.decompress_vec(&unit, &mut output, FlushDecompress::Sync) {
				Ok(status) => status,
				Err(err) => {
					// zlib refuses all further input after a data error, so start over.
					self.inner = Decompress::new_with_window_bits(false, self.window_bits.get());
					return Err(Error::Decompress(err.to_string()));
				}
			};

			let consumed = (self.inner.total_in() - before_in) as usize;
			let produced = self.inner.total_out() - before_out;
			unit.advance(consumed);

			if status == Status::StreamEnd || (unit.is_empty() && output.len() < output.capacity()) {
				break;
			}

			if consumed == 0 && produced == 0 && output.len() < output.capacity() {
				return Err(Error::Decompress("truncated unit".into()));
			}
		}

		Ok(output.into())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn payloads() -> Vec<Bytes> {
		(0..8)
			.map(|i| Bytes::from(format!("PUBLISHER_FIXED_DATA_{:06}_{:010}", i, 1_000 + i)))
			.collect()
	}

	#[test]
	fn window_bits_range() {
		assert_eq!(WindowBits::default().get(), 15);
		assert_eq!(WindowBits::default().threshold(), 32768);
		assert_eq!(WindowBits::new(9).unwrap().threshold(), 512);
		assert_eq!(WindowBits::new(8), Err(Error::WindowBits(8)));
		assert_eq!(WindowBits::try_from(16), Err(Error::WindowBits(16)));
	}

	#[test]
	fn compression_param() {
		assert_eq!(Compression::from_param(Some("zlib")), Compression::Zlib);
		assert_eq!(Compression::from_param(Some("ZLIB")), Compression::Zlib);
		assert_eq!(Compression::from_param(Some("gzip")), Compression::None);
		assert_eq!(Compression::from_param(None), Compression::None);
		assert_eq!(Compression::Zlib.as_param(), Some("zlib"));
	}

	#[test]
	fn units_end_with_marker() {
		let mut deflater = Deflater::new(WindowBits::default());
		for payload in payloads() {
			let unit = deflater.compress(&payload).unwrap();
			assert!(unit.ends_with(&SYNC_FLUSH_MARKER));
		}
	}

	#[test]
	fn empty_payload_is_a_unit() {
		let mut deflater = Deflater::new(WindowBits::default());
		let mut decoder = Decoder::new(WindowBits::default());

		for payload in [&b"a"[..], b"", b"b"] {
			let unit = deflater.compress(payload).unwrap();
			assert!(unit.ends_with(&SYNC_FLUSH_MARKER));

			decoder.push(&unit);
			assert_eq!(decoder.next_unit().unwrap().unwrap(), payload);
			assert!(decoder.next_unit().is_none());
		}
	}

	#[test]
	fn sequence_survives_concatenation() {
		let mut deflater = Deflater::new(WindowBits::default());
		let mut decoder = Decoder::new(WindowBits::default());

		let mut wire = BytesMut::new();
		for payload in payloads() {
			wire.extend_from_slice(&deflater.compress(&payload).unwrap());
		}

		// Everything arrives in one read.
		decoder.push(&wire);

		let mut decoded = Vec::new();
		while let Some(unit) = decoder.next_unit() {
			decoded.push(unit.unwrap());
		}

		assert_eq!(decoded, payloads());
		assert_eq!(decoder.buffered(), 0);
	}

	#[test]
	fn sequence_survives_fragmentation() {
		let mut deflater = Deflater::new(WindowBits::default());
		let mut decoder = Decoder::new(WindowBits::default());

		let mut wire = BytesMut::new();
		for payload in payloads() {
			wire.extend_from_slice(&deflater.compress(&payload).unwrap());
		}

		// Three bytes at a time, so markers straddle reads.
		let mut decoded = Vec::new();
		for chunk in wire.chunks(3) {
			decoder.push(chunk);
			while let Some(unit) = decoder.next_unit() {
				decoded.push(unit.unwrap());
			}
		}

		assert_eq!(decoded, payloads());
	}

	#[test]
	fn partial_unit_waits_for_marker() {
		let mut deflater = Deflater::new(WindowBits::default());
		let mut decoder = Decoder::new(WindowBits::default());

		let unit = deflater.compress(b"hello world").unwrap();
		decoder.push(&unit[..unit.len() - 1]);
		assert!(decoder.next_unit().is_none());

		decoder.push(&unit[unit.len() - 1..]);
		assert_eq!(decoder.next_unit().unwrap().unwrap(), Bytes::from_static(b"hello world"));
		assert!(decoder.next_unit().is_none());
	}

	#[test]
	fn corrupt_unit_is_dropped() {
		let mut decoder = Decoder::new(WindowBits::default());

		// Block type 3 is reserved, so inflate rejects it.
		decoder.push(&[0xff, 0xff, 0xff, 0x00, 0x00, 0xff, 0xff]);
		assert!(matches!(decoder.next_unit(), Some(Err(Error::Decompress(_)))));

		// A fresh stream after the bad unit still decodes.
		let mut deflater = Deflater::new(WindowBits::default());
		decoder.push(&deflater.compress(b"recovered").unwrap());
		assert_eq!(decoder.next_unit().unwrap().unwrap(), Bytes::from_static(b"recovered"));
	}
}
