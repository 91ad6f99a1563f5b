use bytes::Bytes;

use crate::{Deflater, Result, WindowBits};

/// Identifies a [CompressionGroup] within its topic.
pub type GroupId = u64;

/// The group every mergeable subscriber is moved to.
pub const FALLBACK_GROUP: GroupId = 0;

/// A deflate stream shared by every subscriber that is a member.
///
/// Each call to [CompressionGroup::compress] advances the shared stream state,
/// so its output must reach every member, in order, and nobody else.
pub struct CompressionGroup {
	deflater: Deflater,
	threshold: u64,
	bytes: u64,
	members: usize,
	output: Bytes,
}

impl CompressionGroup {
	pub fn new(window_bits: WindowBits) -> Self {
		Self {
			deflater: Deflater::new(window_bits),
			threshold: window_bits.threshold(),
			bytes: 0,
			members: 0,
			output: Bytes::new(),
		}
	}

	/// Feed a payload through the shared stream and remember the unit produced.
	pub fn compress(&mut self, payload: &[u8]) -> Result<Bytes> {
		self.output = self.deflater.compress(payload)?;
		self.bytes += payload.len() as u64;
		Ok(self.output.clone())
	}

	/// The unit produced by the most recent [CompressionGroup::compress].
	pub fn output(&self) -> &Bytes {
		&self.output
	}

	/// Raw bytes fed into the stream so far.
	pub fn bytes(&self) -> u64 {
		self.bytes
	}

	pub fn members(&self) -> usize {
		self.members
	}

	/// Nothing has been compressed yet, so a joining subscriber needs no prior state.
	pub fn is_new(&self) -> bool {
		self.bytes == 0
	}

	pub fn is_mergeable(&self) -> bool {
		self.bytes > self.threshold
	}

	pub fn is_empty(&self) -> bool {
		self.members == 0
	}

	pub fn add_member(&mut self) {
		self.members += 1;
	}

	pub fn remove_member(&mut self) {
		self.members = self.members.saturating_sub(1);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::Decoder;

	#[test]
	fn predicates() {
		let window_bits = WindowBits::new(9).unwrap();
		let mut group = CompressionGroup::new(window_bits);
		assert!(group.is_new());
		assert!(group.is_empty());
		assert!(!group.is_mergeable());

		group.add_member();
		assert!(!group.is_empty());

		group.compress(&[b'a'; 512]).unwrap();
		assert!(!group.is_new());
		assert_eq!(group.bytes(), 512);

		// The threshold must be exceeded, not reached.
		assert!(!group.is_mergeable());
		group.compress(b"b").unwrap();
		assert!(group.is_mergeable());
	}

	#[test]
	fn members_never_underflow() {
		let mut group = CompressionGroup::new(WindowBits::default());
		group.remove_member();
		assert_eq!(group.members(), 0);
		group.add_member();
		group.add_member();
		group.remove_member();
		assert_eq!(group.members(), 1);
	}

	#[test]
	fn output_is_decodable_in_order() {
		let mut group = CompressionGroup::new(WindowBits::default());
		let mut decoder = Decoder::new(WindowBits::default());

		for payload in ["one", "two", "two", "three"] {
			let unit = group.compress(payload.as_bytes()).unwrap();
			assert_eq!(&unit, group.output());

			decoder.push(&unit);
			assert_eq!(decoder.next_unit().unwrap().unwrap(), payload.as_bytes());
		}
	}
}
