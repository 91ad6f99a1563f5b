use std::collections::BTreeMap;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{Compression, CompressionGroup, FALLBACK_GROUP, GroupId, Inbound, Result, WindowBits};

/// Identifies a subscriber within its topic.
pub type SubscriberId = u64;

/// The delivery queue of a subscribing session.
#[derive(Clone, Debug)]
pub struct Endpoint {
	queue: mpsc::UnboundedSender<Inbound>,
}

impl Endpoint {
	pub fn new(queue: mpsc::UnboundedSender<Inbound>) -> Self {
		Self { queue }
	}

	/// Returns false if the session is gone.
	pub fn deliver(&self, message: Inbound) -> bool {
		self.queue.send(message).is_ok()
	}
}

struct Subscriber {
	id: SubscriberId,
	endpoint: Endpoint,
	group: Option<GroupId>,
}

/// The state of a single topic: its compression groups, its subscribers and the last payload.
pub struct Topic {
	name: String,
	window_bits: WindowBits,
	groups: BTreeMap<GroupId, CompressionGroup>,
	subscribers: Vec<Subscriber>,
	last: Option<Bytes>,
	next_id: SubscriberId,
}

impl Topic {
	pub fn new(name: impl Into<String>, window_bits: WindowBits) -> Self {
		Self {
			name: name.into(),
			window_bits,
			groups: BTreeMap::new(),
			subscribers: Vec::new(),
			last: None,
			next_id: 0,
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	/// The most recently published payload, replayed to late joiners.
	pub fn last(&self) -> Option<&Bytes> {
		self.last.as_ref()
	}

	pub fn group(&self, id: GroupId) -> Option<&CompressionGroup> {
		self.groups.get(&id)
	}

	pub fn group_ids(&self) -> impl Iterator<Item = GroupId> + '_ {
		self.groups.keys().copied()
	}

	/// The group a subscriber is bound to, or `None` if it is unknown or uncompressed.
	pub fn subscriber_group(&self, id: SubscriberId) -> Option<GroupId> {
		self.subscribers.iter().find(|s| s.id == id)?.group
	}

	pub fn len(&self) -> usize {
		self.subscribers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.subscribers.is_empty()
	}

	/// Pick the group for a new subscriber, creating it if needed.
	///
	/// Uncompressed subscribers get no group. Otherwise the first group that has not compressed anything
	/// is reused, so only one group at a time is waiting for its first payload.
	fn assign_group(&mut self, compression: Compression) -> Option<GroupId> {
		if !compression.is_enabled() {
			return None;
		}

		if self.groups.is_empty() {
			self.groups.insert(FALLBACK_GROUP, CompressionGroup::new(self.window_bits));
		}

		if let Some((&id, _)) = self.groups.iter().find(|(_, group)| group.is_new()) {
			return Some(id);
		}

		let id = self.groups.keys().next_back().map_or(FALLBACK_GROUP, |id| id + 1);
		self.groups.insert(id, CompressionGroup::new(self.window_bits));
		Some(id)
	}

	/// Register a subscriber, replaying the last payload to it alone.
	pub fn new_subscriber(&mut self, endpoint: Endpoint, compression: Compression) -> Result<SubscriberId> {
		let group = self.assign_group(compression);

		let id = self.next_id;
		self.next_id += 1;

		if let Some(group) = group.and_then(|id| self.groups.get_mut(&id)) {
			group.add_member();
		}

		self.subscribers.push(Subscriber {
			id,
			endpoint: endpoint.clone(),
			group,
		});

		tracing::debug!(topic = %self.name, subscriber = id, ?group, "subscriber added");

		if let Some(last) = self.last.clone() {
			let data = match group.and_then(|id| self.groups.get_mut(&id)) {
				Some(group) => match group.compress(&last) {
					Ok(data) => data,
					Err(err) => {
						self.delete_subscriber(id);
						return Err(err);
					}
				},
				None => last,
			};

			endpoint.deliver(Inbound::Publish(data));
		}

		Ok(id)
	}

	/// Unregister a subscriber, dropping its group once empty.
	///
	/// Returns false if the subscriber was not registered, which is not an error.
	pub fn delete_subscriber(&mut self, id: SubscriberId) -> bool {
		let Some(index) = self.subscribers.iter().position(|s| s.id == id) else {
			tracing::debug!(topic = %self.name, subscriber = id, "subscriber already removed");
			return false;
		};

		let subscriber = self.subscribers.remove(index);
		if let Some(group) = subscriber.group {
			self.leave(group);
		}

		tracing::debug!(topic = %self.name, subscriber = id, "subscriber removed");
		true
	}

	/// Move a subscriber from its group into the fallback group.
	pub fn merge_to_fallback_group(&mut self, id: SubscriberId) {
		let Some(subscriber) = self.subscribers.iter_mut().find(|s| s.id == id) else {
			return;
		};

		let old = match subscriber.group {
			Some(old) if old != FALLBACK_GROUP => old,
			_ => return,
		};

		subscriber.group = Some(FALLBACK_GROUP);
		self.leave(old);

		let window_bits = self.window_bits;
		self.groups
			.entry(FALLBACK_GROUP)
			.or_insert_with(|| CompressionGroup::new(window_bits))
			.add_member();

		tracing::info!(topic = %self.name, subscriber = id, from = old, "merged into fallback group");
	}

	/// Publish a payload to every subscriber.
	///
	/// Every group compresses the payload exactly once, then each subscriber receives its group's unit,
	/// or the raw payload when uncompressed. Subscribers of a mergeable group are moved afterwards,
	/// so they receive their old group's unit for this payload and the fallback group's from the next.
	pub fn copy(&mut self, payload: Bytes) -> Result<()> {
		self.last = Some(payload.clone());

		for group in self.groups.values_mut() {
			group.compress(&payload)?;
		}

		let mut merge = Vec::new();
		let mut gone = Vec::new();

		for subscriber in &self.subscribers {
			let group = subscriber.group.and_then(|id| self.groups.get(&id).map(|group| (id, group)));

			let data = match group {
				Some((_, group)) => group.output().clone(),
				None => payload.clone(),
			};

			if !subscriber.endpoint.deliver(Inbound::Publish(data)) {
				gone.push(subscriber.id);
				continue;
			}

			match group {
				Some((id, group)) if id != FALLBACK_GROUP && group.is_mergeable() => merge.push(subscriber.id),
				_ => {}
			}
		}

		for id in merge {
			self.merge_to_fallback_group(id);
		}

		for id in gone {
			tracing::debug!(topic = %self.name, subscriber = id, "pruning closed subscriber");
			self.delete_subscriber(id);
		}

		Ok(())
	}

	fn leave(&mut self, id: GroupId) {
		if let Some(group) = self.groups.get_mut(&id) {
			group.remove_member();
			if group.is_empty() {
				self.groups.remove(&id);
			}
		}
	}
}
