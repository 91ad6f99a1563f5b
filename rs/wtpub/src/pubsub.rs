use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::{
	Authorizer, Compression, Endpoint, Error, Principal, Result, SubscriberId, Topic, WindowBits,
};

/// The broker's publish/subscribe core.
///
/// Topics are fixed at construction. Each topic sits behind its own mutex, so a fan-out runs as
/// one critical section and never interleaves with another publish or a subscriber change on that topic.
#[derive(Clone)]
pub struct PubSub {
	topics: Arc<HashMap<String, Arc<Mutex<Topic>>>>,
	auth: Arc<dyn Authorizer>,
	window_bits: WindowBits,
}

impl PubSub {
	/// Create the core, registering every topic the authorizer knows about.
	pub fn new(auth: Arc<dyn Authorizer>, window_bits: WindowBits) -> Self {
		let topics = auth
			.list_topics()
			.into_iter()
			.map(|name| {
				let topic = Topic::new(name.clone(), window_bits);
				(name, Arc::new(Mutex::new(topic)))
			})
			.collect::<HashMap<_, _>>();

		tracing::info!(topics = topics.len(), window_bits = window_bits.get(), "pubsub ready");

		Self {
			topics: Arc::new(topics),
			auth,
			window_bits,
		}
	}

	/// The deflate window used by every compression group.
	pub fn window_bits(&self) -> WindowBits {
		self.window_bits
	}

	pub fn can_publish(&self, principal: &Principal, topic: &str) -> bool {
		self.has_topic(topic) && self.auth.can_publish(principal, topic)
	}

	pub fn can_subscribe(&self, principal: &Principal, topic: &str) -> bool {
		self.has_topic(topic) && self.auth.can_subscribe(principal, topic)
	}

	pub fn has_topic(&self, topic: &str) -> bool {
		self.topics.contains_key(topic)
	}

	pub fn topics(&self) -> impl Iterator<Item = &str> {
		self.topics.keys().map(String::as_str)
	}

	fn topic(&self, name: &str) -> Result<&Arc<Mutex<Topic>>> {
		self.topics.get(name).ok_or_else(|| Error::UnknownTopic(name.to_string()))
	}

	/// Run a closure against a topic while holding its lock.
	pub fn with_topic<T>(&self, name: &str, f: impl FnOnce(&mut Topic) -> T) -> Result<T> {
		let topic = self.topic(name)?;
		let mut topic = topic.lock();
		Ok(f(&mut topic))
	}

	pub fn new_subscriber(&self, topic: &str, endpoint: Endpoint, compression: Compression) -> Result<SubscriberId> {
		self.with_topic(topic, |topic| topic.new_subscriber(endpoint, compression))?
	}

	/// Returns false when the topic or subscriber is unknown.
	pub fn delete_subscriber(&self, topic: &str, id: SubscriberId) -> bool {
		self.with_topic(topic, |topic| topic.delete_subscriber(id)).unwrap_or(false)
	}

	pub fn merge_to_fallback_group(&self, topic: &str, id: SubscriberId) -> Result<()> {
		self.with_topic(topic, |topic| topic.merge_to_fallback_group(id))
	}

	/// Fan a payload out to every subscriber of the topic.
	pub fn copy(&self, topic: &str, payload: Bytes) -> Result<()> {
		self.with_topic(topic, |topic| topic.copy(payload))?
	}

	/// Register a subscriber that is removed again when the returned guard is dropped.
	pub fn subscribe(&self, topic: &str, endpoint: Endpoint, compression: Compression) -> Result<Subscription> {
		let handle = self.topic(topic)?.clone();
		let id = handle.lock().new_subscriber(endpoint, compression)?;
		Ok(Subscription { topic: handle, id })
	}
}

/// A registered subscriber, removed from its topic on drop.
pub struct Subscription {
	topic: Arc<Mutex<Topic>>,
	id: SubscriberId,
}

impl Subscription {
	pub fn id(&self) -> SubscriberId {
		self.id
	}
}

impl Drop for Subscription {
	fn drop(&mut self) {
		self.topic.lock().delete_subscriber(self.id);
	}
}
