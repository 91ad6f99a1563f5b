use crate::Principal;

/// Decides which principals may publish or subscribe to which topics.
pub trait Authorizer: Send + Sync + 'static {
	fn can_publish(&self, principal: &Principal, topic: &str) -> bool;

	fn can_subscribe(&self, principal: &Principal, topic: &str) -> bool;

	/// Every topic the broker serves, consulted once at startup.
	fn list_topics(&self) -> Vec<String>;
}
