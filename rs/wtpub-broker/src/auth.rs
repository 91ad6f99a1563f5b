use std::path::Path;
use std::str::FromStr;

use wtpub::{Authorizer, Principal};

/// Matches every topic in a grant.
const ANY_TOPIC: &str = "*";

#[derive(thiserror::Error, Debug)]
pub enum PermissionsError {
	#[error("failed to read permissions: {0}")]
	Io(#[from] std::io::Error),

	#[error("invalid permissions: {0}")]
	Parse(#[from] toml::de::Error),

	#[error("{owner} is granted unknown topic: {topic}")]
	UnknownTopic { owner: String, topic: String },

	#[error("duplicate client: {0}")]
	DuplicateClient(String),
}

/// Topics anonymous clients may publish or subscribe to.
#[derive(Clone, Debug, Default, serde::Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Grant {
	pub publish: Vec<String>,
	pub subscribe: Vec<String>,
}

fn allows(list: &[String], topic: &str) -> bool {
	list.iter().any(|allowed| allowed == ANY_TOPIC || allowed == topic)
}

/// A known client, identified by the credentials in its CONNECT authority.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientEntry {
	pub user: String,

	/// When unset, any password (or none) is accepted.
	#[serde(default)]
	pub password: Option<String>,

	#[serde(default)]
	pub publish: Vec<String>,

	#[serde(default)]
	pub subscribe: Vec<String>,
}

/// The permission file:
///
/// ```toml
/// topics = ["news", "weather"]
///
/// [[client]]
/// user = "alice"
/// password = "secret"
/// publish = ["news"]
/// subscribe = ["*"]
///
/// [anonymous]
/// subscribe = ["weather"]
/// ```
#[derive(Clone, Debug, Default, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Permissions {
	#[serde(default)]
	pub topics: Vec<String>,

	#[serde(default, rename = "client")]
	pub clients: Vec<ClientEntry>,

	/// What clients without credentials may do. Nothing when unset.
	#[serde(default)]
	pub anonymous: Option<Grant>,
}

impl Permissions {
	pub fn load(path: &Path) -> Result<Self, PermissionsError> {
		let contents = std::fs::read_to_string(path)?;
		contents.parse()
	}

	fn validate(&self) -> Result<(), PermissionsError> {
		let mut users = std::collections::HashSet::new();

		for client in &self.clients {
			if !users.insert(client.user.as_str()) {
				return Err(PermissionsError::DuplicateClient(client.user.clone()));
			}
			self.check_topics(&client.user, &client.publish, &client.subscribe)?;
		}

		if let Some(anonymous) = &self.anonymous {
			self.check_topics("anonymous", &anonymous.publish, &anonymous.subscribe)?;
		}

		Ok(())
	}

	fn check_topics(&self, owner: &str, publish: &[String], subscribe: &[String]) -> Result<(), PermissionsError> {
		let mut granted = publish.iter().chain(subscribe.iter());
		match granted.find(|topic| *topic != ANY_TOPIC && !self.topics.contains(topic)) {
			Some(topic) => Err(PermissionsError::UnknownTopic {
				owner: owner.to_string(),
				topic: topic.clone(),
			}),
			None => Ok(()),
		}
	}

	// The publish and subscribe lists for a principal, if its credentials check out.
	fn grant(&self, principal: &Principal) -> Option<(&[String], &[String])> {
		let Some(user) = &principal.user else {
			return self
				.anonymous
				.as_ref()
				.map(|grant| (grant.publish.as_slice(), grant.subscribe.as_slice()));
		};

		let client = self.clients.iter().find(|client| &client.user == user)?;
		match &client.password {
			Some(password) if principal.password.as_ref() != Some(password) => None,
			_ => Some((client.publish.as_slice(), client.subscribe.as_slice())),
		}
	}
}

impl FromStr for Permissions {
	type Err = PermissionsError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let permissions: Self = toml::from_str(s)?;
		permissions.validate()?;
		Ok(permissions)
	}
}

impl Authorizer for Permissions {
	fn can_publish(&self, principal: &Principal, topic: &str) -> bool {
		self.grant(principal)
			.is_some_and(|(publish, _)| allows(publish, topic))
	}

	fn can_subscribe(&self, principal: &Principal, topic: &str) -> bool {
		self.grant(principal)
			.is_some_and(|(_, subscribe)| allows(subscribe, topic))
	}

	fn list_topics(&self) -> Vec<String> {
		self.topics.clone()
	}
}
