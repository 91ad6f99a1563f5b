use std::fmt;
use std::str::FromStr;

use url::Url;
use wtpub::{Compression, Principal, Role};

/// A `--pub`/`--sub` value: `topic`, or `topic:zlib` for a compressed session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicArg {
	pub topic: String,
	pub compression: Compression,
}

impl FromStr for TopicArg {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let (topic, compression) = match s.strip_suffix(":zlib") {
			Some(topic) => (topic, Compression::Zlib),
			None => (s, Compression::None),
		};

		anyhow::ensure!(!topic.is_empty(), "empty topic");

		Ok(Self {
			topic: topic.to_string(),
			compression,
		})
	}
}

impl fmt::Display for TopicArg {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.compression.as_param() {
			Some(compression) => write!(f, "{}:{}", self.topic, compression),
			None => f.write_str(&self.topic),
		}
	}
}

/// The session URL for one service: the broker URL plus userinfo and query parameters.
pub fn session_url(base: &Url, topic: &TopicArg, role: Role, credentials: &Principal) -> anyhow::Result<Url> {
	let mut url = base.clone();

	if let Some(user) = &credentials.user {
		url.set_username(user)
			.map_err(|_| anyhow::anyhow!("URL cannot carry credentials: {base}"))?;
	}

	if let Some(password) = &credentials.password {
		url.set_password(Some(password))
			.map_err(|_| anyhow::anyhow!("URL cannot carry credentials: {base}"))?;
	}

	{
		let mut query = url.query_pairs_mut();
		query.append_pair("topic", &topic.topic);
		query.append_pair("client", role.as_str());
		if let Some(compression) = topic.compression.as_param() {
			query.append_pair("compression", compression);
		}
	}

	Ok(url)
}
