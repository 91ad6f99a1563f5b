use std::collections::BTreeMap;
use std::net::SocketAddr;

use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};

use crate::{Compression, Headers, header};

/// The role a client plays within a topic, selected by the `client` query parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
	Publisher,
	Subscriber,
}

impl Role {
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Publisher => "publisher",
			Self::Subscriber => "subscriber",
		}
	}
}

impl std::str::FromStr for Role {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"publisher" | "pub" => Ok(Self::Publisher),
			"subscriber" | "sub" => Ok(Self::Subscriber),
			_ => Err(format!("unknown role: {s}")),
		}
	}
}

impl std::fmt::Display for Role {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Credentials carried inline in the request authority.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Principal {
	pub user: Option<String>,
	pub password: Option<String>,
}

/// The normalized scope of a WebTransport CONNECT request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Request {
	pub method: String,
	pub protocol: Option<String>,
	pub scheme: String,

	/// The authority without credentials.
	pub authority: String,
	pub principal: Principal,

	pub path: String,
	pub query: String,
	pub params: BTreeMap<String, String>,

	/// Every header that is not a pseudo-header.
	pub headers: Headers,

	/// The peer address, when known.
	pub client: Option<SocketAddr>,
}

impl Request {
	/// Create a client CONNECT request for a WebTransport session.
	pub fn connect(authority: impl Into<String>, path: impl Into<String>) -> Self {
		Self {
			method: "CONNECT".into(),
			protocol: Some("webtransport".into()),
			scheme: "https".into(),
			authority: authority.into(),
			principal: Principal::default(),
			path: path.into(),
			query: String::new(),
			params: BTreeMap::new(),
			headers: Vec::new(),
			client: None,
		}
	}

	pub fn with_principal(mut self, principal: Principal) -> Self {
		self.principal = principal;
		self
	}

	/// Add a query parameter, re-encoding the query string.
	pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
		self.params.insert(key.into(), value.into());
		self.query = url::form_urlencoded::Serializer::new(String::new())
			.extend_pairs(self.params.iter())
			.finish();
		self
	}

	/// Parse the request headers of an incoming CONNECT.
	pub fn from_headers(headers: &Headers, client: Option<SocketAddr>) -> Self {
		let raw_authority = header(headers, ":authority").unwrap_or_default();
		let (principal, authority) = parse_authority(raw_authority);

		let target = header(headers, ":path").unwrap_or("/");
		let (path, query) = match target.split_once('?') {
			Some((path, query)) => (path, query),
			None => (target, ""),
		};

		let params = url::form_urlencoded::parse(query.as_bytes()).into_owned().collect();

		Self {
			method: header(headers, ":method").unwrap_or_default().to_string(),
			protocol: header(headers, ":protocol").map(str::to_string),
			scheme: header(headers, ":scheme").unwrap_or("https").to_string(),
			authority: authority.to_string(),
			principal,
			path: path.to_string(),
			query: query.to_string(),
			params,
			headers: headers.iter().filter(|(name, _)| !name.starts_with(':')).cloned().collect(),
			client,
		}
	}

	/// Serialize as the header block of an outgoing CONNECT.
	pub fn to_headers(&self) -> Headers {
		let encode = |s: &str| utf8_percent_encode(s, USERINFO).to_string();
		let authority = match (&self.principal.user, &self.principal.password) {
			(Some(user), Some(password)) => format!("{}:{}@{}", encode(user), encode(password), self.authority),
			(Some(user), None) => format!("{}@{}", encode(user), self.authority),
			_ => self.authority.clone(),
		};

		let path = match self.query.is_empty() {
			true => self.path.clone(),
			false => format!("{}?{}", self.path, self.query),
		};

		let mut headers = vec![
			(":method".to_string(), self.method.clone()),
			(":scheme".to_string(), self.scheme.clone()),
			(":authority".to_string(), authority),
			(":path".to_string(), path),
		];

		if let Some(protocol) = &self.protocol {
			headers.push((":protocol".to_string(), protocol.clone()));
		}

		headers.extend(self.headers.iter().cloned());
		headers
	}

	/// A CONNECT with the `webtransport` protocol.
	pub fn is_webtransport(&self) -> bool {
		self.method == "CONNECT" && self.protocol.as_deref() == Some("webtransport")
	}

	pub fn param(&self, key: &str) -> Option<&str> {
		self.params.get(key).map(String::as_str)
	}

	pub fn topic(&self) -> Option<&str> {
		self.param("topic")
	}

	pub fn role(&self) -> Option<Role> {
		self.param("client")?.parse().ok()
	}

	pub fn compression(&self) -> Compression {
		Compression::from_param(self.param("compression"))
	}
}

/// Characters escaped in the userinfo of an outgoing authority: the URL userinfo set plus `%`.
const USERINFO: &AsciiSet = &CONTROLS
	.add(b' ')
	.add(b'"')
	.add(b'#')
	.add(b'%')
	.add(b'/')
	.add(b':')
	.add(b';')
	.add(b'<')
	.add(b'=')
	.add(b'>')
	.add(b'?')
	.add(b'@')
	.add(b'[')
	.add(b'\\')
	.add(b']')
	.add(b'^')
	.add(b'`')
	.add(b'{')
	.add(b'|')
	.add(b'}');

/// Split `user:password@host` into percent-decoded credentials and the bare host.
fn parse_authority(authority: &str) -> (Principal, &str) {
	let Some((credentials, host)) = authority.rsplit_once('@') else {
		return (Principal::default(), authority);
	};

	let decode = |s: &str| percent_decode_str(s).decode_utf8_lossy().into_owned();
	let principal = match credentials.split_once(':') {
		Some((user, password)) => Principal {
			user: Some(decode(user)),
			password: Some(decode(password)),
		},
		None => Principal {
			user: Some(decode(credentials)),
			password: None,
		},
	};

	(principal, host)
}
