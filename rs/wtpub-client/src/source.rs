use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use futures::future::BoxFuture;
use url::Url;
use wtpub::{FixedPayloads, PayloadSource, SourceFactory};

/// Where publishers get their payloads: `fixed` or `json:<url>[#<key>]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataSource {
	Fixed,
	Json(JsonSource),
}

/// A JSON array over HTTP, optionally nested under a top-level key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JsonSource {
	pub url: Url,

	/// Select the array at `body[key]` instead of the body itself.
	pub key: Option<String>,
}

impl FromStr for DataSource {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.split_once(':') {
			None if s == "fixed" => Ok(Self::Fixed),
			Some(("json", url)) => {
				let mut url = Url::parse(url).context("invalid JSON source URL")?;

				// The fragment is never sent over HTTP, so it names the key instead.
				let key = url.fragment().filter(|key| !key.is_empty()).map(str::to_string);
				url.set_fragment(None);

				Ok(Self::Json(JsonSource { url, key }))
			}
			_ => anyhow::bail!("unknown data source: {s}, expected fixed or json:<url>[#<key>]"),
		}
	}
}

impl DataSource {
	/// A factory producing one independent source per publisher session.
	pub fn factory(&self) -> SourceFactory {
		match self {
			Self::Fixed => Arc::new(|| Box::new(FixedPayloads::new()) as Box<dyn PayloadSource>),
			Self::Json(source) => {
				let http = reqwest::Client::new();
				let source = source.clone();
				Arc::new(move || Box::new(JsonPayloads::new(http.clone(), source.clone())) as Box<dyn PayloadSource>)
			}
		}
	}
}

/// Payloads fetched over HTTP as a JSON array, one compact element per payload.
///
/// Every object is stamped with a `generator_id`, counting up from a random start.
/// The array is fetched again once every element was sent. An empty array exhausts the source.
pub struct JsonPayloads {
	http: reqwest::Client,
	source: JsonSource,
	generator_id: u64,
	pending: VecDeque<Bytes>,
}

impl JsonPayloads {
	pub fn new(http: reqwest::Client, source: JsonSource) -> Self {
		Self::with_generator_id(http, source, rand::random_range(0..1_000_000_000))
	}

	pub fn with_generator_id(http: reqwest::Client, source: JsonSource, generator_id: u64) -> Self {
		Self {
			http,
			source,
			generator_id,
			pending: VecDeque::new(),
		}
	}

	async fn fetch(&mut self) -> anyhow::Result<VecDeque<Bytes>> {
		let body = self
			.http
			.get(self.source.url.clone())
			.send()
			.await?
			.error_for_status()?
			.bytes()
			.await?;

		tracing::debug!(url = %self.source.url, size = body.len(), "fetched payloads");
		split_array(&body, self.source.key.as_deref(), &mut self.generator_id)
	}
}

impl PayloadSource for JsonPayloads {
	fn next(&mut self) -> BoxFuture<'_, wtpub::Result<Option<Bytes>>> {
		Box::pin(async move {
			if self.pending.is_empty() {
				self.pending = self
					.fetch()
					.await
					.map_err(|err| wtpub::Error::Source(format!("{err:#}")))?;
			}

			Ok(self.pending.pop_front())
		})
	}
}

/// Split the selected array into compact payloads, stamping objects with consecutive generator ids.
fn split_array(body: &[u8], key: Option<&str>, generator_id: &mut u64) -> anyhow::Result<VecDeque<Bytes>> {
	let mut body: serde_json::Value = serde_json::from_slice(body).context("invalid JSON")?;

	let items = match key {
		Some(key) => body.get_mut(key).with_context(|| format!("missing key: {key}"))?,
		None => &mut body,
	};

	let items = items.as_array_mut().context("expected a JSON array")?;

	items
		.iter_mut()
		.map(|item| {
			if let Some(object) = item.as_object_mut() {
				object.insert("generator_id".to_string(), (*generator_id).into());
				*generator_id += 1;
			}

			Ok(Bytes::from(serde_json::to_vec(item)?))
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn json(url: &str, key: Option<&str>) -> DataSource {
		DataSource::Json(JsonSource {
			url: Url::parse(url).unwrap(),
			key: key.map(str::to_string),
		})
	}

	#[test]
	fn parse() {
		assert_eq!("fixed".parse::<DataSource>().unwrap(), DataSource::Fixed);
		assert_eq!(
			"json:http://localhost:8080/items".parse::<DataSource>().unwrap(),
			json("http://localhost:8080/items", None)
		);
		assert_eq!(
			"json:https://fakerapi.it/api/v1/books?_quantity=100#data"
				.parse::<DataSource>()
				.unwrap(),
			json("https://fakerapi.it/api/v1/books?_quantity=100", Some("data"))
		);
		assert_eq!(
			"json:http://localhost/items#".parse::<DataSource>().unwrap(),
			json("http://localhost/items", None)
		);
		assert!("json:nope".parse::<DataSource>().is_err());
		assert!("random".parse::<DataSource>().is_err());
	}

	#[test]
	fn stamped_objects() {
		let body = br#"[ {"a": 1}, {"b": [1, 2, 3]}, "text" ]"#;
		let mut generator_id = 41;
		let payloads = split_array(body, None, &mut generator_id).unwrap();

		assert_eq!(
			payloads,
			VecDeque::from([
				Bytes::from_static(br#"{"a":1,"generator_id":41}"#),
				Bytes::from_static(br#"{"b":[1,2,3],"generator_id":42}"#),
				Bytes::from_static(br#""text""#),
			])
		);
		assert_eq!(generator_id, 43);
	}

	#[test]
	fn nested_array() {
		let body = br#"{"status": "OK", "data": [{"title": "one"}, {"title": "two"}]}"#;
		let mut generator_id = 0;
		let payloads = split_array(body, Some("data"), &mut generator_id).unwrap();

		assert_eq!(
			payloads,
			VecDeque::from([
				Bytes::from_static(br#"{"generator_id":0,"title":"one"}"#),
				Bytes::from_static(br#"{"generator_id":1,"title":"two"}"#),
			])
		);

		assert!(split_array(body, Some("results"), &mut generator_id).is_err());
		assert!(split_array(body, Some("status"), &mut generator_id).is_err());
	}

	#[test]
	fn not_an_array() {
		let mut generator_id = 0;
		assert!(split_array(br#"{"a": 1}"#, None, &mut generator_id).is_err());
		assert!(split_array(b"", None, &mut generator_id).is_err());
		assert!(split_array(b"[]", None, &mut generator_id).unwrap().is_empty());
		assert_eq!(generator_id, 0);
	}

	#[tokio::test]
	async fn fixed_factory() {
		let factory = DataSource::Fixed.factory();
		let mut source = factory();
		let payload = source.next().await.unwrap().unwrap();
		assert!(payload.starts_with(b"PUBLISHER_FIXED_DATA_000000_"));
	}
}
