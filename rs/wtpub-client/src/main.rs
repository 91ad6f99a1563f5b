mod service;
mod source;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::Instrument;
use url::Url;
use wtpub::{Application, Principal, Publisher, Role, Subscriber, WindowBits};

use crate::service::{TopicArg, session_url};
use crate::source::DataSource;

#[derive(Parser, Clone)]
#[command(version, about = "Publish to and subscribe from a WebTransport broker")]
pub struct Config {
	/// Connect to the given URL starting with https://
	#[arg(long, env = "WTPUB_URL")]
	pub url: Url,

	/// Publish to a topic; append `:zlib` for a compressed session. May be repeated.
	#[arg(long = "pub", value_name = "TOPIC[:zlib]")]
	pub publish: Vec<TopicArg>,

	/// Subscribe to a topic; append `:zlib` for a compressed session. May be repeated.
	#[arg(long = "sub", value_name = "TOPIC[:zlib]")]
	pub subscribe: Vec<TopicArg>,

	/// The user to authenticate as.
	#[arg(long, env = "WTPUB_USER")]
	pub user: Option<String>,

	#[arg(long, env = "WTPUB_PASSWORD", hide_env_values = true)]
	pub password: Option<String>,

	/// How often each publisher sends a payload.
	#[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
	pub interval: Duration,

	/// Where published payloads come from: `fixed`, or `json:<url>` with an optional `#<key>` naming a nested array.
	#[arg(long, default_value = "fixed")]
	pub data: DataSource,

	/// The deflate window for compressed sessions, between 9 and 15.
	#[arg(long = "window-bits", default_value_t = 15)]
	pub window_bits: u8,

	/// The QUIC client configuration.
	#[command(flatten)]
	pub client: wtpub_native::ClientConfig,

	/// The log configuration.
	#[command(flatten)]
	pub log: wtpub_native::Log,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let config = Config::parse();
	config.log.init();

	anyhow::ensure!(
		!config.publish.is_empty() || !config.subscribe.is_empty(),
		"nothing to do, pass at least one --pub or --sub"
	);

	let client = config
		.client
		.init()?
		.with_window_bits(WindowBits::new(config.window_bits)?);

	let credentials = Principal {
		user: config.user.clone(),
		password: config.password.clone(),
	};

	let publisher: Arc<dyn Application> = Arc::new(Publisher::new(config.data.factory(), config.interval));
	let subscriber: Arc<dyn Application> = Arc::new(Subscriber);

	let services = config
		.publish
		.iter()
		.map(|topic| (topic, Role::Publisher, publisher.clone()))
		.chain(config.subscribe.iter().map(|topic| (topic, Role::Subscriber, subscriber.clone())));

	// Every service shares one shutdown signal, raised on ctrl-c.
	let (shutdown, _) = watch::channel(false);
	let mut tasks = JoinSet::new();

	for (topic, role, app) in services {
		let url = session_url(&config.url, topic, role, &credentials)?;
		let client = client.clone();
		let mut stop = shutdown.subscribe();

		let span = tracing::info_span!("service", %topic, %role);
		tasks.spawn(
			async move {
				let stopped = async move {
					let _ = stop.wait_for(|stop| *stop).await;
				};
				client.run(url, app, stopped).await
			}
			.instrument(span),
		);
	}

	let mut stopping = false;

	loop {
		tokio::select! {
			res = tasks.join_next() => match res {
				Some(Ok(Ok(()))) => {}
				Some(Ok(Err(err))) => tracing::warn!(err = %format!("{err:#}"), "service failed"),
				Some(Err(err)) => tracing::error!(%err, "service panicked"),
				None => break,
			},
			_ = tokio::signal::ctrl_c(), if !stopping => {
				tracing::info!("shutting down");
				stopping = true;
				shutdown.send_replace(true);
			}
		}
	}

	tracing::info!("all services closed");
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::source::JsonSource;
	use wtpub::Compression;

	#[test]
	fn services() {
		let config = Config::parse_from([
			"wtpub-client",
			"--url",
			"https://localhost:4433/",
			"--pub",
			"news",
			"--sub",
			"news:zlib",
			"--sub",
			"weather",
			"--user",
			"alice",
			"--interval",
			"250ms",
		]);

		assert_eq!(config.publish.len(), 1);
		assert_eq!(config.subscribe.len(), 2);
		assert_eq!(config.subscribe[0].compression, Compression::Zlib);
		assert_eq!(config.user.as_deref(), Some("alice"));
		assert_eq!(config.interval, Duration::from_millis(250));
		assert_eq!(config.data, DataSource::Fixed);
		assert_eq!(config.window_bits, 15);
	}

	#[test]
	fn json_data() {
		let config = Config::parse_from([
			"wtpub-client",
			"--url",
			"https://localhost:4433/",
			"--pub",
			"news",
			"--data",
			"json:http://localhost:8080/items.json#results",
		]);

		assert_eq!(
			config.data,
			DataSource::Json(JsonSource {
				url: Url::parse("http://localhost:8080/items.json").unwrap(),
				key: Some("results".into()),
			})
		);
	}

	#[test]
	fn invalid_topic() {
		assert!(Config::try_parse_from(["wtpub-client", "--url", "https://localhost/", "--pub", ":zlib"]).is_err());
	}
}
