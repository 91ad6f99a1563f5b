mod auth;
mod config;

use std::sync::Arc;

use anyhow::Context;
use tracing::Instrument;
use wtpub::{Application, Broker, ConnectionConfig, PubSub, WindowBits};

use crate::auth::Permissions;
use crate::config::{BrokerConfig, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let config = Config::load()?;
	config.log.init();

	let permissions = match &config.broker.permissions {
		Some(path) => {
			Permissions::load(path).with_context(|| format!("failed to load permissions from {}", path.display()))?
		}
		None => {
			tracing::warn!("no permission file; every session will be refused");
			Permissions::default()
		}
	};

	tracing::info!(topics = ?permissions.topics, clients = permissions.clients.len(), "loaded permissions");

	let window_bits = WindowBits::new(
		config
			.broker
			.window_bits
			.unwrap_or(BrokerConfig::DEFAULT_WINDOW_BITS),
	)?;

	let pubsub = PubSub::new(Arc::new(permissions), window_bits);
	let app: Arc<dyn Application> = Arc::new(Broker::new(pubsub));

	let connection = ConnectionConfig {
		keepalive: None,
		finish_timeout: config
			.broker
			.finish_timeout
			.unwrap_or(BrokerConfig::DEFAULT_FINISH_TIMEOUT),
		window_bits,
	};

	let mut server = config.server.init()?;
	tracing::info!(addr = %server.local_addr()?, "broker ready");

	let mut conn_id = 0u64;

	while let Some(incoming) = server.accept().await {
		let span = tracing::info_span!("conn", id = conn_id, peer = %incoming.peer());
		conn_id += 1;

		let app = app.clone();
		let connection = connection.clone();

		tokio::spawn(
			async move {
				tracing::debug!(url = %wtpub_native::redact(incoming.url()), "serving");
				if let Err(err) = incoming.serve(app, connection).await {
					tracing::warn!(%err, "connection failed");
				}
			}
			.instrument(span),
		);
	}

	tracing::info!("broker stopped");
	Ok(())
}
