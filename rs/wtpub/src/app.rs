use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::{Inbound, Outbound, Request, Result, Session, SessionReceiver};

/// Everything an application needs to drive one session.
pub struct Context {
	/// The CONNECT request: the one received on the server, the one sent on the client.
	pub request: Request,
	pub session: Session,
	pub receiver: SessionReceiver,
}

/// The logic run for each session.
///
/// The session is closed once the returned future completes, whether it succeeded or not.
pub trait Application: Send + Sync + 'static {
	fn run(&self, context: Context) -> BoxFuture<'static, Result<()>>;
}

/// Produces the payloads a publisher sends.
pub trait PayloadSource: Send + 'static {
	/// The next payload, or `None` once exhausted.
	fn next(&mut self) -> BoxFuture<'_, Result<Option<Bytes>>>;
}

/// Creates a fresh [PayloadSource] for every publisher session.
pub type SourceFactory = Arc<dyn Fn() -> Box<dyn PayloadSource> + Send + Sync>;

/// Endless fixed-format payloads: `PUBLISHER_FIXED_DATA_<counter>_<id>`.
///
/// The id starts at a random value, so concurrent publishers are distinguishable.
pub struct FixedPayloads {
	counter: u64,
	id: u64,
}

impl FixedPayloads {
	pub fn new() -> Self {
		Self::starting_at(rand::random_range(0..1_000_000_000))
	}

	pub fn starting_at(id: u64) -> Self {
		Self { counter: 0, id }
	}
}

impl Default for FixedPayloads {
	fn default() -> Self {
		Self::new()
	}
}

impl PayloadSource for FixedPayloads {
	fn next(&mut self) -> BoxFuture<'_, Result<Option<Bytes>>> {
		let payload = format!("PUBLISHER_FIXED_DATA_{:06}_{:010}", self.counter, self.id);
		self.counter += 1;
		self.id += 1;
		Box::pin(async move { Ok(Some(Bytes::from(payload))) })
	}
}

/// FNV-1a (32 bit) of a payload, logged on both ends to match publishes with receipts.
pub fn fingerprint(data: &[u8]) -> u32 {
	data.iter()
		.fold(0x811c_9dc5, |hash: u32, byte| (hash ^ *byte as u32).wrapping_mul(0x0100_0193))
}

/// Sends one payload per interval until the session closes or the source runs dry.
pub struct Publisher {
	source: SourceFactory,
	interval: Duration,
}

impl Publisher {
	pub fn new(source: SourceFactory, interval: Duration) -> Self {
		Self { source, interval }
	}
}

impl Application for Publisher {
	fn run(&self, context: Context) -> BoxFuture<'static, Result<()>> {
		let mut source = (self.source)();
		let interval = self.interval;

		Box::pin(async move {
			let Context { request, session, .. } = context;
			let topic = request.topic().unwrap_or_default().to_string();

			let mut ticker = tokio::time::interval(interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

			loop {
				tokio::select! {
					_ = ticker.tick() => {},
					_ = session.closed() => break,
				}

				let Some(payload) = source.next().await? else {
					tracing::info!(%topic, "payload source exhausted");
					break;
				};

				let hash = fingerprint(&payload);
				let size = payload.len();

				session.send(Outbound::Stream(payload))?;
				tracing::info!(%topic, hash = %format_args!("{hash:08x}"), size, "published");
			}

			Ok(())
		})
	}
}

/// Logs every payload received until the session ends.
pub struct Subscriber;

impl Application for Subscriber {
	fn run(&self, context: Context) -> BoxFuture<'static, Result<()>> {
		Box::pin(async move {
			let Context {
				request, mut receiver, ..
			} = context;
			let topic = request.topic().unwrap_or_default().to_string();

			loop {
				let message = receiver.recv().await;
				if let Inbound::End = message {
					break;
				}

				if let Some(payload) = message.payload() {
					let hash = fingerprint(payload);
					tracing::info!(%topic, hash = %format_args!("{hash:08x}"), size = payload.len(), "received");
				}
			}

			tracing::info!(%topic, "subscription ended");
			Ok(())
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn fixed_payloads() {
		let mut source = FixedPayloads::starting_at(41);
		assert_eq!(
			source.next().await.unwrap(),
			Some(Bytes::from_static(b"PUBLISHER_FIXED_DATA_000000_0000000041"))
		);
		assert_eq!(
			source.next().await.unwrap(),
			Some(Bytes::from_static(b"PUBLISHER_FIXED_DATA_000001_0000000042"))
		);
	}

	#[test]
	fn fnv1a() {
		assert_eq!(fingerprint(b""), 0x811c9dc5);
		assert_eq!(fingerprint(b"a"), 0xe40c292c);
		assert_eq!(fingerprint(b"foobar"), 0xbf9cf968);
	}
}
