use futures::future::BoxFuture;

use crate::{Application, Context, Error, Inbound, Outbound, PubSub, Result, Role};

/// The broker side of every session: publishers feed a topic, subscribers drain it.
///
/// The role is picked by the `client` query parameter and the topic by `topic`.
#[derive(Clone)]
pub struct Broker {
	pubsub: PubSub,
}

impl Broker {
	pub fn new(pubsub: PubSub) -> Self {
		Self { pubsub }
	}

	pub fn pubsub(&self) -> &PubSub {
		&self.pubsub
	}
}

impl Application for Broker {
	fn run(&self, context: Context) -> BoxFuture<'static, Result<()>> {
		let pubsub = self.pubsub.clone();
		Box::pin(async move { serve(pubsub, context).await })
	}
}

async fn serve(pubsub: PubSub, mut context: Context) -> Result<()> {
	match context.receiver.recv().await {
		Inbound::Connect => {}
		Inbound::End => return Ok(()),
		message => return Err(Error::UnexpectedMessage(message.name())),
	}

	let topic = context
		.request
		.topic()
		.ok_or(Error::MissingParameter("topic"))?
		.to_string();

	match context.request.role().ok_or(Error::MissingParameter("client"))? {
		Role::Publisher => publisher(pubsub, topic, context).await,
		Role::Subscriber => subscriber(pubsub, topic, context).await,
	}
}

async fn publisher(pubsub: PubSub, topic: String, context: Context) -> Result<()> {
	let Context {
		request,
		session,
		mut receiver,
	} = context;

	if !pubsub.can_publish(&request.principal, &topic) {
		tracing::info!(%topic, user = ?request.principal.user, "publish refused");
		return session.send(Outbound::Refuse);
	}

	if request.compression().is_enabled() {
		receiver.decompress(pubsub.window_bits());
	}

	session.send(Outbound::Accept)?;
	tracing::info!(%topic, user = ?request.principal.user, compression = ?request.compression(), "publisher connected");

	loop {
		match receiver.recv().await {
			Inbound::Stream { data, .. } | Inbound::Datagram(data) => pubsub.copy(&topic, data)?,
			Inbound::End => break,
			message => tracing::debug!(message = message.name(), "ignoring"),
		}
	}

	tracing::info!(%topic, "publisher disconnected");
	Ok(())
}

async fn subscriber(pubsub: PubSub, topic: String, context: Context) -> Result<()> {
	let Context {
		request,
		session,
		mut receiver,
	} = context;

	if !pubsub.can_subscribe(&request.principal, &topic) {
		tracing::info!(%topic, user = ?request.principal.user, "subscribe refused");
		return session.send(Outbound::Refuse);
	}

	session.send(Outbound::Accept)?;

	let compression = request.compression();
	let subscription = pubsub.subscribe(&topic, session.endpoint(), compression)?;
	tracing::info!(%topic, id = subscription.id(), user = ?request.principal.user, ?compression, "subscriber connected");

	loop {
		match receiver.recv().await {
			// Group output shares one deflate stream, so it must stay on a single stream.
			Inbound::Publish(data) if compression.is_enabled() => session.send(Outbound::PersistentStream(data))?,
			Inbound::Publish(data) => session.send(Outbound::Stream(data))?,
			Inbound::End => break,
			message => tracing::debug!(message = message.name(), "ignoring"),
		}
	}

	tracing::info!(%topic, id = subscription.id(), "subscriber disconnected");
	Ok(())
}
