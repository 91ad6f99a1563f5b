//! # wtpub: publish/subscribe over WebTransport
//!
//! `wtpub` is a sans-IO session layer for WebTransport plus the broker that runs on top of it.
//! The QUIC/HTTP3 engine is a collaborator: it hands us [Event]s and we drive it through a [Transport].
//!
//! ## Layers
//!
//! - [Connection]: one per QUIC connection, routes every [Event] to the [Session] it belongs to.
//! - [Session]: one per WebTransport session, buffers events until accepted and reassembles streams.
//! - [Application]: the logic run per session, talking to it with [Inbound] and [Outbound] messages.
//! - [PubSub]: the broker core, fanning each published payload out to the subscribers of its [Topic].
//!
//! Subscribers that ask for `compression=zlib` share [CompressionGroup]s,
//! so each payload is deflated once per group instead of once per subscriber.
//! Every compressed unit ends with [SYNC_FLUSH_MARKER] and can be decoded on its own.
//!
//! The `wtpub-native` crate drives all of this over a real QUIC connection.

mod app;
mod auth;
mod broker;
mod compress;
mod connection;
mod error;
mod event;
mod group;
mod message;
mod pubsub;
mod request;
mod session;
mod topic;
mod transport;

pub use app::*;
pub use auth::*;
pub use broker::*;
pub use compress::*;
pub use connection::*;
pub use error::*;
pub use event::*;
pub use group::*;
pub use message::*;
pub use pubsub::*;
pub use request::*;
pub use session::*;
pub use topic::*;
pub use transport::*;
