//! weft-mesh — peer-to-peer overlay over data-channel transports.
//!
//! A [`router::Node`] maintains negotiated connections to its neighbors,
//! routes [`weft_core::Envelope`]s (direct when it can, flooding when it
//! must), and hands every locally-delivered envelope to the typed
//! [`bus::MessageBus`]. The [`swarm::SwarmCoordinator`] sits on top and
//! moves chunked files across the mesh, falling back to the origin server
//! when no neighbor offers anything in time.
//!
//! Session negotiation, chunk storage, origin fetching, and the rendezvous
//! channel are consumed through traits; `testing` provides deterministic
//! in-memory backends for all of them.

pub mod bus;
pub mod channel;
pub mod connection;
mod negotiate;
pub mod rendezvous;
pub mod router;
pub mod session;
pub mod store;
pub mod swarm;
pub mod testing;

pub use bus::{HandlerId, MessageBus};
pub use channel::{ChannelEvent, DataChannel};
pub use connection::{Connection, ConnectionStatus};
pub use rendezvous::Rendezvous;
pub use router::{Node, Reply};
pub use session::{PeerSession, SessionEvent, SessionFactory};
pub use store::MediaStore;
pub use swarm::{MediaSink, OriginFetcher, SwarmCoordinator};
