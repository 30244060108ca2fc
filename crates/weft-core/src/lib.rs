//! weft-core — shared types, wire envelope, and configuration.
//! All other weft crates depend on this one.

pub mod config;
pub mod envelope;
pub mod media;
pub mod peer;

pub use envelope::{Envelope, EnvelopeKind, Recipient, WireError};
pub use media::MediaInfo;
pub use peer::PeerId;
