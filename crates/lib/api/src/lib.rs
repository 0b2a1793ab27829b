//! Wire types and common primitives for the granary build farm.
//!
//! Everything content-addressed or stored in the backplane is encoded with
//! the canonical prost binary encoding, so two shards always agree on the
//! digest of a message.

pub mod bytestream;
pub mod digest;
pub mod messages;
pub mod resource;
pub mod status;
pub mod validation;

pub use digest::{ActionKey, DigestUtil};
pub use messages::*;
pub use status::{Code, Status};
