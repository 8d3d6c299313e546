//! Relay (peer) side of the tunnel
//!
//! The relay owns its own tunnel interface. Packets the client sends as
//! uplink frames are written to that interface; packets read from it are
//! batched into blobs, stored in a fixed ring of slots, and announced to the
//! client as index frames.

mod batcher;
mod server;

pub use batcher::{BatchLimits, PacketBatcher};
pub use server::RelaySession;
