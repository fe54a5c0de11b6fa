//! Signing protocol: canonical encoding, signature packets and the engine

pub mod canonical;
pub mod engine;
pub mod packet;

pub use canonical::{canonical_bytes, Payload, PayloadValue};
pub use engine::SignatureEngine;
pub use packet::SignaturePacket;
