//! Wire envelope types and framing codec for the agent relay (spec §3, §4.1).
//!
//! This crate has no async runtime dependency by design: it only encodes and
//! decodes bytes. Connection-level concerns (sockets, timers) live in the
//! `daemon` and `relay-client` crates, which depend on this one.

pub mod codec;
pub mod dedupe;
pub mod envelope;
mod error;

pub use codec::{encode_batch, encode_frame, Codec, FrameDecoder, FrameMode, MAX_FRAME_BYTES};
pub use dedupe::{DedupeCache, DEFAULT_DEDUPE_CAPACITY};
pub use envelope::*;
pub use error::ProtocolError;
