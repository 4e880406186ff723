//! Transfer pipeline: slicing an outbound file into chunks and rebuilding an
//! inbound one from them.
//!
//! Chunks travel as raw binary data channel messages, framed only by the
//! channel itself. Ordering and reliability come from the transport, so the
//! pipeline carries no sequence numbers and no integrity state of its own.

pub mod chunk;
pub mod reassembler;

pub use chunk::ChunkSource;
pub use reassembler::Reassembler;
