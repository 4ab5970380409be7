//! rostovlink -- Layer 2 datagram mux/demux for the Rostov transport stack.
//!
//! Splits one UDP port into per-peer byte streams:
//! - **UnreliableSocket**: one UDP endpoint behind separate send/receive
//!   locks, with optional outbound loss injection for tests
//! - **ByteStream**: multi-producer / single-consumer byte queue with
//!   timeout, blocking and end-of-stream semantics
//! - **MuxListener**: demultiplexes inbound datagrams by source address
//!   and serializes all outbound traffic through one send worker
//! - **MuxStream**: the per-peer byte-stream view, connected or accepted

pub mod bytestream;
pub mod error;
pub mod frame;
pub mod listener;
pub mod stream;
pub mod udp;

// Re-export key public types at crate root.
pub use bytestream::{byte_stream, ByteStreamRx, ByteStreamTx};
pub use error::{LinkError, Result};
pub use frame::{MAGIC, MAX_DATAGRAM};
pub use listener::MuxListener;
pub use stream::MuxStream;
pub use udp::UnreliableSocket;
