//! rostovstream -- Layer 3 reliable transport for the Rostov stack.
//!
//! Connection-oriented, ordered, reliable byte streams between one
//! listening endpoint and many concurrent clients, multiplexed over a
//! single UDP port by `rostovlink`. Two interchangeable reliability
//! algorithms share the wire codec, the state machine and the teardown
//! discipline:
//! - **Stop-and-Wait**: exactly one unacknowledged INFO in flight
//! - **Selective Repeat**: a sliding window of unacknowledged INFOs with
//!   per-packet retransmission timers and receive-side reordering

pub mod config;
pub mod error;
pub mod listener;
pub mod packet;
pub mod retransmit;
pub mod socket;
pub mod state;
pub mod window;

// Re-export key public types at crate root.
pub use config::Config;
pub use error::{RdtError, Result};
pub use listener::RdtListener;
pub use packet::Packet;
pub use socket::{RdtMethod, RdtSocket, SawSocket, SrSocket};
pub use state::ConnectionState;
pub use window::seq_gt;
