//! Tunable parameters shared by both reliability variants.

use std::time::Duration;

use crate::error::{RdtError, Result};
use crate::packet::MAX_BODY;

/// Socket configuration.
///
/// The defaults are the protocol's design parameters; tests shrink the
/// timers and enable loss injection, production code normally keeps
/// `Config::default()`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Retransmission period for an unacknowledged INFO.
    pub ack_timeout: Duration,
    /// How long to wait for FINACK before resending FIN.
    pub finack_wait_timeout: Duration,
    /// Quiet interval after the last FINACK during which repeated FINs
    /// are still answered.
    pub fin_wait_timeout: Duration,
    /// How long to wait for CONNACK before resending CONNECT.
    pub connack_wait_timeout: Duration,
    /// Server-side wait for the first CONNECT on an accepted stream.
    pub connect_wait_timeout: Duration,
    /// CONNECT / CONNACK resend ceiling during the handshake.
    pub connect_retries: u32,
    /// FIN / FINACK resend ceiling during teardown.
    pub fin_retries: u32,
    /// INFO retransmission ceiling before the connection is force-closed.
    pub ack_retries: u32,
    /// Largest INFO body; fragments never exceed this.
    pub mss: usize,
    /// Selective-repeat window: distinct unacknowledged sequences allowed
    /// in flight. Must stay below half the sequence space.
    pub window_size: u32,
    /// First sequence number a connection sends.
    pub initial_seq: u32,
    /// How often blocked workers wake to check the stop flag.
    pub stop_check_interval: Duration,
    /// How often blocked callers wake to check whether the connection
    /// closed under them.
    pub closed_check_interval: Duration,
    /// Outbound datagram loss probability, tests only.
    pub loss_factor: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(1500),
            finack_wait_timeout: Duration::from_millis(1500),
            fin_wait_timeout: Duration::from_secs(7),
            connack_wait_timeout: Duration::from_millis(1500),
            connect_wait_timeout: Duration::from_secs(10),
            connect_retries: 50,
            fin_retries: 10,
            ack_retries: 50,
            mss: 62_000,
            window_size: 500,
            initial_seq: 0,
            stop_check_interval: Duration::from_millis(100),
            closed_check_interval: Duration::from_secs(1),
            loss_factor: 0.0,
        }
    }
}

impl Config {
    /// Check the invariants the sliding-window arithmetic relies on.
    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(RdtError::InvalidUse("window_size must be at least 1"));
        }
        if self.window_size >= 1 << 31 {
            return Err(RdtError::InvalidUse(
                "window_size must stay below half the sequence space",
            ));
        }
        if self.mss == 0 || self.mss > MAX_BODY {
            return Err(RdtError::InvalidUse("mss must be in 1..=65514"));
        }
        if !(0.0..=1.0).contains(&self.loss_factor) {
            return Err(RdtError::InvalidUse("loss_factor must be within [0, 1]"));
        }
        Ok(())
    }
}
