//! The reliable sockets.
//!
//! Two interchangeable variants -- Stop-and-Wait and Selective Repeat --
//! share the wire codec, the connection state machine, the handshake
//! client loop and the FIN/FINACK teardown discipline defined here.

pub mod saw;
pub mod sr;

use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use rostovlink::{ByteStreamRx, LinkError, MuxStream};

use crate::config::Config;
use crate::error::{RdtError, Result};
use crate::packet::Packet;
use crate::state::{ConnectionState, StateCell};

pub use saw::SawSocket;
pub use sr::SrSocket;

/// The reliability algorithm a listener or socket runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdtMethod {
    StopAndWait,
    SelectiveRepeat,
}

/// A connected reliable socket of either variant.
pub enum RdtSocket {
    StopAndWait(SawSocket),
    SelectiveRepeat(SrSocket),
}

impl RdtSocket {
    /// Connect to a listening endpoint with default configuration.
    pub fn connect(method: RdtMethod, addr: std::net::SocketAddr) -> Result<Self> {
        Self::connect_with_config(method, addr, Config::default())
    }

    /// Connect to a listening endpoint.
    pub fn connect_with_config(
        method: RdtMethod,
        addr: std::net::SocketAddr,
        config: Config,
    ) -> Result<Self> {
        match method {
            RdtMethod::StopAndWait => SawSocket::connect(addr, config).map(Self::StopAndWait),
            RdtMethod::SelectiveRepeat => SrSocket::connect(addr, config).map(Self::SelectiveRepeat),
        }
    }

    /// Deliver the entire buffer reliably. May block on window space or
    /// acknowledgements.
    pub fn send(&mut self, buffer: &[u8]) -> Result<()> {
        match self {
            Self::StopAndWait(s) => s.send(buffer),
            Self::SelectiveRepeat(s) => s.send(buffer),
        }
    }

    /// Read between 1 and `n` bytes of delivered data.
    pub fn recv(&mut self, n: usize) -> Result<Bytes> {
        match self {
            Self::StopAndWait(s) => s.recv(n),
            Self::SelectiveRepeat(s) => s.recv(n),
        }
    }

    /// Read exactly `n` bytes or fail.
    pub fn recv_exact(&mut self, n: usize) -> Result<Bytes> {
        match self {
            Self::StopAndWait(s) => s.recv_exact(n),
            Self::SelectiveRepeat(s) => s.recv_exact(n),
        }
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        match self {
            Self::StopAndWait(s) => s.set_timeout(timeout),
            Self::SelectiveRepeat(s) => s.set_timeout(timeout),
        }
    }

    pub fn set_blocking(&mut self, blocking: bool) {
        match self {
            Self::StopAndWait(s) => s.set_blocking(blocking),
            Self::SelectiveRepeat(s) => s.set_blocking(blocking),
        }
    }

    pub fn state(&self) -> ConnectionState {
        match self {
            Self::StopAndWait(s) => s.state(),
            Self::SelectiveRepeat(s) => s.state(),
        }
    }

    pub fn peer_addr(&self) -> std::net::SocketAddr {
        match self {
            Self::StopAndWait(s) => s.peer_addr(),
            Self::SelectiveRepeat(s) => s.peer_addr(),
        }
    }

    /// Coordinated close; drains in-flight data, exchanges FIN/FINACK and
    /// joins every worker before returning.
    pub fn close(&mut self) -> Result<()> {
        match self {
            Self::StopAndWait(s) => s.close(),
            Self::SelectiveRepeat(s) => s.close(),
        }
    }
}

/// Client side of the handshake: send CONNECT, await CONNACK, resending
/// on each timeout up to the retry ceiling.
pub(crate) fn await_connack(stream: &MuxStream, cfg: &Config) -> Result<()> {
    stream.set_blocking(true);
    stream.set_timeout(Some(cfg.connack_wait_timeout));
    stream.send(&Packet::Connect.encode())?;
    let mut attempt = 0u32;
    loop {
        match Packet::read_from(stream) {
            Ok(Packet::Connack) => return Ok(()),
            Ok(p) => {
                tracing::warn!(kind = p.kind(), "unexpected packet while waiting for CONNACK, dropping");
            }
            Err(RdtError::Timeout) => {
                attempt += 1;
                if attempt >= cfg.connect_retries {
                    return Err(RdtError::Timeout);
                }
                tracing::warn!(attempt, "timed out waiting for CONNACK, resending CONNECT");
                stream.send(&Packet::Connect.encode())?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Send FIN and wait for FINACK, retrying up to the teardown ceiling.
///
/// Runs on the closing thread after the packet handler has been joined,
/// so this code owns the stream. A FIN received instead of FINACK means
/// the peer is closing too; answer it and fall through to the linger
/// phase. Stray INFO/ACK packets (late retransmissions) are handed to
/// `on_stray` so the reliability layer can re-acknowledge them.
pub(crate) fn exchange_fin(
    stream: &MuxStream,
    state: &StateCell,
    cfg: &Config,
    on_stray: &mut dyn FnMut(Packet),
) -> Result<()> {
    stream.set_blocking(true);
    stream.set_timeout(Some(cfg.finack_wait_timeout));
    stream.send(&Packet::Fin.encode())?;
    let mut attempt = 0u32;
    loop {
        match Packet::read_from(stream) {
            Ok(Packet::Finack) => {
                tracing::debug!("FINACK received");
                state.set(ConnectionState::FinSent);
                // A gratuitous FINACK lets the peer cut its safety
                // interval short instead of waiting it out.
                let _ = stream.send(&Packet::Finack.encode());
                return linger_after_finack(stream, cfg, on_stray);
            }
            Ok(Packet::Fin) => {
                tracing::debug!("both ends sent FIN, answering and lingering");
                state.set(ConnectionState::Disconnecting);
                stream.send(&Packet::Finack.encode())?;
                return linger_after_finack(stream, cfg, on_stray);
            }
            Ok(p @ (Packet::Info { .. } | Packet::Ack { .. })) => on_stray(p),
            Ok(p) => {
                tracing::warn!(kind = p.kind(), "unexpected packet while waiting for FINACK, dropping");
            }
            Err(RdtError::Timeout) => {
                attempt += 1;
                if attempt >= cfg.fin_retries {
                    tracing::warn!("could not confirm the peer observed the close");
                    return Ok(());
                }
                tracing::warn!(attempt, "timed out waiting for FINACK, resending FIN");
                stream.send(&Packet::Fin.encode())?;
            }
            Err(RdtError::EndOfStream) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

/// The safety interval after the last FINACK.
///
/// The peer cannot know whether its FINACK arrived, so any repeated FIN
/// inside this window is answered with another FINACK. A quiet interval,
/// a FINACK from the peer, or link end-of-stream all finish the close.
pub(crate) fn linger_after_finack(
    stream: &MuxStream,
    cfg: &Config,
    on_stray: &mut dyn FnMut(Packet),
) -> Result<()> {
    stream.set_timeout(Some(cfg.fin_wait_timeout));
    for _ in 0..cfg.fin_retries {
        match Packet::read_from(stream) {
            Ok(Packet::Fin) => {
                tracing::debug!("repeated FIN inside the safety interval, answering again");
                stream.send(&Packet::Finack.encode())?;
            }
            Ok(Packet::Finack) => return Ok(()),
            Ok(p @ (Packet::Info { .. } | Packet::Ack { .. })) => on_stray(p),
            Ok(p) => {
                tracing::warn!(kind = p.kind(), "unexpected packet inside the safety interval, dropping");
            }
            Err(RdtError::Timeout) => return Ok(()),
            Err(RdtError::EndOfStream) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Read between 1 and `n` bytes from a socket's delivered-data buffer,
/// honoring the socket timeout and blocking mode and watching the state
/// cell so a close under the reader surfaces as `EndOfStream`.
pub(crate) fn recv_buffered(
    rx: &mut ByteStreamRx,
    state: &StateCell,
    n: usize,
    timeout: Option<Duration>,
    blocking: bool,
    poll: Duration,
) -> Result<Bytes> {
    if state.get() == ConnectionState::NotConnected {
        return Err(RdtError::InvalidUse("socket is not connected"));
    }
    if n == 0 {
        return Ok(Bytes::new());
    }
    if !blocking {
        return match rx.get(n, None, false) {
            Ok(chunk) => Ok(chunk),
            Err(LinkError::WouldBlock) => {
                if stream_finished(state, rx) {
                    Err(RdtError::EndOfStream)
                } else {
                    Err(RdtError::WouldBlock)
                }
            }
            Err(e) => Err(e.into()),
        };
    }
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        let mut wait = poll;
        if let Some(deadline) = deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(RdtError::Timeout);
            }
            wait = wait.min(remaining);
        }
        match rx.get(n, Some(wait), true) {
            Ok(chunk) => return Ok(chunk),
            Err(LinkError::Timeout) => {
                if stream_finished(state, rx) {
                    return Err(RdtError::EndOfStream);
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Strict variant: exactly `n` bytes or an error, with partial reads
/// pushed back so nothing is lost.
pub(crate) fn recv_exact_buffered(
    rx: &mut ByteStreamRx,
    state: &StateCell,
    n: usize,
    timeout: Option<Duration>,
    blocking: bool,
    poll: Duration,
) -> Result<Bytes> {
    let deadline = timeout.map(|t| Instant::now() + t);
    let mut out = BytesMut::with_capacity(n);
    while out.len() < n {
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        match recv_buffered(rx, state, n - out.len(), remaining, blocking, poll) {
            Ok(chunk) => out.extend_from_slice(&chunk),
            Err(e) => {
                if !out.is_empty() {
                    rx.unget(out.freeze());
                }
                return Err(e);
            }
        }
    }
    Ok(out.freeze())
}

/// The peer will send no more data and everything delivered has been
/// consumed. Checked together so the state decision and the emptiness
/// check cannot interleave with a delivery.
fn stream_finished(state: &StateCell, rx: &ByteStreamRx) -> bool {
    let st = state.get();
    (st.peer_closed() || st.is_terminal()) && rx.is_empty()
}
