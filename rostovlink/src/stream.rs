//! Per-peer datagram stream.
//!
//! A `MuxStream` is the byte-stream view of one remote peer. It exists in
//! two flavors with one API:
//!
//! - **connected**: created with [`MuxStream::connect`]; owns its own UDP
//!   endpoint plus a receive worker that routes every inbound datagram for
//!   the configured peer into the byte stream.
//! - **accepted**: created by the listener; shares the listener's UDP
//!   endpoint, reading from the per-peer byte stream the demultiplexer
//!   fills and writing through the listener's send queue.
//!
//! `send` frames one datagram (prepending the magic token); `recv` /
//! `recv_exact` read from the byte stream with the configured timeout and
//! blocking mode.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::Sender;
use parking_lot::Mutex;

use crate::bytestream::{byte_stream, ByteStreamRx, ByteStreamTx};
use crate::error::{LinkError, Result};
use crate::frame;
use crate::listener::SendCmd;
use crate::udp::UnreliableSocket;

/// How often workers wake from a blocking receive to check the stop flag.
pub(crate) const WORKER_POLL: Duration = Duration::from_secs(1);

enum StreamTx {
    /// Connected flavor: write straight to the owned endpoint.
    Direct(Arc<UnreliableSocket>),
    /// Accepted flavor: hand datagrams to the listener's send worker.
    Queued(Sender<SendCmd>),
}

pub struct MuxStream {
    peer: SocketAddr,
    rx: Mutex<ByteStreamRx>,
    tx: StreamTx,
    timeout: Mutex<Option<Duration>>,
    blocking: AtomicBool,
    closed: AtomicBool,
    stop: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    udp: Option<Arc<UnreliableSocket>>,
}

impl MuxStream {
    /// Open a stream to `peer` on a fresh ephemeral UDP endpoint.
    ///
    /// `loss_factor` injects outbound datagram loss for tests; 0.0 in
    /// normal use.
    pub fn connect(peer: SocketAddr, loss_factor: f64) -> Result<Self> {
        let udp = Arc::new(UnreliableSocket::bind(
            "0.0.0.0:0".parse().expect("static addr"),
            loss_factor,
        )?);
        udp.set_timeout(Some(WORKER_POLL))?;

        let (tx, rx) = byte_stream();
        let stop = Arc::new(AtomicBool::new(false));

        let worker = {
            let udp = Arc::clone(&udp);
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name(format!("mux-recv-{peer}"))
                .spawn(move || recv_worker(udp, peer, tx, stop))?
        };

        Ok(Self {
            peer,
            rx: Mutex::new(rx),
            tx: StreamTx::Direct(Arc::clone(&udp)),
            timeout: Mutex::new(None),
            blocking: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            stop,
            worker: Mutex::new(Some(worker)),
            udp: Some(udp),
        })
    }

    /// Build the accepted flavor around a demuxed byte stream and the
    /// listener's send queue.
    pub(crate) fn accepted(peer: SocketAddr, rx: ByteStreamRx, send_queue: Sender<SendCmd>) -> Self {
        Self {
            peer,
            rx: Mutex::new(rx),
            tx: StreamTx::Queued(send_queue),
            timeout: Mutex::new(None),
            blocking: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            stop: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
            udp: None,
        }
    }

    /// The remote peer this stream talks to.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Send one datagram, prefixed with the magic token.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LinkError::Closed);
        }
        let datagram = frame::seal(payload);
        match &self.tx {
            StreamTx::Direct(udp) => {
                udp.send_to(&datagram, self.peer)?;
            }
            StreamTx::Queued(queue) => {
                queue
                    .send(SendCmd::Datagram(datagram, self.peer))
                    .map_err(|_| LinkError::Closed)?;
            }
        }
        Ok(())
    }

    /// Read between 1 and `n` bytes from the peer's byte stream.
    pub fn recv(&self, n: usize) -> Result<Bytes> {
        let timeout = *self.timeout.lock();
        let blocking = self.blocking.load(Ordering::Acquire);
        self.rx.lock().get(n, timeout, blocking)
    }

    /// Read exactly `n` bytes or fail without losing any.
    pub fn recv_exact(&self, n: usize) -> Result<Bytes> {
        let timeout = *self.timeout.lock();
        let blocking = self.blocking.load(Ordering::Acquire);
        self.rx.lock().get_exact(n, timeout, blocking)
    }

    /// True when no received bytes are waiting.
    pub fn recv_buffer_empty(&self) -> bool {
        self.rx.lock().is_empty()
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) {
        *self.timeout.lock() = timeout;
    }

    pub fn set_blocking(&self, blocking: bool) {
        self.blocking.store(blocking, Ordering::Release);
    }

    /// Tear the stream down.
    ///
    /// Connected flavor: stops and joins the receive worker, then closes
    /// the endpoint. Accepted flavor: posts the hangup sentinel so the
    /// listener's send worker drops this peer's byte-stream entry.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
        if let Some(udp) = &self.udp {
            udp.close();
        }
        if let StreamTx::Queued(queue) = &self.tx {
            let _ = queue.send(SendCmd::Hangup(self.peer));
        }
        Ok(())
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        // Let an abandoned receive worker exit on its next poll tick.
        self.stop.store(true, Ordering::Release);
    }
}

/// Receive loop for the connected flavor: one peer, one byte stream.
fn recv_worker(
    udp: Arc<UnreliableSocket>,
    peer: SocketAddr,
    tx: ByteStreamTx,
    stop: Arc<AtomicBool>,
) {
    tracing::debug!(%peer, "stream receive worker started");
    let mut buf = vec![0u8; frame::MAX_DATAGRAM];
    loop {
        match udp.recv_from(&mut buf) {
            Ok((len, addr)) => {
                if addr != peer {
                    tracing::warn!(%addr, expected = %peer, "dropping datagram from foreign address");
                    continue;
                }
                let Some(payload) = frame::strip(&buf[..len]) else {
                    continue;
                };
                if !tx.put(payload) {
                    break;
                }
            }
            Err(LinkError::Timeout) | Err(LinkError::WouldBlock) => {
                if stop.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, %peer, "stream receive worker exiting");
                break;
            }
        }
    }
    tracing::debug!(%peer, "stream receive worker stopped");
}
