//! Listener-side mux/demux.
//!
//! One UDP endpoint is shared among every peer. A receive worker strips
//! the magic token and routes each inbound datagram to the per-peer byte
//! stream keyed by source address, creating a new stream (and a
//! pending-accept entry) for unknown sources while the backlog has room.
//! A send worker serializes outbound datagrams from all accepted streams
//! onto the endpoint, so per-peer senders never touch the socket
//! directly; a hangup sentinel in the same queue retires a peer's entry.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;

use crate::bytestream::{byte_stream, ByteStreamRx, ByteStreamTx};
use crate::error::{LinkError, Result};
use crate::frame;
use crate::stream::{MuxStream, WORKER_POLL};
use crate::udp::UnreliableSocket;

/// Commands consumed by the send worker.
pub enum SendCmd {
    /// Transmit one framed datagram to the address.
    Datagram(Bytes, SocketAddr),
    /// The peer's stream closed; drop its byte-stream entry.
    Hangup(SocketAddr),
}

type PeerMap = Arc<Mutex<HashMap<SocketAddr, ByteStreamTx>>>;

pub struct MuxListener {
    loss_factor: f64,
    udp: Option<Arc<UnreliableSocket>>,
    peers: PeerMap,
    send_tx: Sender<SendCmd>,
    send_rx: Option<Receiver<SendCmd>>,
    pending: Option<Receiver<(SocketAddr, ByteStreamRx)>>,
    timeout: Option<Duration>,
    blocking: bool,
    stop: Arc<AtomicBool>,
    recv_worker: Option<JoinHandle<()>>,
    send_worker: Option<JoinHandle<()>>,
}

impl MuxListener {
    pub fn new(loss_factor: f64) -> Self {
        let (send_tx, send_rx) = unbounded();
        Self {
            loss_factor,
            udp: None,
            peers: Arc::new(Mutex::new(HashMap::new())),
            send_tx,
            send_rx: Some(send_rx),
            pending: None,
            timeout: None,
            blocking: true,
            stop: Arc::new(AtomicBool::new(false)),
            recv_worker: None,
            send_worker: None,
        }
    }

    /// Bind the shared UDP endpoint.
    pub fn bind(&mut self, addr: SocketAddr) -> Result<()> {
        tracing::info!(%addr, "binding listener");
        let udp = UnreliableSocket::bind(addr, self.loss_factor)?;
        udp.set_timeout(Some(WORKER_POLL))?;
        self.udp = Some(Arc::new(udp));
        Ok(())
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.udp
            .as_ref()
            .ok_or(LinkError::Closed)?
            .local_addr()
    }

    /// Start the receive and send workers with the given accept backlog.
    pub fn listen(&mut self, backlog: usize) -> Result<()> {
        let udp = self.udp.as_ref().ok_or(LinkError::Closed)?;
        let (pending_tx, pending_rx) = bounded(backlog.max(1));
        self.pending = Some(pending_rx);

        let recv_worker = {
            let udp = Arc::clone(udp);
            let peers = Arc::clone(&self.peers);
            let stop = Arc::clone(&self.stop);
            std::thread::Builder::new()
                .name("mux-listener-recv".into())
                .spawn(move || recv_worker(udp, peers, pending_tx, stop))?
        };
        let send_worker = {
            let udp = Arc::clone(udp);
            let peers = Arc::clone(&self.peers);
            let stop = Arc::clone(&self.stop);
            let send_rx = self.send_rx.take().ok_or(LinkError::Closed)?;
            std::thread::Builder::new()
                .name("mux-listener-send".into())
                .spawn(move || send_worker(udp, peers, send_rx, stop))?
        };
        self.recv_worker = Some(recv_worker);
        self.send_worker = Some(send_worker);
        Ok(())
    }

    /// Pop one pending peer and wrap it in a `MuxStream`.
    ///
    /// Honors the listener's timeout and blocking mode: `Timeout` when the
    /// configured wait elapses, `WouldBlock` in non-blocking mode with an
    /// empty backlog.
    pub fn accept(&self) -> Result<MuxStream> {
        let pending = self.pending.as_ref().ok_or(LinkError::Closed)?;
        let (addr, rx) = if !self.blocking {
            match pending.try_recv() {
                Ok(entry) => entry,
                Err(TryRecvError::Empty) => return Err(LinkError::WouldBlock),
                Err(TryRecvError::Disconnected) => return Err(LinkError::Closed),
            }
        } else {
            match self.timeout {
                Some(t) => match pending.recv_timeout(t) {
                    Ok(entry) => entry,
                    Err(RecvTimeoutError::Timeout) => return Err(LinkError::Timeout),
                    Err(RecvTimeoutError::Disconnected) => return Err(LinkError::Closed),
                },
                None => pending.recv().map_err(|_| LinkError::Closed)?,
            }
        };
        tracing::debug!(%addr, "accepted connection");
        Ok(MuxStream::accepted(addr, rx, self.send_tx.clone()))
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn set_blocking(&mut self, blocking: bool) {
        self.blocking = blocking;
    }

    /// Stop and join both workers, then close the endpoint. Peers that
    /// never hung up are logged and discarded.
    pub fn close(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.recv_worker.take() {
            let _ = worker.join();
        }
        if let Some(worker) = self.send_worker.take() {
            let _ = worker.join();
        }
        if let Some(udp) = &self.udp {
            udp.close();
        }
        let mut peers = self.peers.lock();
        if !peers.is_empty() {
            tracing::warn!(
                remaining = peers.len(),
                "closing listener with live peer streams"
            );
            peers.clear();
        }
    }
}

impl Drop for MuxListener {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

/// Demultiplex inbound datagrams into per-peer byte streams.
fn recv_worker(
    udp: Arc<UnreliableSocket>,
    peers: PeerMap,
    pending: Sender<(SocketAddr, ByteStreamRx)>,
    stop: Arc<AtomicBool>,
) {
    tracing::debug!("listener receive worker started");
    let mut buf = vec![0u8; frame::MAX_DATAGRAM];
    loop {
        match udp.recv_from(&mut buf) {
            Ok((len, addr)) => {
                let Some(payload) = frame::strip(&buf[..len]) else {
                    continue;
                };
                let mut peers = peers.lock();
                if let Some(tx) = peers.get(&addr) {
                    if !tx.put(payload) {
                        tracing::debug!(%addr, "byte stream consumer gone, dropping datagram");
                    }
                } else {
                    let (tx, rx) = byte_stream();
                    match pending.try_send((addr, rx)) {
                        Ok(()) => {
                            // The first datagram may already carry data, so
                            // the byte stream must exist before accept().
                            tracing::debug!(%addr, "new pending connection");
                            tx.put(payload);
                            peers.insert(addr, tx);
                        }
                        Err(TrySendError::Full(_)) => {
                            tracing::warn!(%addr, "accept backlog full, dropping datagram");
                        }
                        Err(TrySendError::Disconnected(_)) => break,
                    }
                }
            }
            Err(LinkError::Timeout) | Err(LinkError::WouldBlock) => {
                if stop.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "listener receive worker exiting");
                break;
            }
        }
    }
    tracing::debug!("listener receive worker stopped");
}

/// Serialize outbound datagrams from every accepted stream.
fn send_worker(
    udp: Arc<UnreliableSocket>,
    peers: PeerMap,
    queue: Receiver<SendCmd>,
    stop: Arc<AtomicBool>,
) {
    tracing::debug!("listener send worker started");
    loop {
        match queue.recv_timeout(WORKER_POLL) {
            Ok(SendCmd::Datagram(data, addr)) => {
                if let Err(e) = udp.send_to(&data, addr) {
                    tracing::warn!(error = %e, %addr, "failed to send datagram");
                }
            }
            Ok(SendCmd::Hangup(addr)) => {
                let mut peers = peers.lock();
                peers.remove(&addr);
                tracing::debug!(%addr, remaining = peers.len(), "peer hung up");
            }
            Err(RecvTimeoutError::Timeout) => {
                if stop.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    tracing::debug!("listener send worker stopped");
}
