//! Stop-and-Wait socket.
//!
//! Sender invariant: exactly one unacknowledged INFO in flight. Each
//! fragment is transmitted and retransmitted until the ACK carrying its
//! sequence number arrives; the receiver delivers strictly in order,
//! re-acknowledging the immediately previous sequence when a
//! retransmission shows it was lost.
//!
//! One packet-handler worker per socket reads framed packets off the mux
//! stream and dispatches on the current state; ACKs are routed to the
//! sending thread over a channel.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use rostovlink::{byte_stream, ByteStreamRx, ByteStreamTx, MuxStream};

use crate::config::Config;
use crate::error::{RdtError, Result};
use crate::packet::{fragment, Packet};
use crate::socket::{await_connack, exchange_fin, recv_buffered, recv_exact_buffered};
use crate::state::{ConnectionState, StateCell};

struct Shared {
    stop: AtomicBool,
    connect_seen: Mutex<bool>,
    connect_cv: Condvar,
}

pub struct SawSocket {
    stream: Arc<MuxStream>,
    state: Arc<StateCell>,
    cfg: Config,
    shared: Arc<Shared>,
    next_send_seq: u32,
    acks: Receiver<u32>,
    rx: ByteStreamRx,
    handler: Option<JoinHandle<()>>,
    timeout: Option<Duration>,
    blocking: bool,
}

impl SawSocket {
    /// Connect to a listening endpoint and complete the handshake.
    ///
    /// Sends CONNECT until CONNACK arrives, then pushes the empty
    /// INFO(initial_seq) through the normal one-in-flight loop -- the ACK
    /// for it is the handshake's final confirmation, and losing it only
    /// costs a retransmission.
    pub fn connect(addr: SocketAddr, config: Config) -> Result<Self> {
        config.validate()?;
        tracing::debug!(%addr, "connecting");
        let stream = Arc::new(MuxStream::connect(addr, config.loss_factor)?);
        if let Err(e) = await_connack(&stream, &config) {
            let _ = stream.close();
            return Err(e);
        }

        let mut socket = Self::assemble(stream, config, false)?;
        socket.state.set(ConnectionState::Connecting);
        if let Err(e) = socket.transmit_fragment(Bytes::new()) {
            socket.abort_workers();
            return Err(e);
        }
        socket.state.set(ConnectionState::Connected);
        tracing::debug!("connected");
        Ok(socket)
    }

    /// Build the accepting side around a freshly demuxed stream and wait
    /// for the peer's CONNECT.
    ///
    /// Returns with the socket in `Connecting`; the peer's
    /// INFO(initial_seq) completes the handshake inside the handler.
    pub fn from_listener(stream: MuxStream, config: Config) -> Result<Self> {
        config.validate()?;
        tracing::debug!(peer = %stream.peer_addr(), "accepting connection");
        let mut socket = Self::assemble(Arc::new(stream), config, true)?;

        let deadline = Instant::now() + socket.cfg.connect_wait_timeout;
        let mut seen = socket.shared.connect_seen.lock();
        while !*seen {
            let now = Instant::now();
            if now >= deadline {
                drop(seen);
                socket.abort_workers();
                return Err(RdtError::Timeout);
            }
            let _ = socket
                .shared
                .connect_cv
                .wait_for(&mut seen, deadline - now);
        }
        drop(seen);
        Ok(socket)
    }

    fn assemble(stream: Arc<MuxStream>, cfg: Config, server: bool) -> Result<Self> {
        let state = Arc::new(StateCell::new());
        let shared = Arc::new(Shared {
            stop: AtomicBool::new(false),
            connect_seen: Mutex::new(false),
            connect_cv: Condvar::new(),
        });
        let (ack_tx, ack_rx) = unbounded();
        let (upstream, rx) = byte_stream();

        let handler = Handler {
            stream: Arc::clone(&stream),
            state: Arc::clone(&state),
            cfg: cfg.clone(),
            shared: Arc::clone(&shared),
            upstream,
            acks: ack_tx,
            expected_seq: cfg.initial_seq,
            server,
        };
        let handle = std::thread::Builder::new()
            .name(format!("saw-handler-{}", stream.peer_addr()))
            .spawn(move || handler.run())?;

        Ok(Self {
            stream,
            state,
            next_send_seq: cfg.initial_seq,
            cfg,
            shared,
            acks: ack_rx,
            rx,
            handler: Some(handle),
            timeout: None,
            blocking: true,
        })
    }

    /// Deliver the entire buffer reliably, one fragment at a time.
    pub fn send(&mut self, buffer: &[u8]) -> Result<()> {
        // An accepted socket is handed out as soon as CONNECT arrives; the
        // peer's handshake INFO may still be in flight, so give the
        // handshake a chance to finish before rejecting the send.
        let deadline = Instant::now() + self.cfg.connect_wait_timeout;
        while self.state.get() == ConnectionState::Connecting && Instant::now() < deadline {
            std::thread::sleep(self.cfg.stop_check_interval);
        }
        let state = self.state.get();
        if state == ConnectionState::ForcedClosing {
            return Err(RdtError::ForcedClose);
        }
        if !state.can_send() {
            return Err(RdtError::InvalidUse("socket is not connected"));
        }
        let fragments = fragment(buffer, self.cfg.mss);
        tracing::debug!(len = buffer.len(), fragments = fragments.len(), "sending buffer");
        for body in fragments {
            self.transmit_fragment(body)?;
        }
        Ok(())
    }

    /// Transmit one INFO and block until the matching ACK arrives,
    /// retransmitting on each `ack_timeout` up to the retry ceiling.
    fn transmit_fragment(&mut self, body: Bytes) -> Result<()> {
        let seq = self.next_send_seq;
        let datagram = Packet::Info { seq, body }.encode();
        for attempt in 0..=self.cfg.ack_retries {
            if attempt > 0 {
                tracing::warn!(seq, attempt, "ACK overdue, retransmitting");
            }
            self.stream.send(&datagram)?;
            let deadline = Instant::now() + self.cfg.ack_timeout;
            loop {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                match self.acks.recv_timeout(deadline - now) {
                    Ok(n) if n == seq => {
                        self.next_send_seq = self.next_send_seq.wrapping_add(1);
                        return Ok(());
                    }
                    Ok(n) => tracing::trace!(ack = n, awaiting = seq, "stale ACK, ignoring"),
                    Err(RecvTimeoutError::Timeout) => break,
                    Err(RecvTimeoutError::Disconnected) => {
                        return Err(RdtError::Protocol("packet handler terminated".into()));
                    }
                }
            }
            let st = self.state.get();
            if st == ConnectionState::ForcedClosing {
                return Err(RdtError::ForcedClose);
            }
            if st == ConnectionState::Disconnected {
                return Err(RdtError::Protocol("connection disconnected during send".into()));
            }
        }
        Err(RdtError::Timeout)
    }

    /// Read between 1 and `n` bytes of delivered data.
    pub fn recv(&mut self, n: usize) -> Result<Bytes> {
        recv_buffered(
            &mut self.rx,
            &self.state,
            n,
            self.timeout,
            self.blocking,
            self.cfg.closed_check_interval,
        )
    }

    /// Read exactly `n` bytes or fail without losing any.
    pub fn recv_exact(&mut self, n: usize) -> Result<Bytes> {
        recv_exact_buffered(
            &mut self.rx,
            &self.state,
            n,
            self.timeout,
            self.blocking,
            self.cfg.closed_check_interval,
        )
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn set_blocking(&mut self, blocking: bool) {
        self.blocking = blocking;
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.stream.peer_addr()
    }

    /// Coordinated close. Idempotent on terminal states; joins the
    /// handler before the FIN exchange so this thread owns the stream.
    pub fn close(&mut self) -> Result<()> {
        match self.state.get() {
            ConnectionState::Disconnected | ConnectionState::ForcedClosing => {
                self.abort_workers();
                return Ok(());
            }
            ConnectionState::NotConnected => {
                self.abort_workers();
                self.state.set(ConnectionState::Disconnected);
                return Ok(());
            }
            ConnectionState::FinRecv => self.state.set(ConnectionState::Disconnecting),
            _ => self.state.set(ConnectionState::SendingFin),
        }
        tracing::debug!("closing");
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handler.take() {
            let _ = handle.join();
        }
        if self.state.get() == ConnectionState::Disconnected {
            // The link died under the handler; nothing to coordinate.
            let _ = self.stream.close();
            return Ok(());
        }

        let stream = Arc::clone(&self.stream);
        let mut on_stray = move |p: Packet| {
            // A retransmitted INFO here means its ACK was lost; answer it
            // so the peer's sender can finish draining.
            if let Packet::Info { seq, .. } = p {
                let _ = stream.send(&Packet::Ack { seq }.encode());
            }
        };
        let result = exchange_fin(&self.stream, &self.state, &self.cfg, &mut on_stray);
        self.state.set(ConnectionState::Disconnected);
        let _ = self.stream.close();
        result
    }

    fn abort_workers(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handler.take() {
            let _ = handle.join();
        }
        let _ = self.stream.close();
    }
}

impl Drop for SawSocket {
    fn drop(&mut self) {
        // An abandoned socket lets its handler exit on the next poll tick;
        // only close() joins it.
        self.shared.stop.store(true, Ordering::Release);
    }
}

struct Handler {
    stream: Arc<MuxStream>,
    state: Arc<StateCell>,
    cfg: Config,
    shared: Arc<Shared>,
    upstream: ByteStreamTx,
    acks: Sender<u32>,
    expected_seq: u32,
    server: bool,
}

impl Handler {
    fn run(mut self) {
        tracing::debug!("packet handler started");
        self.stream.set_blocking(true);
        self.stream.set_timeout(Some(self.cfg.stop_check_interval));
        loop {
            if self.shared.stop.load(Ordering::Acquire) || self.state.get().is_terminal() {
                break;
            }
            match Packet::read_from(&self.stream) {
                Ok(packet) => self.dispatch(packet),
                Err(RdtError::Timeout) => continue,
                Err(RdtError::EndOfStream) => {
                    tracing::debug!("link closed under the handler");
                    self.state.set(ConnectionState::Disconnected);
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "unreadable packet, disconnecting");
                    self.state.set(ConnectionState::Disconnected);
                    break;
                }
            }
        }
        tracing::debug!("packet handler stopping");
    }

    fn dispatch(&mut self, packet: Packet) {
        let state = self.state.get();
        tracing::trace!(kind = packet.kind(), %state, "received packet");
        match packet {
            Packet::Connect => self.on_connect(state),
            Packet::Connack => tracing::debug!("duplicate CONNACK, dropping"),
            Packet::Info { seq, body } => self.on_info(state, seq, body),
            Packet::Ack { seq } => {
                let _ = self.acks.send(seq);
            }
            Packet::Fin => self.on_fin(state),
            Packet::Finack => tracing::warn!("FINACK with no FIN in flight, dropping"),
        }
    }

    fn on_connect(&mut self, state: ConnectionState) {
        if !self.server {
            tracing::warn!("CONNECT sent to the connecting side, dropping");
            return;
        }
        match state {
            ConnectionState::NotConnected | ConnectionState::Connecting => {
                if state == ConnectionState::NotConnected {
                    self.state.set(ConnectionState::Connecting);
                }
                self.send(Packet::Connack);
                let mut seen = self.shared.connect_seen.lock();
                *seen = true;
                self.shared.connect_cv.notify_all();
            }
            ConnectionState::Connected => {
                tracing::debug!("duplicate CONNECT while connected, dropping");
            }
            other => tracing::warn!(state = %other, "CONNECT in unexpected state, dropping"),
        }
    }

    fn on_info(&mut self, state: ConnectionState, seq: u32, body: Bytes) {
        match state {
            ConnectionState::NotConnected => {
                tracing::error!("INFO while not connected, disconnecting");
                self.state.set(ConnectionState::Disconnected);
            }
            ConnectionState::Connecting | ConnectionState::Connected => {
                if seq == self.expected_seq {
                    self.send(Packet::Ack { seq });
                    if !body.is_empty() {
                        self.upstream.put(body);
                    }
                    self.expected_seq = self.expected_seq.wrapping_add(1);
                    if state == ConnectionState::Connecting {
                        tracing::debug!("handshake complete");
                        self.state.set(ConnectionState::Connected);
                    }
                } else if seq == self.expected_seq.wrapping_sub(1) {
                    tracing::debug!(seq, "retransmitted INFO, acknowledging again");
                    self.send(Packet::Ack { seq });
                } else {
                    tracing::warn!(
                        seq,
                        expected = self.expected_seq,
                        "unexpected INFO sequence, dropping"
                    );
                }
            }
            _ => {
                // Teardown already underway; re-acknowledge a straggling
                // retransmission so the peer can finish draining.
                if seq == self.expected_seq.wrapping_sub(1) {
                    self.send(Packet::Ack { seq });
                } else {
                    tracing::trace!(seq, %state, "INFO during teardown, dropping");
                }
            }
        }
    }

    fn on_fin(&mut self, state: ConnectionState) {
        match state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                self.send(Packet::Finack);
                self.state.set(ConnectionState::FinRecv);
            }
            ConnectionState::FinRecv | ConnectionState::Disconnecting => {
                tracing::debug!("repeated FIN, answering again");
                self.send(Packet::Finack);
            }
            ConnectionState::SendingFin => {
                self.send(Packet::Finack);
                self.state.set(ConnectionState::Disconnecting);
            }
            other => {
                tracing::debug!(state = %other, "FIN in unexpected state, answering");
                self.send(Packet::Finack);
            }
        }
    }

    fn send(&self, packet: Packet) {
        if let Err(e) = self.stream.send(&packet.encode()) {
            tracing::warn!(error = %e, kind = packet.kind(), "failed to send packet");
        }
    }
}
