//! Selective-Repeat socket.
//!
//! The sender keeps up to `window_size` distinct unacknowledged sequences
//! in flight; the blocking sequence-number provider is the only
//! backpressure mechanism. Each transmitted INFO is registered with the
//! retransmission queue, which the packet-handler worker polls on its
//! receive-timeout tick -- no thread per in-flight packet. The receiver
//! buffers out-of-order packets and delivers contiguous runs, comparing
//! sequences with the modular ordering so wrap-around is transparent.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use rostovlink::{byte_stream, ByteStreamRx, MuxStream};

use crate::config::Config;
use crate::error::{RdtError, Result};
use crate::packet::{fragment, Packet};
use crate::retransmit::{GivenUp, RetransmitQueue};
use crate::socket::{await_connack, exchange_fin, recv_buffered, recv_exact_buffered};
use crate::state::{ConnectionState, StateCell};
use crate::window::{AckRegister, Assembler, SequenceProvider};

pub struct SrSocket {
    stream: Arc<MuxStream>,
    state: Arc<StateCell>,
    cfg: Config,
    provider: Arc<SequenceProvider>,
    register: Arc<AckRegister>,
    retransmit: Arc<Mutex<RetransmitQueue>>,
    assembler: Arc<Mutex<Assembler>>,
    rx: ByteStreamRx,
    stop: Arc<AtomicBool>,
    handler: Option<JoinHandle<()>>,
    timeout: Option<Duration>,
    blocking: bool,
}

impl SrSocket {
    /// Connect to a listening endpoint.
    ///
    /// Sends CONNECT until CONNACK arrives, then transmits the empty
    /// INFO(initial_seq) that confirms the handshake. The socket is
    /// `Connecting` until that INFO's ACK comes back; `send` and `close`
    /// gate on it.
    pub fn connect(addr: SocketAddr, config: Config) -> Result<Self> {
        config.validate()?;
        tracing::debug!(%addr, "connecting");
        let stream = Arc::new(MuxStream::connect(addr, config.loss_factor)?);
        if let Err(e) = await_connack(&stream, &config) {
            let _ = stream.close();
            return Err(e);
        }

        let mut socket = Self::assemble(stream, config);
        socket.state.set(ConnectionState::Connecting);
        socket.register.expect_first(socket.cfg.initial_seq);

        let seq = socket
            .provider
            .acquire(socket.cfg.stop_check_interval)
            .ok_or(RdtError::Timeout)?;
        let datagram = Packet::Info {
            seq,
            body: Bytes::new(),
        }
        .encode();
        socket.register.add_pending(seq);
        socket
            .retransmit
            .lock()
            .push(seq, datagram.clone(), Instant::now());
        if let Err(e) = socket.stream.send(&datagram) {
            socket.abort_workers();
            return Err(e.into());
        }
        socket.spawn_handler()?;
        tracing::debug!("handshake sent, connection opening");
        Ok(socket)
    }

    /// Build the accepting side: wait for CONNECT, send CONNACK and wait
    /// for the initial INFO that proves the peer saw it.
    pub fn from_listener(stream: MuxStream, config: Config) -> Result<Self> {
        config.validate()?;
        tracing::debug!(peer = %stream.peer_addr(), "accepting connection");
        let stream = Arc::new(stream);
        stream.set_blocking(true);
        stream.set_timeout(Some(config.connect_wait_timeout));
        match Packet::read_from(&stream) {
            Ok(Packet::Connect) => {}
            Ok(p) => {
                let _ = stream.close();
                return Err(RdtError::Protocol(format!(
                    "expected CONNECT, received {}",
                    p.kind()
                )));
            }
            Err(e) => {
                let _ = stream.close();
                return Err(e);
            }
        }

        let mut socket = Self::assemble(stream, config);
        socket.state.set(ConnectionState::Connecting);
        if let Err(e) = socket.await_initial_info() {
            socket.abort_workers();
            return Err(e);
        }
        socket.state.set(ConnectionState::Connected);
        socket.spawn_handler()?;
        tracing::debug!("connected");
        Ok(socket)
    }

    fn assemble(stream: Arc<MuxStream>, cfg: Config) -> Self {
        let (upstream, rx) = byte_stream();
        Self {
            stream,
            state: Arc::new(StateCell::new()),
            provider: Arc::new(SequenceProvider::new(cfg.initial_seq, cfg.window_size)),
            register: Arc::new(AckRegister::new()),
            retransmit: Arc::new(Mutex::new(RetransmitQueue::new(
                cfg.ack_timeout,
                cfg.ack_retries,
            ))),
            assembler: Arc::new(Mutex::new(Assembler::new(cfg.initial_seq, upstream))),
            rx,
            cfg,
            stop: Arc::new(AtomicBool::new(false)),
            handler: None,
            timeout: None,
            blocking: true,
        }
    }

    fn spawn_handler(&mut self) -> Result<()> {
        let handler = Handler {
            stream: Arc::clone(&self.stream),
            state: Arc::clone(&self.state),
            cfg: self.cfg.clone(),
            provider: Arc::clone(&self.provider),
            register: Arc::clone(&self.register),
            retransmit: Arc::clone(&self.retransmit),
            assembler: Arc::clone(&self.assembler),
            stop: Arc::clone(&self.stop),
        };
        let handle = std::thread::Builder::new()
            .name(format!("sr-handler-{}", self.stream.peer_addr()))
            .spawn(move || handler.run())?;
        self.handler = Some(handle);
        Ok(())
    }

    /// CONNACK has been sent; acknowledge INFOs until the initial one
    /// arrives, resending CONNACK whenever the wait times out or the peer
    /// retransmits CONNECT.
    fn await_initial_info(&self) -> Result<()> {
        self.stream.set_timeout(Some(self.cfg.connack_wait_timeout));
        self.stream.send(&Packet::Connack.encode())?;
        let mut attempt = 0u32;
        loop {
            match Packet::read_from(&self.stream) {
                Ok(Packet::Connect) => {
                    tracing::debug!("peer resent CONNECT, answering again");
                    self.stream.send(&Packet::Connack.encode())?;
                }
                Ok(Packet::Info { seq, body }) => {
                    self.assembler.lock().received(seq, body);
                    self.stream.send(&Packet::Ack { seq }.encode())?;
                    if seq == self.cfg.initial_seq {
                        return Ok(());
                    }
                }
                Ok(p) => {
                    return Err(RdtError::Protocol(format!(
                        "unexpected {} while waiting for the initial INFO",
                        p.kind()
                    )));
                }
                Err(RdtError::Timeout) => {
                    attempt += 1;
                    if attempt >= self.cfg.connect_retries {
                        return Err(RdtError::Timeout);
                    }
                    tracing::warn!(attempt, "timed out waiting for the initial INFO, resending CONNACK");
                    self.stream.send(&Packet::Connack.encode())?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Deliver the entire buffer reliably.
    ///
    /// Blocks at sequence acquisition while the window is full; that is
    /// the protocol's only sender backpressure.
    pub fn send(&mut self, buffer: &[u8]) -> Result<()> {
        self.wait_handshake_confirmed()?;
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
            let seq = self.acquire_seq()?;
            let datagram = Packet::Info { seq, body }.encode();
            self.register.add_pending(seq);
            self.retransmit
                .lock()
                .push(seq, datagram.clone(), Instant::now());
            self.stream.send(&datagram)?;
            tracing::trace!(seq, "INFO transmitted");
        }
        Ok(())
    }

    fn acquire_seq(&self) -> Result<u32> {
        loop {
            match self.provider.acquire(self.cfg.closed_check_interval) {
                Some(seq) => return Ok(seq),
                None => {
                    let state = self.state.get();
                    if state == ConnectionState::ForcedClosing {
                        return Err(RdtError::ForcedClose);
                    }
                    if state.is_closing() || state.peer_closed() {
                        return Err(RdtError::InvalidUse("connection closed during send"));
                    }
                }
            }
        }
    }

    fn wait_handshake_confirmed(&self) -> Result<()> {
        let state = Arc::clone(&self.state);
        if self
            .register
            .wait_first_acked(self.cfg.stop_check_interval, move || state.get().is_terminal())
        {
            return Ok(());
        }
        match self.state.get() {
            ConnectionState::ForcedClosing => Err(RdtError::ForcedClose),
            _ => Err(RdtError::InvalidUse(
                "connection closed before the handshake completed",
            )),
        }
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

    /// Coordinated close.
    ///
    /// Drains every in-flight INFO (the handler keeps retransmitting and
    /// exits once nothing is pending), then performs the FIN exchange on
    /// this thread. If the retransmission ceiling fires during the drain
    /// the close completes uncoordinated and reports `ForcedClose`.
    pub fn close(&mut self) -> Result<()> {
        let state = Arc::clone(&self.state);
        self.register
            .wait_first_acked(self.cfg.stop_check_interval, move || state.get().is_terminal());

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
        tracing::debug!(pending = self.register.pending_count(), "closing, draining in-flight data");
        if let Some(handle) = self.handler.take() {
            let _ = handle.join();
        }
        match self.state.get() {
            ConnectionState::ForcedClosing => {
                self.register.stop();
                let _ = self.stream.close();
                return Err(RdtError::ForcedClose);
            }
            ConnectionState::Disconnected => {
                // The link died under the handler; nothing to coordinate.
                let _ = self.stream.close();
                return Ok(());
            }
            _ => {}
        }

        let stream = Arc::clone(&self.stream);
        let register = Arc::clone(&self.register);
        let provider = Arc::clone(&self.provider);
        let retransmit = Arc::clone(&self.retransmit);
        let assembler = Arc::clone(&self.assembler);
        let mut on_stray = move |p: Packet| match p {
            Packet::Info { seq, body } => {
                assembler.lock().received(seq, body);
                let _ = stream.send(&Packet::Ack { seq }.encode());
            }
            Packet::Ack { seq } => {
                if register.acknowledge(seq) {
                    provider.release(seq);
                }
                retransmit.lock().ack(seq);
            }
            _ => {}
        };
        let result = exchange_fin(&self.stream, &self.state, &self.cfg, &mut on_stray);
        self.register.stop();
        self.state.set(ConnectionState::Disconnected);
        let _ = self.stream.close();
        result
    }

    fn abort_workers(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handler.take() {
            let _ = handle.join();
        }
        self.retransmit.lock().clear();
        let _ = self.stream.close();
    }
}

impl Drop for SrSocket {
    fn drop(&mut self) {
        // An abandoned socket lets its handler exit on the next poll tick;
        // only close() joins it.
        self.stop.store(true, Ordering::Release);
    }
}

struct Handler {
    stream: Arc<MuxStream>,
    state: Arc<StateCell>,
    cfg: Config,
    provider: Arc<SequenceProvider>,
    register: Arc<AckRegister>,
    retransmit: Arc<Mutex<RetransmitQueue>>,
    assembler: Arc<Mutex<Assembler>>,
    stop: Arc<AtomicBool>,
}

impl Handler {
    fn run(self) {
        tracing::debug!("packet handler started");
        self.stream.set_blocking(true);
        self.stream.set_timeout(Some(self.cfg.stop_check_interval));
        loop {
            self.pump_retransmits();
            if self.should_exit() {
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

    /// The handler lives until the socket is torn down, or until a close
    /// is underway and nothing is left to drain -- at that point the
    /// closing thread takes over the stream for the FIN exchange.
    fn should_exit(&self) -> bool {
        if self.stop.load(Ordering::Acquire) {
            return true;
        }
        match self.state.get() {
            ConnectionState::Disconnected | ConnectionState::ForcedClosing => true,
            ConnectionState::SendingFin | ConnectionState::Disconnecting => {
                !self.register.have_pending()
            }
            _ => false,
        }
    }

    fn pump_retransmits(&self) {
        let (resend, given_up) = self.retransmit.lock().poll_expired(Instant::now());
        for r in resend {
            tracing::warn!(seq = r.seq, attempt = r.attempt, "ACK overdue, retransmitting");
            if let Err(e) = self.stream.send(&r.datagram) {
                tracing::warn!(error = %e, seq = r.seq, "retransmission failed");
            }
        }
        if !given_up.is_empty() {
            self.force_close(&given_up);
        }
    }

    fn force_close(&self, given_up: &[GivenUp]) {
        if self.state.get() == ConnectionState::ForcedClosing {
            return;
        }
        tracing::error!(
            packets = given_up.len(),
            attempts = given_up[0].attempts,
            "retransmission ceiling exceeded, force-closing"
        );
        self.state.set(ConnectionState::ForcedClosing);
        let _ = self.stream.send(&Packet::Fin.encode());
        self.register.stop();
        self.retransmit.lock().clear();
    }

    fn dispatch(&self, packet: Packet) {
        let state = self.state.get();
        tracing::trace!(kind = packet.kind(), %state, "received packet");
        match packet {
            Packet::Connect => tracing::debug!("duplicate CONNECT, dropping"),
            Packet::Connack => tracing::debug!("duplicate CONNACK, dropping"),
            Packet::Info { seq, body } => self.on_info(state, seq, body),
            Packet::Ack { seq } => self.on_ack(state, seq),
            Packet::Fin => self.on_fin(state),
            Packet::Finack => tracing::warn!("FINACK with no FIN in flight, dropping"),
        }
    }

    fn on_info(&self, state: ConnectionState, seq: u32, body: Bytes) {
        if state == ConnectionState::NotConnected {
            tracing::error!("INFO while not connected, disconnecting");
            self.state.set(ConnectionState::Disconnected);
            return;
        }
        self.assembler.lock().received(seq, body);
        if let Err(e) = self.stream.send(&Packet::Ack { seq }.encode()) {
            tracing::warn!(error = %e, seq, "failed to send ACK");
        }
    }

    fn on_ack(&self, state: ConnectionState, seq: u32) {
        // Transition before acknowledging: a sender woken by the first
        // ACK must already observe Connected.
        if state == ConnectionState::Connecting {
            self.state.set(ConnectionState::Connected);
        }
        if self.register.acknowledge(seq) {
            self.provider.release(seq);
        } else {
            tracing::trace!(seq, "duplicate ACK, ignoring");
        }
        self.retransmit.lock().ack(seq);
    }

    fn on_fin(&self, state: ConnectionState) {
        if let Err(e) = self.stream.send(&Packet::Finack.encode()) {
            tracing::warn!(error = %e, "failed to send FINACK");
        }
        match state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                self.state.set(ConnectionState::FinRecv);
            }
            ConnectionState::SendingFin => {
                tracing::debug!("peer FIN during drain, simultaneous close");
                self.state.set(ConnectionState::Disconnecting);
            }
            ConnectionState::FinRecv | ConnectionState::Disconnecting => {
                tracing::debug!("repeated FIN, answered again");
            }
            other => tracing::debug!(state = %other, "FIN in unexpected state, answered"),
        }
    }
}
