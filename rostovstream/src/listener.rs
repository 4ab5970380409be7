//! Listener facade.
//!
//! Accepts new connections on one UDP port and hands each peer a reliable
//! socket running the configured algorithm. The heavy lifting -- demux,
//! backlog, send serialization -- lives in `rostovlink::MuxListener`;
//! this layer runs the per-connection handshake.

use std::net::SocketAddr;
use std::time::Duration;

use rostovlink::MuxListener;

use crate::config::Config;
use crate::error::Result;
use crate::socket::{RdtMethod, RdtSocket, SawSocket, SrSocket};

pub struct RdtListener {
    method: RdtMethod,
    cfg: Config,
    mux: MuxListener,
}

impl RdtListener {
    /// A listener with default configuration.
    pub fn new(method: RdtMethod) -> Self {
        Self::with_config(method, Config::default())
    }

    pub fn with_config(method: RdtMethod, cfg: Config) -> Self {
        let mux = MuxListener::new(cfg.loss_factor);
        Self { method, cfg, mux }
    }

    /// Bind the shared UDP endpoint.
    pub fn bind(&mut self, addr: SocketAddr) -> Result<()> {
        self.cfg.validate()?;
        self.mux.bind(addr)?;
        Ok(())
    }

    /// The bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.mux.local_addr()?)
    }

    /// Start demultiplexing with the given accept backlog.
    pub fn listen(&mut self, backlog: usize) -> Result<()> {
        self.mux.listen(backlog)?;
        Ok(())
    }

    /// Accept one peer and run the server side of the handshake,
    /// returning a connected socket.
    pub fn accept(&mut self) -> Result<RdtSocket> {
        let stream = self.mux.accept()?;
        tracing::debug!(peer = %stream.peer_addr(), "new peer, starting handshake");
        match self.method {
            RdtMethod::StopAndWait => {
                SawSocket::from_listener(stream, self.cfg.clone()).map(RdtSocket::StopAndWait)
            }
            RdtMethod::SelectiveRepeat => {
                SrSocket::from_listener(stream, self.cfg.clone()).map(RdtSocket::SelectiveRepeat)
            }
        }
    }

    /// Bound the time `accept` may wait for a new peer.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.mux.set_timeout(timeout);
    }

    pub fn set_blocking(&mut self, blocking: bool) {
        self.mux.set_blocking(blocking);
    }

    /// Stop the mux workers and close the port. Accepted sockets share
    /// this port, so close them before closing the listener.
    pub fn close(&mut self) {
        tracing::debug!("closing listener");
        self.mux.close();
    }
}
