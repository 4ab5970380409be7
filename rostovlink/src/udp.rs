//! Unreliable datagram endpoint.
//!
//! Wraps one UDP socket behind separate send and receive locks so that a
//! blocking receive never stalls concurrent senders. For tests, a loss
//! factor in `[0, 1]` drops outbound datagrams with that probability while
//! still reporting success, which is exactly what a lossy network does.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{LinkError, Result};

pub struct UnreliableSocket {
    socket: UdpSocket,
    send_lock: Mutex<()>,
    recv_lock: Mutex<()>,
    loss_factor: f64,
    blocking: AtomicBool,
    closed: AtomicBool,
}

impl UnreliableSocket {
    /// Bind a UDP socket on `addr` with the given outbound loss factor.
    pub fn bind(addr: SocketAddr, loss_factor: f64) -> Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        Ok(Self {
            socket,
            send_lock: Mutex::new(()),
            recv_lock: Mutex::new(()),
            loss_factor,
            blocking: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        })
    }

    /// The local address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Send one datagram to `addr`.
    ///
    /// With a non-zero loss factor the datagram may be dropped instead,
    /// in which case the call still reports the full length as sent.
    pub fn send_to(&self, data: &[u8], addr: SocketAddr) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LinkError::Closed);
        }
        let _guard = self.send_lock.lock();
        if self.loss_factor > 0.0 && rand::random::<f64>() < self.loss_factor {
            tracing::debug!(len = data.len(), %addr, "loss injection dropped datagram");
            return Ok(data.len());
        }
        Ok(self.socket.send_to(data, addr)?)
    }

    /// Receive one datagram into `buf`, returning its length and source.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LinkError::Closed);
        }
        let _guard = self.recv_lock.lock();
        match self.socket.recv_from(buf) {
            Ok(received) => Ok(received),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                if self.blocking.load(Ordering::Acquire) {
                    Err(LinkError::Timeout)
                } else {
                    Err(LinkError::WouldBlock)
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Bound the time a blocking `recv_from` may wait. `None` waits forever.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        // A zero timeout means non-blocking to the OS; route that through
        // set_blocking instead so the error mapping stays coherent.
        let timeout = match timeout {
            Some(t) if t.is_zero() => None,
            other => other,
        };
        self.socket.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Toggle blocking mode for `recv_from`.
    pub fn set_blocking(&self, blocking: bool) -> Result<()> {
        self.socket.set_nonblocking(!blocking)?;
        self.blocking.store(blocking, Ordering::Release);
        Ok(())
    }

    /// Mark the socket closed. Further operations fail with `Closed`;
    /// workers blocked in `recv_from` observe the flag on their next
    /// timeout tick.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn any_addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn loopback_roundtrip() {
        let a = UnreliableSocket::bind(any_addr(), 0.0).unwrap();
        let b = UnreliableSocket::bind(any_addr(), 0.0).unwrap();
        let b_addr = b.local_addr().unwrap();

        a.send_to(b"ping", b_addr).unwrap();

        let mut buf = [0u8; 64];
        let (len, from) = b.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[test]
    fn recv_times_out() {
        let sock = UnreliableSocket::bind(any_addr(), 0.0).unwrap();
        sock.set_timeout(Some(Duration::from_millis(20))).unwrap();

        let mut buf = [0u8; 64];
        match sock.recv_from(&mut buf) {
            Err(LinkError::Timeout) => {}
            other => panic!("expected Timeout, got {other:?}"),
        }
    }

    #[test]
    fn nonblocking_recv_would_block() {
        let sock = UnreliableSocket::bind(any_addr(), 0.0).unwrap();
        sock.set_blocking(false).unwrap();

        let mut buf = [0u8; 64];
        match sock.recv_from(&mut buf) {
            Err(LinkError::WouldBlock) => {}
            other => panic!("expected WouldBlock, got {other:?}"),
        }
    }

    #[test]
    fn full_loss_drops_everything() {
        let lossy = UnreliableSocket::bind(any_addr(), 1.0).unwrap();
        let peer = UnreliableSocket::bind(any_addr(), 0.0).unwrap();
        peer.set_timeout(Some(Duration::from_millis(50))).unwrap();

        // Reports success but nothing reaches the peer.
        let sent = lossy.send_to(b"ghost", peer.local_addr().unwrap()).unwrap();
        assert_eq!(sent, 5);

        let mut buf = [0u8; 64];
        assert!(matches!(peer.recv_from(&mut buf), Err(LinkError::Timeout)));
    }

    #[test]
    fn closed_socket_rejects_use() {
        let sock = UnreliableSocket::bind(any_addr(), 0.0).unwrap();
        sock.close();

        let mut buf = [0u8; 8];
        assert!(matches!(sock.recv_from(&mut buf), Err(LinkError::Closed)));
        assert!(matches!(
            sock.send_to(b"x", any_addr()),
            Err(LinkError::Closed)
        ));
    }
}
