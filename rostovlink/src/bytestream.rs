//! Multi-producer / single-consumer byte-stream queue.
//!
//! Producers append opaque chunks; the consumer reads byte counts that do
//! not have to line up with chunk boundaries. A chunk larger than the
//! requested count is split and the tail kept as residual, so no producer
//! bytes are ever wasted. When every producer handle has been dropped and
//! the buffer is drained, reads report `EndOfStream`, which is distinct
//! from `Timeout`.

use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::error::{LinkError, Result};

/// Create a connected producer/consumer pair.
pub fn byte_stream() -> (ByteStreamTx, ByteStreamRx) {
    let (tx, rx) = unbounded();
    (
        ByteStreamTx { tx },
        ByteStreamRx {
            rx,
            residual: BytesMut::new(),
        },
    )
}

/// Producer handle. Clonable; the stream ends when all clones are dropped.
#[derive(Clone)]
pub struct ByteStreamTx {
    tx: Sender<Bytes>,
}

impl ByteStreamTx {
    /// Append a chunk. Returns `false` when the consumer is gone.
    /// Empty chunks are ignored so a read never observes zero bytes.
    pub fn put(&self, chunk: Bytes) -> bool {
        if chunk.is_empty() {
            return true;
        }
        self.tx.send(chunk).is_ok()
    }
}

/// Consumer handle with residual-byte buffering.
pub struct ByteStreamRx {
    rx: Receiver<Bytes>,
    residual: BytesMut,
}

impl ByteStreamRx {
    /// Read between 1 and `n` bytes.
    ///
    /// Blocks for the first byte according to `timeout` / `blocking`, then
    /// tops up opportunistically without blocking again. Errors:
    /// `Timeout` (nothing arrived in time), `WouldBlock` (non-blocking and
    /// empty), `EndOfStream` (producers dropped, buffer drained).
    pub fn get(&mut self, n: usize, timeout: Option<Duration>, blocking: bool) -> Result<Bytes> {
        if n == 0 {
            return Ok(Bytes::new());
        }
        if self.residual.is_empty() {
            let first = self.recv_first(timeout, blocking)?;
            self.residual.extend_from_slice(&first);
        }
        while self.residual.len() < n {
            match self.rx.try_recv() {
                Ok(chunk) => self.residual.extend_from_slice(&chunk),
                Err(_) => break,
            }
        }
        let take = n.min(self.residual.len());
        Ok(self.residual.split_to(take).freeze())
    }

    /// Read exactly `n` bytes or fail. On failure any bytes already read
    /// are pushed back, so nothing is lost to a timeout.
    pub fn get_exact(&mut self, n: usize, timeout: Option<Duration>, blocking: bool) -> Result<Bytes> {
        let mut out = BytesMut::with_capacity(n);
        while out.len() < n {
            match self.get(n - out.len(), timeout, blocking) {
                Ok(chunk) => out.extend_from_slice(&chunk),
                Err(e) => {
                    if !out.is_empty() {
                        self.unget(out.freeze());
                    }
                    return Err(e);
                }
            }
        }
        Ok(out.freeze())
    }

    /// Push bytes back to the front of the stream.
    pub fn unget(&mut self, bytes: Bytes) {
        if bytes.is_empty() {
            return;
        }
        let mut merged = BytesMut::with_capacity(bytes.len() + self.residual.len());
        merged.extend_from_slice(&bytes);
        merged.extend_from_slice(&self.residual);
        self.residual = merged;
    }

    /// True when neither the residual buffer nor the queue holds bytes.
    pub fn is_empty(&self) -> bool {
        self.residual.is_empty() && self.rx.is_empty()
    }

    fn recv_first(&self, timeout: Option<Duration>, blocking: bool) -> Result<Bytes> {
        if !blocking {
            return match self.rx.try_recv() {
                Ok(chunk) => Ok(chunk),
                Err(TryRecvError::Empty) => Err(LinkError::WouldBlock),
                Err(TryRecvError::Disconnected) => Err(LinkError::EndOfStream),
            };
        }
        match timeout {
            Some(t) => match self.rx.recv_timeout(t) {
                Ok(chunk) => Ok(chunk),
                Err(RecvTimeoutError::Timeout) => Err(LinkError::Timeout),
                Err(RecvTimeoutError::Disconnected) => Err(LinkError::EndOfStream),
            },
            None => self.rx.recv().map_err(|_| LinkError::EndOfStream),
        }
    }
}

impl std::fmt::Debug for ByteStreamRx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStreamRx")
            .field("residual", &self.residual.remaining())
            .field("queued_chunks", &self.rx.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_larger_than_request_is_split() {
        let (tx, mut rx) = byte_stream();
        tx.put(Bytes::from_static(b"abcdef"));

        let first = rx.get(4, None, true).unwrap();
        assert_eq!(&first[..], b"abcd");
        let rest = rx.get(4, None, true).unwrap();
        assert_eq!(&rest[..], b"ef");
    }

    #[test]
    fn get_spans_chunks() {
        let (tx, mut rx) = byte_stream();
        tx.put(Bytes::from_static(b"ab"));
        tx.put(Bytes::from_static(b"cd"));

        let out = rx.get(4, None, true).unwrap();
        assert_eq!(&out[..], b"abcd");
    }

    #[test]
    fn timeout_is_not_end_of_stream() {
        let (tx, mut rx) = byte_stream();
        match rx.get(1, Some(Duration::from_millis(10)), true) {
            Err(LinkError::Timeout) => {}
            other => panic!("expected Timeout, got {other:?}"),
        }

        drop(tx);
        match rx.get(1, Some(Duration::from_millis(10)), true) {
            Err(LinkError::EndOfStream) => {}
            other => panic!("expected EndOfStream, got {other:?}"),
        }
    }

    #[test]
    fn drains_buffered_chunks_after_producers_drop() {
        let (tx, mut rx) = byte_stream();
        tx.put(Bytes::from_static(b"last words"));
        drop(tx);

        let out = rx.get(10, None, true).unwrap();
        assert_eq!(&out[..], b"last words");
        assert!(matches!(rx.get(1, None, true), Err(LinkError::EndOfStream)));
    }

    #[test]
    fn nonblocking_would_block() {
        let (_tx, mut rx) = byte_stream();
        assert!(matches!(rx.get(1, None, false), Err(LinkError::WouldBlock)));
    }

    #[test]
    fn get_exact_restores_partial_read_on_timeout() {
        let (tx, mut rx) = byte_stream();
        tx.put(Bytes::from_static(b"abc"));

        match rx.get_exact(5, Some(Duration::from_millis(10)), true) {
            Err(LinkError::Timeout) => {}
            other => panic!("expected Timeout, got {other:?}"),
        }

        // The three bytes must still be readable.
        tx.put(Bytes::from_static(b"de"));
        let out = rx.get_exact(5, None, true).unwrap();
        assert_eq!(&out[..], b"abcde");
    }

    #[test]
    fn multiple_producers() {
        let (tx, mut rx) = byte_stream();
        let tx2 = tx.clone();

        let h = std::thread::spawn(move || {
            tx2.put(Bytes::from_static(b"from-thread"));
        });
        h.join().unwrap();
        tx.put(Bytes::from_static(b"-and-main"));

        let out = rx.get_exact(20, None, true).unwrap();
        assert_eq!(&out[..], b"from-thread-and-main");
    }

    #[test]
    fn empty_chunks_are_ignored() {
        let (tx, mut rx) = byte_stream();
        tx.put(Bytes::new());
        assert!(rx.is_empty());
        assert!(matches!(
            rx.get(1, Some(Duration::from_millis(10)), true),
            Err(LinkError::Timeout)
        ));
    }
}
