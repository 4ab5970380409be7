//! Sliding-window accounting.
//!
//! Sequence numbers live in a 2^32 space and wrap; every comparison in
//! this module goes through [`seq_gt`]. The window invariant
//! `window_size < 2^31` keeps the modular ordering unambiguous.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};

use rostovlink::ByteStreamTx;

/// Half the sequence space; the tie-breaking bound of the modular order.
const HALF_SEQ_SPACE: u32 = 1 << 31;

/// `a > b` in the modulo-2^32 ordering.
///
/// `a` is ahead of `b` when the wrapping distance from `b` to `a` is at
/// most half the sequence space. Equal numbers are not ahead of each
/// other.
pub fn seq_gt(a: u32, b: u32) -> bool {
    a != b && a.wrapping_sub(b) <= HALF_SEQ_SPACE
}

/// Blocking pool of free sequence numbers; the sender-side window.
///
/// Seeded with `[initial_seq, initial_seq + window)`; acknowledging a
/// sequence feeds `seq + window` back, so at most `window` distinct
/// sequences are ever in flight. `acquire` blocking is the sole
/// backpressure signal on the sender.
pub struct SequenceProvider {
    free_tx: Sender<u32>,
    free_rx: Receiver<u32>,
    window: u32,
}

impl SequenceProvider {
    pub fn new(initial_seq: u32, window: u32) -> Self {
        let (free_tx, free_rx) = unbounded();
        for offset in 0..window {
            free_tx
                .send(initial_seq.wrapping_add(offset))
                .expect("receiver held locally");
        }
        Self {
            free_tx,
            free_rx,
            window,
        }
    }

    /// Take the next free sequence number, waiting up to `timeout`.
    /// `None` means the window stayed full; callers poll their close flag
    /// and retry.
    pub fn acquire(&self, timeout: Duration) -> Option<u32> {
        match self.free_rx.recv_timeout(timeout) {
            Ok(seq) => Some(seq),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Slide the window past an acknowledged sequence.
    pub fn release(&self, seq: u32) {
        let _ = self.free_tx.send(seq.wrapping_add(self.window));
    }
}

/// Tracks which sent sequences still await acknowledgement, plus the
/// "first ACK" gate a connecting client waits on before the handshake is
/// considered confirmed.
pub struct AckRegister {
    inner: Mutex<RegisterInner>,
    changed: Condvar,
}

struct RegisterInner {
    unacked: HashSet<u32>,
    stopped: bool,
    first_seq: Option<u32>,
    first_acked: bool,
}

impl AckRegister {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegisterInner {
                unacked: HashSet::new(),
                stopped: false,
                first_seq: None,
                first_acked: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// Record a sequence as awaiting acknowledgement. Ignored (returning
    /// `false`) once the register is stopped.
    pub fn add_pending(&self, seq: u32) -> bool {
        let mut inner = self.inner.lock();
        if inner.stopped {
            tracing::warn!(seq, "register stopped, ignoring pending sequence");
            return false;
        }
        inner.unacked.insert(seq);
        true
    }

    /// Mark a sequence acknowledged. Returns `true` only the first time,
    /// so duplicate ACKs cannot slide the window twice.
    pub fn acknowledge(&self, seq: u32) -> bool {
        let mut inner = self.inner.lock();
        let was_pending = inner.unacked.remove(&seq);
        if inner.first_seq == Some(seq) && !inner.first_acked {
            tracing::debug!(seq, "handshake INFO acknowledged");
            inner.first_acked = true;
        }
        self.changed.notify_all();
        was_pending
    }

    pub fn have_pending(&self) -> bool {
        !self.inner.lock().unacked.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().unacked.len()
    }

    /// Stop accounting: future `add_pending` calls are ignored and every
    /// waiter is released. Used on forced close.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        inner.stopped = true;
        if !inner.unacked.is_empty() {
            tracing::warn!(
                pending = inner.unacked.len(),
                "clearing unacknowledged sequences on stop"
            );
            inner.unacked.clear();
        }
        self.changed.notify_all();
    }

    /// Arm the first-ACK gate for `seq` (the client's handshake INFO).
    pub fn expect_first(&self, seq: u32) {
        self.inner.lock().first_seq = Some(seq);
    }

    /// Block until the handshake INFO is acknowledged, polling `abort`
    /// every `poll` interval. Returns `false` when aborted or stopped
    /// before the ACK arrived.
    pub fn wait_first_acked(&self, poll: Duration, abort: impl Fn() -> bool) -> bool {
        let mut inner = self.inner.lock();
        loop {
            if inner.first_seq.is_none() || inner.first_acked {
                return true;
            }
            if inner.stopped || abort() {
                return false;
            }
            let _ = self.changed.wait_for(&mut inner, poll);
        }
    }
}

impl Default for AckRegister {
    fn default() -> Self {
        Self::new()
    }
}

/// Receive-side reorder buffer.
///
/// Buffers out-of-order INFO bodies and delivers contiguous runs, in
/// sequence order, to the upstream byte stream. The caller acknowledges
/// every accepted packet regardless of whether it was deliverable yet.
pub struct Assembler {
    last_delivered: u32,
    pending: HashMap<u32, Bytes>,
    upstream: ByteStreamTx,
}

impl Assembler {
    pub fn new(initial_seq: u32, upstream: ByteStreamTx) -> Self {
        Self {
            last_delivered: initial_seq.wrapping_sub(1),
            pending: HashMap::new(),
            upstream,
        }
    }

    /// Accept one INFO body.
    ///
    /// In-order packets flush the contiguous prefix upstream; packets
    /// ahead of the cursor are buffered; packets at or behind it are
    /// duplicates and ignored. Empty bodies advance the cursor without
    /// reaching the application.
    pub fn received(&mut self, seq: u32, body: Bytes) {
        if seq == self.last_delivered.wrapping_add(1) {
            self.pending.insert(seq, body);
            self.flush();
        } else if seq_gt(seq, self.last_delivered) {
            tracing::trace!(seq, expected = self.last_delivered.wrapping_add(1), "buffering out-of-order INFO");
            self.pending.insert(seq, body);
        } else {
            tracing::trace!(seq, "duplicate INFO, already delivered");
        }
    }

    fn flush(&mut self) {
        let mut next = self.last_delivered.wrapping_add(1);
        while let Some(body) = self.pending.remove(&next) {
            if !body.is_empty() {
                self.upstream.put(body);
            }
            self.last_delivered = next;
            next = next.wrapping_add(1);
        }
    }

    /// Sequences currently buffered ahead of the delivery cursor.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}
