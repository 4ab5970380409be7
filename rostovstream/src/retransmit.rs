//! Retransmission timer queue.
//!
//! A BinaryHeap ordered by deadline, polled by the packet-handler thread
//! on its receive-timeout tick -- no thread or OS timer per in-flight
//! packet. Entries re-arm with a fixed period until acknowledged; an
//! entry that exceeds the attempt ceiling is reported as given up, which
//! force-closes the connection.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::time::{Duration, Instant};

use bytes::Bytes;

#[derive(Debug, Clone)]
struct Entry {
    seq: u32,
    datagram: Bytes,
    deadline: Instant,
    attempts: u32,
}

// BinaryHeap is a max-heap; reverse the ordering so the earliest deadline
// is popped first.
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.deadline.cmp(&self.deadline)
    }
}

/// A packet whose timer fired and which should go out again.
#[derive(Debug)]
pub struct Retransmit {
    pub seq: u32,
    pub datagram: Bytes,
    pub attempt: u32,
}

/// A packet that exhausted its attempt ceiling.
#[derive(Debug)]
pub struct GivenUp {
    pub seq: u32,
    pub attempts: u32,
}

pub struct RetransmitQueue {
    heap: BinaryHeap<Entry>,
    pending: HashSet<u32>,
    period: Duration,
    max_attempts: u32,
}

impl RetransmitQueue {
    pub fn new(period: Duration, max_attempts: u32) -> Self {
        Self {
            heap: BinaryHeap::new(),
            pending: HashSet::new(),
            period,
            max_attempts,
        }
    }

    /// Register a freshly transmitted packet.
    pub fn push(&mut self, seq: u32, datagram: Bytes, now: Instant) {
        self.pending.insert(seq);
        self.heap.push(Entry {
            seq,
            datagram,
            deadline: now + self.period,
            attempts: 0,
        });
    }

    /// Acknowledge a packet. Returns `true` if it was still pending. The
    /// heap entry stays behind and is skipped when its deadline fires.
    pub fn ack(&mut self, seq: u32) -> bool {
        self.pending.remove(&seq)
    }

    /// Pop every entry whose deadline has passed.
    ///
    /// Expired entries still below the ceiling are returned for
    /// retransmission and re-armed one period out; entries at the ceiling
    /// are returned as given up and dropped.
    pub fn poll_expired(&mut self, now: Instant) -> (Vec<Retransmit>, Vec<GivenUp>) {
        let mut retransmit = Vec::new();
        let mut given_up = Vec::new();

        while let Some(entry) = self.heap.peek() {
            if entry.deadline > now {
                break;
            }
            let entry = self.heap.pop().expect("peeked entry");

            if !self.pending.contains(&entry.seq) {
                continue; // acknowledged while queued
            }

            if entry.attempts >= self.max_attempts {
                self.pending.remove(&entry.seq);
                given_up.push(GivenUp {
                    seq: entry.seq,
                    attempts: entry.attempts,
                });
            } else {
                retransmit.push(Retransmit {
                    seq: entry.seq,
                    datagram: entry.datagram.clone(),
                    attempt: entry.attempts + 1,
                });
                self.heap.push(Entry {
                    seq: entry.seq,
                    datagram: entry.datagram,
                    deadline: now + self.period,
                    attempts: entry.attempts + 1,
                });
            }
        }

        (retransmit, given_up)
    }

    /// Number of packets still awaiting acknowledgement.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop all accounting; used on forced close.
    pub fn clear(&mut self) {
        self.heap.clear();
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_ack() {
        let mut queue = RetransmitQueue::new(Duration::from_millis(100), 3);
        queue.push(1, Bytes::from_static(b"hello"), Instant::now());
        assert_eq!(queue.pending_count(), 1);
        assert!(queue.ack(1));
        assert_eq!(queue.pending_count(), 0);
        assert!(!queue.ack(1));
    }

    #[test]
    fn poll_before_expiry_returns_nothing() {
        let mut queue = RetransmitQueue::new(Duration::from_secs(10), 3);
        let now = Instant::now();
        queue.push(1, Bytes::from_static(b"A"), now);

        let (retx, given) = queue.poll_expired(now);
        assert!(retx.is_empty());
        assert!(given.is_empty());
    }

    #[test]
    fn poll_after_expiry_returns_packet() {
        let mut queue = RetransmitQueue::new(Duration::from_millis(10), 3);
        let now = Instant::now();
        queue.push(1, Bytes::from_static(b"A"), now);

        let later = now + Duration::from_millis(50);
        let (retx, given) = queue.poll_expired(later);
        assert_eq!(retx.len(), 1);
        assert_eq!(retx[0].seq, 1);
        assert_eq!(retx[0].attempt, 1);
        assert!(given.is_empty());
    }

    #[test]
    fn acked_entry_is_skipped() {
        let mut queue = RetransmitQueue::new(Duration::from_millis(10), 3);
        let now = Instant::now();
        queue.push(1, Bytes::from_static(b"A"), now);
        queue.ack(1);

        let (retx, given) = queue.poll_expired(now + Duration::from_millis(50));
        assert!(retx.is_empty());
        assert!(given.is_empty());
    }

    #[test]
    fn fixed_period_then_give_up() {
        let mut queue = RetransmitQueue::new(Duration::from_millis(10), 2);
        let mut now = Instant::now();
        queue.push(1, Bytes::from_static(b"A"), now);

        // Attempt 1 and attempt 2 re-arm with the same period.
        for expected_attempt in 1..=2 {
            now += Duration::from_millis(15);
            let (retx, given) = queue.poll_expired(now);
            assert_eq!(retx.len(), 1);
            assert_eq!(retx[0].attempt, expected_attempt);
            assert!(given.is_empty());
        }

        // Third expiry hits the ceiling.
        now += Duration::from_millis(15);
        let (retx, given) = queue.poll_expired(now);
        assert!(retx.is_empty());
        assert_eq!(given.len(), 1);
        assert_eq!(given[0].seq, 1);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn earliest_deadline_pops_first() {
        let mut queue = RetransmitQueue::new(Duration::from_millis(10), 3);
        let now = Instant::now();
        queue.push(2, Bytes::from_static(b"B"), now + Duration::from_millis(5));
        queue.push(1, Bytes::from_static(b"A"), now);

        let (retx, _) = queue.poll_expired(now + Duration::from_millis(12));
        assert_eq!(retx[0].seq, 1);
        assert_eq!(retx[1].seq, 2);
    }
}
