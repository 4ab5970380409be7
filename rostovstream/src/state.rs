//! Connection lifecycle states shared by both reliability variants.
//!
//! The packet-handler worker dispatches on the current state; transitions
//! happen under the cell's write lock, reads under the read lock.

use std::fmt;

use parking_lot::RwLock;

/// Connection state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No handshake has happened yet.
    NotConnected,
    /// Handshake in progress (CONNECT seen / CONNACK awaited).
    Connecting,
    /// Established; data flows both ways.
    Connected,
    /// Local close() is draining in-flight data before sending FIN.
    SendingFin,
    /// Our FIN is out and acknowledged; lingering for the peer's FIN.
    FinSent,
    /// The peer sent FIN; we can still drain buffered data and must
    /// close ourselves to finish.
    FinRecv,
    /// Both sides are closing (simultaneous close).
    Disconnecting,
    /// Retransmission ceiling exceeded; tearing down without coordination.
    ForcedClosing,
    /// Fully closed; no workers, no timers, no socket handles.
    Disconnected,
}

impl ConnectionState {
    /// May the application submit new data in this state?
    pub fn can_send(self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// May the application read (buffered) data in this state?
    pub fn can_recv(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::FinRecv
        )
    }

    /// The peer has signalled it will send no more data.
    pub fn peer_closed(self) -> bool {
        matches!(
            self,
            ConnectionState::FinRecv | ConnectionState::Disconnecting
        )
    }

    /// Local close is underway or complete.
    pub fn is_closing(self) -> bool {
        matches!(
            self,
            ConnectionState::SendingFin
                | ConnectionState::FinSent
                | ConnectionState::Disconnecting
                | ConnectionState::ForcedClosing
                | ConnectionState::Disconnected
        )
    }

    /// Nothing further will happen on this connection.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::ForcedClosing
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::NotConnected => "NotConnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::SendingFin => "SendingFin",
            ConnectionState::FinSent => "FinSent",
            ConnectionState::FinRecv => "FinRecv",
            ConnectionState::Disconnecting => "Disconnecting",
            ConnectionState::ForcedClosing => "ForcedClosing",
            ConnectionState::Disconnected => "Disconnected",
        };
        write!(f, "{name}")
    }
}

/// Shared, lock-guarded state cell.
pub struct StateCell(RwLock<ConnectionState>);

impl StateCell {
    pub fn new() -> Self {
        Self(RwLock::new(ConnectionState::NotConnected))
    }

    pub fn get(&self) -> ConnectionState {
        *self.0.read()
    }

    pub fn set(&self, next: ConnectionState) {
        let mut state = self.0.write();
        tracing::trace!(from = %*state, to = %next, "state transition");
        *state = next;
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicates() {
        assert!(ConnectionState::Connected.can_send());
        assert!(!ConnectionState::FinRecv.can_send());
        assert!(ConnectionState::FinRecv.can_recv());
        assert!(ConnectionState::FinRecv.peer_closed());
        assert!(!ConnectionState::Connected.is_closing());
        assert!(ConnectionState::SendingFin.is_closing());
        assert!(ConnectionState::Disconnected.is_terminal());
        assert!(ConnectionState::ForcedClosing.is_terminal());
        assert!(!ConnectionState::SendingFin.is_terminal());
    }

    #[test]
    fn cell_roundtrip() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), ConnectionState::NotConnected);
        cell.set(ConnectionState::Connected);
        assert_eq!(cell.get(), ConnectionState::Connected);
    }
}
