use rostovlink::LinkError;
use thiserror::Error;

/// All errors produced by the reliable-transport layer.
#[derive(Debug, Error)]
pub enum RdtError {
    #[error("timed out waiting for the peer")]
    Timeout,

    #[error("operation would block")]
    WouldBlock,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("unknown packet type: 0x{0:02x}")]
    UnknownPacketType(u8),

    #[error("end of stream: peer closed and the receive buffer is drained")]
    EndOfStream,

    #[error("connection was force-closed after exhausting retransmissions")]
    ForcedClose,

    #[error("invalid use: {0}")]
    InvalidUse(&'static str),

    #[error("link error: {0}")]
    Link(LinkError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LinkError> for RdtError {
    fn from(e: LinkError) -> Self {
        match e {
            LinkError::Timeout => RdtError::Timeout,
            LinkError::WouldBlock => RdtError::WouldBlock,
            LinkError::EndOfStream => RdtError::EndOfStream,
            other => RdtError::Link(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, RdtError>;
