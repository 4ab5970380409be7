use thiserror::Error;

/// All errors produced by the rostovlink datagram layer.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("timed out waiting for data")]
    Timeout,

    #[error("operation would block")]
    WouldBlock,

    #[error("socket is closed")]
    Closed,

    #[error("end of stream: producers are gone and the buffer is drained")]
    EndOfStream,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LinkError>;
