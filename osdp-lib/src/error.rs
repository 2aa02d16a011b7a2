use thiserror::Error;

/// Errors surfaced by the public library API.
///
/// Wire-level conditions (bad CRC, sequence breaks, secure-channel
/// violations) never reach the caller as errors; they are answered with NAK
/// replies on the PD side or drive the per-PD state machine offline on the
/// CP side.
#[derive(Error, Debug)]
pub enum OsdpError {
    #[error("setup error: {0}")]
    Setup(String),

    #[error("PD index {0} out of range")]
    PdIndex(usize),

    #[error("command or event queue is full")]
    QueueFull,

    #[error("payload length {len} exceeds maximum {max}")]
    PayloadTooLong { len: usize, max: usize },

    #[error("secure channel required but not active")]
    SecureChannelRequired,

    #[error("secure channel: {0}")]
    SecureChannel(&'static str),

    #[error("frame does not fit in the transmit buffer")]
    PacketOverflow,

    #[error("channel I/O: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, OsdpError>;
