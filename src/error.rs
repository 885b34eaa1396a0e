//! Unified error types for the bus protocol stack.
//!
//! A single `Error` enum that every subsystem converts into, keeping the
//! main loop's error handling uniform. All variants are `Copy` so they can
//! be passed through the reception FSM and TX engine without allocation.

use core::fmt;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Every fallible operation in the stack funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The shared ring allocator could not satisfy a request.
    Alloc(AllocError),
    /// The reception FSM rejected or dropped a frame.
    Rx(RxError),
    /// The transmission engine failed to deliver a message.
    Tx(TxError),
    /// Topology detection failed.
    Detection(DetectionError),
    /// A configuration precondition was violated (bad service id, bad topic).
    Config(ConfigError),
    /// A send was attempted while the network is down for a non-protocol command.
    Prohibited,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alloc(e) => write!(f, "alloc: {e}"),
            Self::Rx(e) => write!(f, "rx: {e}"),
            Self::Tx(e) => write!(f, "tx: {e}"),
            Self::Detection(e) => write!(f, "detection: {e}"),
            Self::Config(e) => write!(f, "config: {e}"),
            Self::Prohibited => write!(f, "transmission prohibited: network down"),
        }
    }
}

// ---------------------------------------------------------------------------
// Allocator errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No space could be freed without destroying an active TX task.
    Full,
    /// A reserved byte range overlapped a live task; the victim was evicted.
    RingOverlap { evicted_service: u16 },
    /// `pull_msg_to_interpret` called with no luos task queued.
    Empty,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "ring full, cannot stage TX task"),
            Self::RingOverlap { evicted_service } => {
                write!(f, "ring overlap, evicted service {evicted_service}")
            }
            Self::Empty => write!(f, "no task to pull"),
        }
    }
}

impl From<AllocError> for Error {
    fn from(e: AllocError) -> Self {
        Self::Alloc(e)
    }
}

// ---------------------------------------------------------------------------
// Reception errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxError {
    /// CRC over header+data(+timestamp) did not match the trailer.
    CrcMismatch,
    /// Frame size exceeds `MAX_DATA_MSG_SIZE`.
    Oversized,
    /// Frame timeout elapsed mid-frame; FSM reset to `Idle`.
    FrameTimeout,
}

impl fmt::Display for RxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CrcMismatch => write!(f, "CRC mismatch"),
            Self::Oversized => write!(f, "frame oversized"),
            Self::FrameTimeout => write!(f, "frame timeout"),
        }
    }
}

impl From<RxError> for Error {
    fn from(e: RxError) -> Self {
        Self::Rx(e)
    }
}

// ---------------------------------------------------------------------------
// Transmission errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxError {
    /// Echo byte did not match the byte written; line was lost to another sender.
    Collision,
    /// No ACK byte arrived before the ACK-wait timer elapsed.
    AckTimeout { target: u16 },
    /// The receiver replied with a NACK status bit set.
    Nacked { target: u16 },
    /// Retry budget (`NBR_RETRY`) exhausted; target is presumed dead.
    RetriesExhausted { target: u16 },
}

impl fmt::Display for TxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Collision => write!(f, "TX collision"),
            Self::AckTimeout { target } => write!(f, "ACK timeout, target {target}"),
            Self::Nacked { target } => write!(f, "NACK from target {target}"),
            Self::RetriesExhausted { target } => {
                write!(f, "retries exhausted, target {target} presumed dead")
            }
        }
    }
}

impl From<TxError> for Error {
    fn from(e: TxError) -> Self {
        Self::Tx(e)
    }
}

// ---------------------------------------------------------------------------
// Detection errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionError {
    /// The network-wide detection reset loop did not converge within its
    /// attempt budget while the allocator stayed non-empty.
    ResetFailed,
    /// The port walk exceeded `NETWORK_TIMEOUT` waiting for a branch reply.
    WalkTimedOut,
    /// Full detection was retried more than 4 times and still failed.
    RetriesExhausted,
    /// `END_DETECTION` did not arrive within `NETWORK_TIMEOUT` of `LOCAL_DETECTION`.
    NetworkTimeout,
}

impl fmt::Display for DetectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResetFailed => write!(f, "detection reset did not converge"),
            Self::WalkTimedOut => write!(f, "port walk timed out"),
            Self::RetriesExhausted => write!(f, "detection retries exhausted"),
            Self::NetworkTimeout => write!(f, "network timeout, reverting to NO_DETECTION"),
        }
    }
}

impl From<DetectionError> for Error {
    fn from(e: DetectionError) -> Self {
        Self::Detection(e)
    }
}

// ---------------------------------------------------------------------------
// Configuration / precondition errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// Service id base/count violates `1 <= base_id <= 4096 - MAX_SERVICE_NUMBER`.
    BadServiceId,
    /// Topic id exceeds `LAST_TOPIC`.
    BadTopic,
    /// No free service slot (`MAX_SERVICE_NUMBER` already created).
    ServiceTableFull,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadServiceId => write!(f, "service id out of range"),
            Self::BadTopic => write!(f, "topic id exceeds LAST_TOPIC"),
            Self::ServiceTableFull => write!(f, "service table full"),
        }
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
