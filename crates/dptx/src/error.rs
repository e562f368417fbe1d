use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for DPTX bring-up operations.
///
/// Transient AUX conditions (DEFER, the ACK-with-zero-bytes reset quirk) are
/// retried inside the transaction bus and never surface here. What does
/// surface is what a caller can act on: degrade the link, fall back from MST
/// to a single stream, or fail the bring-up and wait for the next hot-plug.
#[derive(Debug, Error)]
pub enum Error {
    /// The AUX engine produced no reply within the poll budget.
    #[error("AUX transaction timed out waiting for a reply")]
    BusTimeout,

    /// The sink replied NACK (or I2C NACK). A firm refusal; never retried.
    #[error("sink did not acknowledge the transaction")]
    NotAcknowledged,

    /// A sideband message failed to decode (bad header/body CRC, truncated
    /// or malformed fields).
    #[error("sideband message corrupt: {0}")]
    CrcMismatch(#[from] dptx_sideband::DecodeError),

    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// Every (rate, lane) combination in the fallback lattice failed.
    #[error("link training exhausted the rate/lane fallback lattice")]
    LinkTrainingExhausted,

    /// A LINK_ADDRESS sweep could not be completed or parsed.
    #[error("topology discovery incomplete: {0}")]
    TopologyIncomplete(&'static str),

    /// The allocation change trigger never self-cleared.
    #[error("ACT handshake timed out")]
    ActTimeout,

    /// The unplug latch fired while an operation was in flight.
    #[error("sink disconnected")]
    Disconnected,

    /// A controller-side busy/status bit never reached the expected state.
    #[error("hardware timeout: {0}")]
    HardwareTimeout(&'static str),

    /// Another bring-up attempt holds the training-in-progress token.
    #[error("link bring-up already in progress")]
    Busy,
}
