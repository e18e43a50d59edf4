//! Crate-wide error taxonomy.
//!
//! Every fallible operation in this crate funnels into [`Error`]. Per-frame
//! recoverable conditions (framing resync, an unsolicited dropped packet)
//! are logged and swallowed by the component that sees them and never reach
//! this type; everything that aborts a caller-visible operation does.

use crate::transport::packet::CommandId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Delimiter/escape/CRC violation in the byte-stuffed frame layer.
    ///
    /// This variant is returned by the frame codec itself; callers above it
    /// generally never see it because the codec resynchronizes and simply
    /// emits no frame for the corrupted span.
    #[error("frame CRC or escape sequence violation")]
    Framing,

    /// A parsed TL or app packet had an internally inconsistent length or
    /// field.
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    /// A command ID outside the enumerated set in §6 was encountered.
    #[error("invalid command ID: {0:#06x}")]
    InvalidCommandId(u16),

    /// MAC or pairing-CRC mismatch.
    #[error("authentication failure")]
    AuthenticationFailure,

    /// The derived weak cipher failed to authenticate KEY_RESPONSE, i.e. the
    /// PIN the user entered does not match the pump's displayed PIN.
    #[error("wrong PIN")]
    WrongPin,

    /// TX nonce wrap, or a detected nonce reuse/regression on RX.
    #[error("nonce violation, pump must be re-paired")]
    NonceViolation,

    /// A reliable send did not receive its ACK after one retransmit.
    #[error("timeout waiting for ACK")]
    Timeout,

    /// An ERROR_RESPONSE packet from the pump.
    #[error("pump reported error code {0:#04x}")]
    PumpError(u8),

    /// The operation was cancelled by the caller or by cancellation
    /// propagation (e.g. a disconnect while a send was outstanding).
    #[error("operation cancelled")]
    Cancelled,

    /// The underlying byte-stream transport failed.
    #[error("transport I/O error: {0}")]
    TransportIo(#[from] std::io::Error),

    /// The pump is not in the state this operation requires (e.g. sending
    /// before `connect()` has completed, or activating two services at
    /// once).
    #[error("pump is not in the required state: {0}")]
    InvalidState(String),

    /// No persisted pairing data exists for the requested pump address.
    #[error("no pairing data for this pump")]
    NotPaired,

    /// A reliable-send queue is full and backpressure was requested.
    #[error("reliable send queue is full")]
    QueueFull,

    /// Received a well-formed packet of a command ID that is not valid in
    /// the caller's current context (e.g. an RT_DISPLAY payload while no
    /// one is listening for it, or a response to a command never sent).
    #[error("unexpected command: {0:?}")]
    UnexpectedCommand(CommandId),
}
