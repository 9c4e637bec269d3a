//! Negotiation engine error types.
//!
//! # Error Classification
//!
//! - **Protocol rejections are not errors.** A target that rejects PPR, WDTR
//!   or SDTR simply drives the agreement toward a more conservative rate.
//! - **Sequencing errors abort the connection.** Phase mismatches, timeouts,
//!   unexpected bus free, recurring parity errors and mode-switch timeouts all
//!   end with [`crate::transport::LinkController::abort_connection`] and a
//!   protocol-error status on the command.
//! - **Input errors** (`InvalidMessage`, `InvalidTarget`, `Config`, `Json`,
//!   `Io`) come from the codec, configuration and CLI surfaces.

use thiserror::Error;

use crate::transport::{BusError, Phase};

/// Negotiation engine errors.
#[derive(Error, Debug)]
pub enum NegotiationError {
    /// The target did not raise REQ within the transport's bounded wait.
    #[error("Timed out waiting for the target to request a phase")]
    Timeout,

    /// The target switched to a phase other than the one the exchange needs.
    #[error("Phase mismatch: expected {expected}, target requested {actual}")]
    PhaseMismatch {
        /// Phase the state machine was waiting for.
        expected: Phase,
        /// Phase the target actually requested.
        actual: Phase,
    },

    /// The target released the bus in the middle of an exchange.
    #[error("Unexpected bus free")]
    UnexpectedBusFree,

    /// A bus reset was observed while negotiating.
    #[error("Bus reset during negotiation")]
    BusReset,

    /// A message byte arrived with bad parity.
    ///
    /// Handled internally by requesting retransmission once; only surfaces
    /// as [`NegotiationError::ParityRecurred`].
    #[error("Parity error on message byte")]
    Parity,

    /// A second parity error on the same message.
    #[error("Parity error recurred after retransmission request")]
    ParityRecurred,

    /// The target did not go bus free after a packetized mode switch.
    #[error("Target {target} did not release the bus after a mode switch")]
    ModeSwitchTimeout {
        /// Target ID.
        target: u8,
    },

    /// The target rejected the identify message and did not follow up with
    /// a negotiation message.
    #[error("Target {target} rejected identify")]
    IdentifyRejected {
        /// Target ID.
        target: u8,
    },

    /// The target rejected a message the connection cannot proceed without.
    #[error("Target rejected message 0x{0:02x}")]
    CriticalMessageRejected(u8),

    /// Message phases did not settle within the configured exchange limit.
    #[error("Message exchange limit ({0}) exceeded")]
    ExchangeLimit(usize),

    /// Malformed extended message.
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    /// Target ID outside the adapter's addressable range.
    #[error("Invalid target ID: {0}")]
    InvalidTarget(u8),

    /// Configuration error.
    #[error("Config error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for negotiation operations
pub type Result<T> = std::result::Result<T, NegotiationError>;

impl From<BusError> for NegotiationError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Timeout => NegotiationError::Timeout,
            BusError::BusFree => NegotiationError::UnexpectedBusFree,
            BusError::Reset => NegotiationError::BusReset,
            BusError::Parity => NegotiationError::Parity,
        }
    }
}

impl From<toml::de::Error> for NegotiationError {
    fn from(err: toml::de::Error) -> Self {
        NegotiationError::Config(format!("Failed to parse config: {err}"))
    }
}
