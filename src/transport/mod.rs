//! Collaborator traits between the negotiation engine and the adapter.
//!
//! The engine never touches signals or registers. It talks to two traits:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │           Negotiator (session)          │
//! └───────────┬───────────────────┬─────────┘
//!             │                   │
//!             ▼                   ▼
//! ┌─────────────────────┐ ┌─────────────────────┐
//! │    BusTransport     │ │   LinkController    │
//! │ REQ/ACK, ATN, phase │ │ rate regs, abort,   │
//! │                     │ │ execution queues    │
//! └─────────────────────┘ └─────────────────────┘
//! ```
//!
//! [`sim`] provides a simulated target and a recording link controller for
//! tests and the `simulate` CLI command.

pub mod sim;

pub use sim::{RecordingLink, SimulatedTarget, TargetProfile};

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::NegotiationError;
use crate::protocol::{Command, RateRecord};

/// Information transfer phase requested by the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    /// Data out
    DataOut,
    /// Data in
    DataIn,
    /// Command
    Command,
    /// Status
    Status,
    /// Message out
    MessageOut,
    /// Message in
    MessageIn,
}

impl Phase {
    /// Get descriptive name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::DataOut => "data-out",
            Self::DataIn => "data-in",
            Self::Command => "command",
            Self::Status => "status",
            Self::MessageOut => "message-out",
            Self::MessageIn => "message-in",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Bus-level failure reported by a transport.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    /// No REQ within the bounded wait
    #[error("timed out waiting for REQ")]
    Timeout,
    /// BSY dropped
    #[error("bus free")]
    BusFree,
    /// RST asserted
    #[error("bus reset")]
    Reset,
    /// Parity or CRC error on a received byte
    #[error("parity error")]
    Parity,
}

/// Why a connection was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AbortReason {
    /// No response within the bounded wait
    Timeout,
    /// Wrong phase, unexpected bus free or reset
    BadSequence,
    /// Parity error on a retransmitted message
    ParityRecurred,
    /// No bus free after a packetized mode switch
    ModeSwitchTimeout,
    /// Identify or queue tag refused by the target
    MessageRejected,
}

impl From<&NegotiationError> for AbortReason {
    fn from(err: &NegotiationError) -> Self {
        match err {
            NegotiationError::Timeout => Self::Timeout,
            NegotiationError::ParityRecurred | NegotiationError::Parity => Self::ParityRecurred,
            NegotiationError::ModeSwitchTimeout { .. } => Self::ModeSwitchTimeout,
            NegotiationError::IdentifyRejected { .. }
            | NegotiationError::CriticalMessageRejected(_) => Self::MessageRejected,
            _ => Self::BadSequence,
        }
    }
}

/// Byte-level access to the SCSI bus during message phases.
///
/// Every wait is bounded by the implementation; a wait that expires
/// returns [`BusError::Timeout`].
pub trait BusTransport {
    /// Wait for the target to assert REQ and report the phase it wants.
    fn wait_for_request_phase(&mut self) -> Result<Phase, BusError>;

    /// Send one message-out byte, completing the REQ/ACK handshake.
    fn send_byte(&mut self, byte: u8) -> Result<(), BusError>;

    /// Read the message-in byte on the bus without acknowledging it.
    fn receive_byte(&mut self) -> Result<u8, BusError>;

    /// Acknowledge the byte last read by [`BusTransport::receive_byte`].
    fn acknowledge(&mut self);

    /// Assert ATN to request a message-out phase.
    fn assert_attention(&mut self);

    /// Release ATN, marking the next message-out byte as the last.
    fn deassert_attention(&mut self);

    /// Whether the target has released the bus.
    fn is_bus_free(&mut self) -> bool;
}

/// Adapter-side link and queue control.
pub trait LinkController {
    /// Load a target's transfer rate into the hardware.
    fn program_rate(&mut self, target: u8, rate: &RateRecord);

    /// Abort the current connection.
    fn abort_connection(&mut self, target: u8, reason: AbortReason);

    /// Put a command back at the head of its target's execution queue.
    fn requeue_command_at_head(&mut self, target: u8, command: Command);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abort_reason_mapping() {
        assert_eq!(
            AbortReason::from(&NegotiationError::Timeout),
            AbortReason::Timeout
        );
        assert_eq!(
            AbortReason::from(&NegotiationError::UnexpectedBusFree),
            AbortReason::BadSequence
        );
        assert_eq!(
            AbortReason::from(&NegotiationError::ModeSwitchTimeout { target: 2 }),
            AbortReason::ModeSwitchTimeout
        );
    }

    #[test]
    fn test_bus_error_converts() {
        assert!(matches!(
            NegotiationError::from(BusError::Parity),
            NegotiationError::Parity
        ));
        assert!(matches!(
            NegotiationError::from(BusError::BusFree),
            NegotiationError::UnexpectedBusFree
        ));
    }
}
