//! # spi-nego - SCSI Parallel Interface transfer negotiation
//!
//! Initiator-side negotiation engine for a parallel SCSI host adapter:
//! decides, per target, the bus width, transfer period, REQ/ACK offset and
//! protocol options, and recovers when an agreement switches the link into
//! or out of packetized mode.
//!
//! ## Features
//!
//! - **PPR with legacy fallback**: Ultra320 options in one exchange, WDTR/SDTR
//!   when the target rejects PPR
//! - **Conservative agreement**: the result never exceeds either side
//! - **Target-initiated exchanges**: responses staged for the next
//!   message-out phase
//! - **Mode-switch recovery**: bounded bus-free wait and head-of-queue requeue
//! - **Simulated target**: byte-level target model for tests and the CLI
//!
//! ## Protocol Overview
//!
//! ### Architecture
//!
//! ```text
//!  Config ──> Adapter ──> CapabilityTable (16 x DeviceCapability)
//!                │
//!                │ per connection
//!                v
//!           Negotiator ──> codec (WDTR/SDTR/PPR)
//!            │      │ ──> agreement (propose/reconcile)
//!            │      └───> ModeSwitchRecovery
//!            v
//!   BusTransport + LinkController
//! ```
//!
//! ### State Machine
//!
//! ```text
//!                  negotiate()
//!   [NotNegotiating] ──────────> [InitiatePpr] ──reject──> [InitiateWide]
//!        ^    │                        │                        │
//!        │    │ target WDTR/SDTR/PPR   │ PPR                    │ WDTR
//!        │    v                        v                        v
//!        │  [Response*] ────────> agreement <──────────── [InitiateSync]
//!        │                             │
//!        └──────── commit, save ───────┘
//! ```
//!
//! ### Wire Formats
//!
//! | Message | Bytes                                       |
//! |---------|---------------------------------------------|
//! | WDTR    | `01 02 03 <width>`                          |
//! | SDTR    | `01 03 01 <period> <offset>`                |
//! | PPR     | `01 06 04 <period> 00 <offset> <width> <opts>` |
//! | Reject  | `07`                                        |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use spi_nego::{Adapter, Command, Config};
//! use spi_nego::transport::{RecordingLink, SimulatedTarget, TargetProfile};
//!
//! let mut adapter = Adapter::new(&Config::default())?;
//! let mut bus = SimulatedTarget::new(TargetProfile::new(rate));
//! let mut link = RecordingLink::default();
//!
//! let mut cmd = Command::new(1, 3).tagged();
//! let outcome = adapter.run_connection(&mut cmd, &mut bus, &mut link)?;
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Rate records, codec, agreement, state machine, recovery
//! - [`transport`]: Bus and link collaborator traits, simulated target
//! - [`adapter`]: Capability table ownership and per-connection driving
//! - [`config`]: Configuration management
//! - [`error`]: Error types and result aliases

pub mod adapter;
pub mod config;
pub mod error;
pub mod protocol;
pub mod transport;

// Re-exports for convenience
pub use adapter::Adapter;
pub use config::Config;
pub use error::{NegotiationError, Result};
pub use protocol::{
    CapabilityTable, Command, ConnectionOutcome, DeviceCapability, NegotiationOutcome,
    NegotiationState, Negotiator, ProtocolOptions, RateRecord, Strategy,
};
pub use transport::{AbortReason, BusError, BusTransport, LinkController, Phase};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
