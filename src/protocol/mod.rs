//! SPI transfer negotiation.
//!
//! Implements the initiator side of wide, synchronous and parallel protocol
//! negotiation (WDTR, SDTR and PPR) for a parallel SCSI adapter.
//!
//! # Protocol Overview
//!
//! Transfer agreements are per target. The initiator raises ATN during
//! selection and sends a negotiation message; the target answers with the
//! same message type, carrying values no more aggressive than the request.
//!
//! ## Message Flow
//!
//! ```text
//! Initiator                           Target
//!    |                                  |
//!    |-- IDENTIFY + PPR (ATN) --------->|  Propose width, period, offset,
//!    |                                  |  protocol options
//!    |<--------------------- PPR -------|  Agreement
//!    |               or MESSAGE REJECT  |  Fall back to WDTR/SDTR
//!    |                                  |
//!    |-- WDTR (ATN) ------------------->|  Legacy: width first
//!    |<-------------------- WDTR -------|
//!    |-- SDTR ------------------------->|  then period and offset
//!    |<-------------------- SDTR -------|
//!    |                                  |
//!    |   (packetized mode switch)       |  Target goes bus free; the
//!    |<==================== BUS FREE ===|  command is reselected
//! ```
//!
//! ## State Machine
//!
//! | State                   | Meaning                              | Left by                     |
//! |-------------------------|--------------------------------------|-----------------------------|
//! | `NotNegotiating`        | No exchange in progress              | initiate, target message    |
//! | `InitiatePpr`           | PPR sent                             | reply, reject, error        |
//! | `InitiateWide`          | WDTR sent                            | reply, reject, error        |
//! | `InitiateSync`          | SDTR sent                            | reply, reject, error        |
//! | `ResponseWide/Sync/Ppr` | Answering a target request           | next phase, reject          |
//! | `ResponseAfterReject`   | Renegotiating after identify reject  | bus free and requeue        |
//!
//! A response state lasts until the staged response goes out. The command
//! is back in `NotNegotiating` once the connection ends, whether it agreed,
//! fell back to a more conservative rate, or failed.
//!
//! ## Periods
//!
//! | Factor | Period  | Name        |
//! |--------|---------|-------------|
//! | `0x08` | 6.25 ns | Ultra320    |
//! | `0x09` | 12.5 ns | Ultra160    |
//! | `0x0A` | 25 ns   | Ultra2      |
//! | `0x0C` | 50 ns   | Fast-20     |
//! | `0x19` | 100 ns  | Fast-10     |
//! | `0x32` | 200 ns  | Fast-5      |
//!
//! # Usage
//!
//! ```rust,ignore
//! use spi_nego::protocol::{CapabilityTable, Command, DeviceCapability, Negotiator};
//!
//! let mut devices = CapabilityTable::new(DeviceCapability::new(hardware_max));
//! let mut cmd = Command::new(1, 3).tagged().with_negotiation();
//! let outcome = Negotiator::new(&mut bus, &mut link, &mut devices).run(&mut cmd)?;
//! ```

pub mod agreement;
pub mod capabilities;
pub mod message;
pub mod rate;
pub mod recovery;
pub mod session;

pub use agreement::{choose_strategy, propose, reconcile, reconcile_sync, reconcile_wide, Strategy};
pub use capabilities::{
    BusClass, CapabilityTable, DeviceCapability, PprSupport, RateClipper, StandardClipper,
    U160_OFFSET_LIMIT,
};
pub use message::{
    decode_extended, decode_message, encode_ppr, encode_sdtr, encode_wdtr, ExtendedKind,
    ExtendedMessage, PendingMessage,
};
pub use rate::{ProtocolOption, ProtocolOptions, RateRecord};
pub use recovery::{ModeSwitchRecovery, RecoveryOutcome};
pub use session::{
    Command, CommandStatus, ConnectionOutcome, NegotiationOutcome, NegotiationPolicy,
    NegotiationState, NegotiationStats, Negotiator, RejectPhase, Sequencing,
};

/// Period factor meaning asynchronous transfers
pub const ASYNC_PERIOD: u8 = 0x32;

/// Slowest synchronous period a reply may carry; anything above is async
pub const SYNC_CEILING: u8 = 0x32;

/// Slowest period at which dual-edge clocking is allowed
pub const MAX_DT_PERIOD: u8 = 0x19;

/// Fastest single-transition period
pub const ST_MIN_PERIOD: u8 = 0x0A;

/// Fastest period without packetized transfers
pub const NON_PACKETIZED_MIN_PERIOD: u8 = 0x09;

/// Paced transfers (and precompensation) run at or below this period
pub const PACED_PERIOD: u8 = 0x08;

/// Fastest period on a single-ended bus
pub const FAST20_PERIOD: u8 = 0x0C;

/// Targets addressable on a wide bus
pub const MAX_TARGETS: usize = 16;

/// Default `is_bus_free` polls before a mode switch times out
pub const DEFAULT_BUS_FREE_POLL_LIMIT: u32 = 4096;

/// Default message phases serviced per connection
pub const DEFAULT_MAX_MESSAGE_EXCHANGES: usize = 16;
