//! Negotiation state machine.
//!
//! A [`Negotiator`] drives the message phases of one connection. It borrows
//! the bus, the link controller and the capability table for as long as the
//! target stays connected, so only the connected target's record can change.
//!
//! The live [`NegotiationState`] belongs to the in-flight [`Command`]. A
//! target-initiated exchange leaves it in a response state, with the
//! response staged, until the next message-out phase. Once the connection
//! ends it is back at [`NegotiationState::NotNegotiating`], whatever the
//! outcome.

use serde::{Deserialize, Serialize};

use super::agreement::{choose_strategy, reconcile, reconcile_sync, reconcile_wide, Strategy};
use super::capabilities::{CapabilityTable, PprSupport};
use super::message::{
    decode_message, encode_ppr, encode_sdtr, encode_wdtr, msg, ExtendedKind, ExtendedMessage,
    PendingMessage,
};
use super::rate::RateRecord;
use super::recovery::{ModeSwitchRecovery, RecoveryOutcome};
use super::{DEFAULT_BUS_FREE_POLL_LIMIT, DEFAULT_MAX_MESSAGE_EXCHANGES};
use crate::error::{NegotiationError, Result};
use crate::transport::{AbortReason, BusError, BusTransport, LinkController, Phase};

/// Which response follows a rejected identify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectPhase {
    /// WDTR response
    Wide,
    /// SDTR response
    Sync,
}

/// Negotiation state of an in-flight command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationState {
    /// No exchange in progress
    #[default]
    NotNegotiating,
    /// WDTR sent, waiting for the target
    InitiateWide,
    /// SDTR sent, waiting for the target
    InitiateSync,
    /// PPR sent, waiting for the target
    InitiatePpr,
    /// Answering a target WDTR
    ResponseWide,
    /// Answering a target SDTR
    ResponseSync,
    /// Answering a target PPR
    ResponsePpr,
    /// Answering a renegotiation that followed a rejected identify
    ResponseAfterReject(RejectPhase),
}

impl NegotiationState {
    /// Whether we are answering a target-initiated exchange.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Self::ResponseWide
                | Self::ResponseSync
                | Self::ResponsePpr
                | Self::ResponseAfterReject(_)
        )
    }
}

/// Where a command is in its connection lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sequencing {
    /// Waiting in the execution queue
    #[default]
    NotStarted,
    /// Target selected, identify sent
    Connected,
    /// Finished with the bus
    Completed,
}

/// Completion status as seen by the negotiation engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    /// Still running
    #[default]
    Pending,
    /// Terminated because the connection failed
    ProtocolError,
}

/// Response staged for the next message-out phase.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StagedResponse {
    message: PendingMessage,
    rate: RateRecord,
    previous_packetized: bool,
}

/// A SCSI command as far as negotiation is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Caller-assigned identifier
    pub id: u64,
    /// Target ID
    pub target: u8,
    /// Logical unit
    pub lun: u8,
    /// Tag-queued command
    pub tagged: bool,
    /// Force a negotiation before this command runs
    pub needs_negotiation: bool,
    /// Live negotiation state
    pub nego_state: NegotiationState,
    /// Connection lifecycle
    pub sequencing: Sequencing,
    /// Completion status
    pub status: CommandStatus,
    /// Last message sent to the target on this connection
    pub last_message_out: Option<u8>,
    #[serde(skip)]
    staged: Option<StagedResponse>,
}

impl Command {
    /// Create an untagged command to `target`.
    pub fn new(id: u64, target: u8) -> Self {
        Self {
            id,
            target,
            lun: 0,
            tagged: false,
            needs_negotiation: false,
            nego_state: NegotiationState::NotNegotiating,
            sequencing: Sequencing::NotStarted,
            status: CommandStatus::Pending,
            last_message_out: None,
            staged: None,
        }
    }

    /// Mark as tag-queued
    pub fn tagged(mut self) -> Self {
        self.tagged = true;
        self
    }

    /// Set the logical unit
    pub fn with_lun(mut self, lun: u8) -> Self {
        self.lun = lun;
        self
    }

    /// Force a negotiation before the command runs
    pub fn with_negotiation(mut self) -> Self {
        self.needs_negotiation = true;
        self
    }

    /// Whether a response is waiting for the next message-out phase
    pub fn has_staged_response(&self) -> bool {
        self.staged.is_some()
    }

    /// Return to the not-started state for another selection.
    pub fn reset_for_requeue(&mut self) {
        self.sequencing = Sequencing::NotStarted;
        self.nego_state = NegotiationState::NotNegotiating;
        self.last_message_out = None;
        self.staged = None;
    }
}

/// Result of an initiator negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NegotiationOutcome {
    /// Exchange finished with this rate in force
    Agreed(RateRecord),
    /// Nothing to negotiate
    NotNeeded,
    /// The target answered with its own negotiation; the response is staged
    /// for the next message-out phase
    TargetInitiated,
    /// Mode switch; the command went back to the head of its queue
    Requeued,
}

/// How a connection left the message phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionOutcome {
    /// The target moved on to an information phase
    Proceed(Phase),
    /// A message the engine does not handle, left unacknowledged on the bus
    Message(u8),
    /// The command went back to the head of its queue
    Requeued,
}

/// Limits applied while driving a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiationPolicy {
    /// Polls of `is_bus_free` before a mode switch counts as failed
    pub bus_free_poll_limit: u32,
    /// Message phases serviced before the connection is aborted
    pub max_message_exchanges: usize,
}

impl Default for NegotiationPolicy {
    fn default() -> Self {
        Self {
            bus_free_poll_limit: DEFAULT_BUS_FREE_POLL_LIMIT,
            max_message_exchanges: DEFAULT_MAX_MESSAGE_EXCHANGES,
        }
    }
}

/// Negotiation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NegotiationStats {
    /// PPR messages sent
    pub ppr_sent: u64,
    /// WDTR messages sent
    pub wdtr_sent: u64,
    /// SDTR messages sent
    pub sdtr_sent: u64,
    /// Responses to target-initiated exchanges
    pub responses_sent: u64,
    /// Message rejects received
    pub rejects_received: u64,
    /// Message rejects sent
    pub rejects_sent: u64,
    /// Retransmissions requested after a parity error
    pub parity_retries: u64,
    /// Packetized mode switches
    pub mode_switches: u64,
    /// Connections aborted
    pub aborts: u64,
}

impl NegotiationStats {
    /// Add another set of counters
    pub fn merge(&mut self, other: &Self) {
        self.ppr_sent += other.ppr_sent;
        self.wdtr_sent += other.wdtr_sent;
        self.sdtr_sent += other.sdtr_sent;
        self.responses_sent += other.responses_sent;
        self.rejects_received += other.rejects_received;
        self.rejects_sent += other.rejects_sent;
        self.parity_retries += other.parity_retries;
        self.mode_switches += other.mode_switches;
        self.aborts += other.aborts;
    }
}

enum Step {
    Continue,
    Done(ConnectionOutcome),
}

/// Drives negotiation for one connection.
pub struct Negotiator<'a, B, L>
where
    B: BusTransport + ?Sized,
    L: LinkController + ?Sized,
{
    bus: &'a mut B,
    link: &'a mut L,
    devices: &'a mut CapabilityTable,
    policy: NegotiationPolicy,
    stats: NegotiationStats,
}

impl<'a, B, L> Negotiator<'a, B, L>
where
    B: BusTransport + ?Sized,
    L: LinkController + ?Sized,
{
    /// Create a negotiator over a connected bus
    pub fn new(bus: &'a mut B, link: &'a mut L, devices: &'a mut CapabilityTable) -> Self {
        Self {
            bus,
            link,
            devices,
            policy: NegotiationPolicy::default(),
            stats: NegotiationStats::default(),
        }
    }

    /// Set the policy
    pub fn with_policy(mut self, policy: NegotiationPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Counters for this connection
    pub fn stats(&self) -> NegotiationStats {
        self.stats
    }

    /// Run a connection's message phases after selection.
    ///
    /// Negotiates first if the command or its target asks for it, then
    /// services message-in and message-out phases until the target moves to
    /// an information phase, hands over a message the engine does not own,
    /// or the command is requeued.
    pub fn run(&mut self, cmd: &mut Command) -> Result<ConnectionOutcome> {
        if cmd.sequencing == Sequencing::NotStarted {
            cmd.sequencing = Sequencing::Connected;
            cmd.last_message_out = Some(msg::IDENTIFY | (cmd.lun & 0x07));
        }

        let device = self.devices.get(cmd.target)?;
        let wants = (cmd.needs_negotiation || device.needs_negotiation)
            && !device.suppress_negotiation;
        if wants && self.negotiate(cmd)? == NegotiationOutcome::Requeued {
            return Ok(ConnectionOutcome::Requeued);
        }

        for _ in 0..self.policy.max_message_exchanges {
            let phase = match self.bus.wait_for_request_phase() {
                Ok(phase) => phase,
                Err(e) => return Err(self.fail(cmd, e.into())),
            };
            let step = match phase {
                Phase::MessageIn => self.message_in(cmd),
                Phase::MessageOut => self.message_out(cmd),
                other => {
                    self.settle(cmd);
                    Ok(Step::Done(ConnectionOutcome::Proceed(other)))
                },
            };
            match step {
                Ok(Step::Continue) => {},
                Ok(Step::Done(outcome)) => return Ok(outcome),
                Err(e) => return Err(self.fail(cmd, e)),
            }
        }
        let limit = self.policy.max_message_exchanges;
        Err(self.fail(cmd, NegotiationError::ExchangeLimit(limit)))
    }

    /// Initiate a negotiation with the connected target.
    ///
    /// The bus must be in, or about to enter, message-out with ATN held
    /// from selection.
    pub fn negotiate(&mut self, cmd: &mut Command) -> Result<NegotiationOutcome> {
        match self.negotiate_inner(cmd) {
            Ok(outcome) => Ok(outcome),
            Err(e) => Err(self.fail(cmd, e)),
        }
    }

    fn negotiate_inner(&mut self, cmd: &mut Command) -> Result<NegotiationOutcome> {
        let target = cmd.target;
        let proposal = self.devices.get_negotiating_rate(target, cmd.tagged)?;
        let device = self.devices.get(target)?;
        let previous_packetized = device.current.is_packetized();
        let strategy = choose_strategy(device, &proposal);
        tracing::debug!(
            "Target {} negotiating {:?} with proposal {}",
            target,
            strategy,
            proposal
        );

        match strategy {
            Strategy::UsePpr => self.initiate_ppr(cmd, proposal, previous_packetized),
            Strategy::UseLegacy => self.initiate_legacy(cmd, proposal, None),
        }
    }

    fn initiate_ppr(
        &mut self,
        cmd: &mut Command,
        proposal: RateRecord,
        previous_packetized: bool,
    ) -> Result<NegotiationOutcome> {
        let target = cmd.target;
        // Until the target answers, the link runs async narrow
        self.commit(target, RateRecord::async_narrow())?;
        self.devices.get_mut(target)?.wide_agreed = false;

        cmd.nego_state = NegotiationState::InitiatePpr;
        self.stats.ppr_sent += 1;
        self.send_message(cmd, &encode_ppr(&proposal, cmd.tagged))?;
        self.expect_phase(Phase::MessageIn)?;
        let mut reply = self.read_message()?;

        if reply.is_reject() {
            self.stats.rejects_received += 1;
            tracing::info!("Target {} rejected PPR, falling back to WDTR/SDTR", target);
            self.devices.get_mut(target)?.ppr = PprSupport::Rejected;
            return self.initiate_legacy(cmd, proposal.single_transition(), Some(reply));
        }

        let message = match self.decode_reply(cmd, &mut reply)? {
            Some(message) => message,
            None => return self.finish(cmd),
        };
        if message.kind != ExtendedKind::Ppr {
            return self.answer_instead(cmd, message, &mut reply);
        }

        if message.beyond_ceiling {
            tracing::info!(
                "Target {} answered PPR slower than the synchronous ceiling, running async",
                target
            );
            self.reject_last(cmd, &mut reply)?;
            return self.finish(cmd);
        }

        let agreed = reconcile(&proposal, &message.rate);
        self.commit(target, agreed)?;
        {
            let dev = self.devices.get_mut(target)?;
            dev.ppr = PprSupport::Confirmed;
            dev.wide_agreed = true;
            dev.record_target_capability(message.rate);
        }
        tracing::info!("Target {} agreed via PPR: {}", target, agreed);

        self.settle_agreement(cmd)?;
        let recovery = ModeSwitchRecovery::new(self.policy.bus_free_poll_limit);
        match recovery.on_agreement(
            &mut *self.bus,
            &mut *self.link,
            cmd,
            previous_packetized,
            &agreed,
            &mut reply,
        )? {
            RecoveryOutcome::Requeued => {
                self.stats.mode_switches += 1;
                Ok(NegotiationOutcome::Requeued)
            },
            RecoveryOutcome::Continued => {
                self.acknowledge(&mut reply);
                Ok(NegotiationOutcome::Agreed(agreed))
            },
        }
    }

    fn initiate_legacy(
        &mut self,
        cmd: &mut Command,
        proposal: RateRecord,
        pending_reject: Option<PendingMessage>,
    ) -> Result<NegotiationOutcome> {
        let target = cmd.target;
        let device = self.devices.get(target)?;
        let current = device.current;
        let wide_outstanding =
            proposal.wide != current.wide || (proposal.wide && !device.wide_agreed);
        let sync_outstanding = proposal.offset != 0 || current.offset != 0;

        if let Some(mut reject) = pending_reject {
            if wide_outstanding || sync_outstanding {
                self.continue_with_message_out(&mut reject);
            } else {
                self.acknowledge(&mut reject);
            }
        }
        if !wide_outstanding && !sync_outstanding {
            self.settle_agreement(cmd)?;
            return Ok(NegotiationOutcome::NotNeeded);
        }

        if wide_outstanding {
            self.commit(target, RateRecord::async_narrow())?;
            self.devices.get_mut(target)?.wide_agreed = false;
            self.initiate_wide(cmd, proposal)
        } else {
            self.commit(target, RateRecord::async_with_width(current.wide))?;
            self.initiate_sync(cmd, proposal)
        }
    }

    fn initiate_wide(
        &mut self,
        cmd: &mut Command,
        proposal: RateRecord,
    ) -> Result<NegotiationOutcome> {
        let target = cmd.target;
        cmd.nego_state = NegotiationState::InitiateWide;
        self.stats.wdtr_sent += 1;
        self.send_message(cmd, &encode_wdtr(&proposal))?;
        self.expect_phase(Phase::MessageIn)?;
        let mut reply = self.read_message()?;

        if reply.is_reject() {
            self.stats.rejects_received += 1;
            tracing::info!("Target {} rejected WDTR, running narrow", target);
            self.devices.get_mut(target)?.drop_width();
            self.commit(target, RateRecord::async_narrow())?;
            if proposal.offset != 0 {
                self.continue_with_message_out(&mut reply);
                return self.initiate_sync(cmd, proposal.with_wide(false));
            }
            self.acknowledge(&mut reply);
            return self.finish(cmd);
        }

        let message = match self.decode_reply(cmd, &mut reply)? {
            Some(message) => message,
            None => return self.finish(cmd),
        };
        if message.kind != ExtendedKind::Wdtr {
            return self.answer_instead(cmd, message, &mut reply);
        }

        let agreed = reconcile_wide(&proposal, &message.rate);
        self.commit(target, agreed)?;
        {
            let dev = self.devices.get_mut(target)?;
            dev.wide_agreed = true;
            dev.record_target_capability(message.rate);
        }
        tracing::info!("Target {} agreed width: {}", target, agreed);

        if proposal.offset != 0 {
            self.continue_with_message_out(&mut reply);
            return self.initiate_sync(cmd, proposal.with_wide(agreed.wide));
        }
        self.acknowledge(&mut reply);
        self.finish(cmd)
    }

    fn initiate_sync(
        &mut self,
        cmd: &mut Command,
        proposal: RateRecord,
    ) -> Result<NegotiationOutcome> {
        let target = cmd.target;
        let proposal = proposal.single_transition();
        cmd.nego_state = NegotiationState::InitiateSync;
        self.stats.sdtr_sent += 1;
        self.send_message(cmd, &encode_sdtr(&proposal))?;
        self.expect_phase(Phase::MessageIn)?;
        let mut reply = self.read_message()?;
        let width = self.devices.get(target)?.current.wide;

        if reply.is_reject() {
            self.stats.rejects_received += 1;
            tracing::info!("Target {} rejected SDTR, running async", target);
            self.commit(target, RateRecord::async_with_width(width))?;
            self.acknowledge(&mut reply);
            return self.finish(cmd);
        }

        let message = match self.decode_reply(cmd, &mut reply)? {
            Some(message) => message,
            None => return self.finish(cmd),
        };
        if message.kind != ExtendedKind::Sdtr {
            return self.answer_instead(cmd, message, &mut reply);
        }

        if message.beyond_ceiling {
            tracing::info!(
                "Target {} answered SDTR slower than the synchronous ceiling, running async",
                target
            );
            self.commit(target, RateRecord::async_with_width(width))?;
            self.reject_last(cmd, &mut reply)?;
            return self.finish(cmd);
        }

        let agreed = reconcile_sync(&proposal, &message.rate, width);
        self.commit(target, agreed)?;
        self.devices
            .get_mut(target)?
            .record_target_capability(message.rate);
        tracing::info!("Target {} agreed via SDTR: {}", target, agreed);
        self.acknowledge(&mut reply);
        self.finish(cmd)
    }

    /// The target answered our request with a different negotiation
    /// message; treat it as its own request.
    fn answer_instead(
        &mut self,
        cmd: &mut Command,
        message: ExtendedMessage,
        reply: &mut PendingMessage,
    ) -> Result<NegotiationOutcome> {
        cmd.nego_state = NegotiationState::NotNegotiating;
        if message.kind.is_negotiation() {
            tracing::debug!(
                "Target {} answered with {}, responding to it",
                cmd.target,
                message.kind
            );
            self.respond_to_extended(cmd, message, reply)?;
            return Ok(NegotiationOutcome::TargetInitiated);
        }
        self.reject_last(cmd, reply)?;
        self.finish(cmd)
    }

    /// Decode a reply; malformed messages are rejected and yield `None`.
    fn decode_reply(
        &mut self,
        cmd: &mut Command,
        reply: &mut PendingMessage,
    ) -> Result<Option<ExtendedMessage>> {
        if !reply.is_extended() {
            return Err(NegotiationError::InvalidMessage(format!(
                "Expected an extended message, got 0x{:02x}",
                reply.code()
            )));
        }
        match decode_message(&reply.bytes) {
            Ok(message) => Ok(Some(message)),
            Err(NegotiationError::InvalidMessage(reason)) => {
                tracing::warn!("Target {} sent a malformed message: {}", cmd.target, reason);
                self.reject_last(cmd, reply)?;
                Ok(None)
            },
            Err(e) => Err(e),
        }
    }

    /// Stage the response to a target-initiated WDTR, SDTR or PPR.
    fn respond_to_extended(
        &mut self,
        cmd: &mut Command,
        message: ExtendedMessage,
        incoming: &mut PendingMessage,
    ) -> Result<()> {
        let target = cmd.target;
        let local = self.devices.get_negotiating_rate(target, cmd.tagged)?;
        let current = self.devices.get(target)?.current;
        let after_reject = matches!(cmd.nego_state, NegotiationState::ResponseAfterReject(_));

        let (bytes, rate, next) = match message.kind {
            ExtendedKind::Wdtr => {
                // A target dropping out of packetized mode always goes narrow
                let wide = !after_reject && local.wide && message.rate.wide;
                let rate = RateRecord::async_with_width(wide);
                let next = if after_reject {
                    NegotiationState::ResponseAfterReject(RejectPhase::Wide)
                } else {
                    NegotiationState::ResponseWide
                };
                (encode_wdtr(&rate).to_vec(), rate, next)
            },
            ExtendedKind::Sdtr => {
                let rate = if message.beyond_ceiling {
                    RateRecord::async_with_width(current.wide)
                } else {
                    reconcile_sync(&local, &message.rate, current.wide)
                };
                let next = if after_reject {
                    NegotiationState::ResponseAfterReject(RejectPhase::Sync)
                } else {
                    NegotiationState::ResponseSync
                };
                (encode_sdtr(&rate).to_vec(), rate, next)
            },
            ExtendedKind::Ppr => {
                let rate = if message.beyond_ceiling {
                    RateRecord::async_narrow()
                } else {
                    reconcile(&local, &message.rate)
                };
                (
                    encode_ppr(&rate, cmd.tagged).to_vec(),
                    rate,
                    NegotiationState::ResponsePpr,
                )
            },
            other => {
                tracing::debug!("Target {} sent {}, rejecting", target, other);
                return self.reject_last(cmd, incoming);
            },
        };

        if !message.beyond_ceiling {
            self.devices
                .get_mut(target)?
                .record_target_capability(message.rate);
        }
        tracing::debug!(
            "Target {} initiated {}, staging response {} ({:?})",
            target,
            message.kind,
            rate,
            next
        );
        cmd.staged = Some(StagedResponse {
            message: PendingMessage::outgoing(&bytes),
            rate,
            previous_packetized: current.is_packetized(),
        });
        cmd.nego_state = next;
        self.continue_with_message_out(incoming);
        Ok(())
    }

    fn message_in(&mut self, cmd: &mut Command) -> Result<Step> {
        let mut incoming = self.read_message()?;

        if incoming.is_extended() {
            match decode_message(&incoming.bytes) {
                Ok(message) => self.respond_to_extended(cmd, message, &mut incoming)?,
                Err(NegotiationError::InvalidMessage(reason)) => {
                    tracing::warn!("Target {} sent a malformed message: {}", cmd.target, reason);
                    self.reject_last(cmd, &mut incoming)?;
                },
                Err(e) => return Err(e),
            }
            return Ok(Step::Continue);
        }

        if incoming.is_reject() {
            self.stats.rejects_received += 1;
            return self.handle_reject(cmd, incoming);
        }

        self.settle(cmd);
        Ok(Step::Done(ConnectionOutcome::Message(incoming.code())))
    }

    fn handle_reject(&mut self, cmd: &mut Command, mut reject: PendingMessage) -> Result<Step> {
        let target = cmd.target;
        match cmd.nego_state {
            NegotiationState::ResponseWide
            | NegotiationState::ResponseSync
            | NegotiationState::ResponsePpr => {
                let width = if cmd.nego_state == NegotiationState::ResponseSync {
                    self.devices.get(target)?.current.wide
                } else {
                    false
                };
                tracing::info!(
                    "Target {} rejected our {:?}, falling back to async",
                    target,
                    cmd.nego_state
                );
                self.commit(target, RateRecord::async_with_width(width))?;
                self.acknowledge(&mut reject);
                cmd.staged = None;
                self.settle_agreement(cmd)?;
                Ok(Step::Continue)
            },
            _ => match cmd.last_message_out {
                Some(code) if msg::is_identify(code) => self.identify_rejected(cmd, reject),
                Some(code) if msg::is_queue_tag(code) => {
                    Err(NegotiationError::CriticalMessageRejected(code))
                },
                _ => {
                    self.acknowledge(&mut reject);
                    Ok(Step::Continue)
                },
            },
        }
    }

    /// The target refused our identify and is expected to renegotiate out of
    /// packetized mode with WDTR and SDTR.
    fn identify_rejected(&mut self, cmd: &mut Command, mut reject: PendingMessage) -> Result<Step> {
        let target = cmd.target;
        tracing::warn!("Target {} rejected identify, expecting renegotiation", target);
        self.bus.deassert_attention();
        self.acknowledge(&mut reject);
        cmd.last_message_out = None;

        match self.bus.wait_for_request_phase() {
            Ok(Phase::MessageIn) => {},
            Ok(_) | Err(BusError::BusFree) => {
                return Err(NegotiationError::IdentifyRejected { target })
            },
            Err(e) => return Err(e.into()),
        }

        let mut incoming = self.read_message()?;
        if incoming.is_extended() {
            if let Ok(message) = decode_message(&incoming.bytes) {
                if message.kind.is_negotiation() {
                    cmd.nego_state = NegotiationState::ResponseAfterReject(RejectPhase::Wide);
                    self.respond_to_extended(cmd, message, &mut incoming)?;
                    return Ok(Step::Continue);
                }
            }
        }
        Err(NegotiationError::IdentifyRejected { target })
    }

    fn message_out(&mut self, cmd: &mut Command) -> Result<Step> {
        let target = cmd.target;
        let staged = match cmd.staged.take() {
            Some(staged) => staged,
            None => {
                self.bus.deassert_attention();
                self.bus.send_byte(msg::NO_OPERATION)?;
                cmd.last_message_out = Some(msg::NO_OPERATION);
                return Ok(Step::Continue);
            },
        };

        self.stats.responses_sent += 1;
        self.send_message(cmd, &staged.message.bytes)?;
        self.commit(target, staged.rate)?;
        if matches!(
            cmd.nego_state,
            NegotiationState::ResponseWide
                | NegotiationState::ResponsePpr
                | NegotiationState::ResponseAfterReject(RejectPhase::Wide)
        ) {
            self.devices.get_mut(target)?.wide_agreed = true;
        }
        tracing::info!(
            "Target {} agreed ({:?}): {}",
            target,
            cmd.nego_state,
            staged.rate
        );

        let recovery = ModeSwitchRecovery::new(self.policy.bus_free_poll_limit);
        match cmd.nego_state {
            NegotiationState::ResponsePpr => {
                self.save_last(cmd)?;
                let mut sent = staged.message;
                match recovery.on_agreement(
                    &mut *self.bus,
                    &mut *self.link,
                    cmd,
                    staged.previous_packetized,
                    &staged.rate,
                    &mut sent,
                )? {
                    RecoveryOutcome::Requeued => {
                        self.stats.mode_switches += 1;
                        Ok(Step::Done(ConnectionOutcome::Requeued))
                    },
                    RecoveryOutcome::Continued => Ok(Step::Continue),
                }
            },
            NegotiationState::ResponseAfterReject(RejectPhase::Wide) => {
                self.save_last(cmd)?;
                if self.bus.is_bus_free() {
                    return self.requeue_after_reject(&recovery, cmd);
                }
                match self.bus.wait_for_request_phase() {
                    Ok(Phase::MessageIn) => Ok(Step::Continue),
                    Ok(actual) => Err(NegotiationError::PhaseMismatch {
                        expected: Phase::MessageIn,
                        actual,
                    }),
                    Err(BusError::BusFree) => self.requeue_after_reject(&recovery, cmd),
                    Err(e) => Err(e.into()),
                }
            },
            NegotiationState::ResponseAfterReject(RejectPhase::Sync) => {
                self.save_last(cmd)?;
                self.requeue_after_reject(&recovery, cmd)
            },
            _ => {
                self.save_last(cmd)?;
                Ok(Step::Continue)
            },
        }
    }

    fn requeue_after_reject(
        &mut self,
        recovery: &ModeSwitchRecovery,
        cmd: &mut Command,
    ) -> Result<Step> {
        recovery.requeue_after_bus_free(&mut *self.bus, &mut *self.link, cmd)?;
        self.stats.mode_switches += 1;
        Ok(Step::Done(ConnectionOutcome::Requeued))
    }

    /// Read one message, asking once for a retransmission on parity error.
    fn read_message(&mut self) -> Result<PendingMessage> {
        match self.read_message_once() {
            Err(NegotiationError::Parity) => {
                self.stats.parity_retries += 1;
                tracing::warn!("Parity error on message-in, requesting retransmission");
                self.request_retransmission()?;
                match self.read_message_once() {
                    Err(NegotiationError::Parity) => Err(NegotiationError::ParityRecurred),
                    other => other,
                }
            },
            other => other,
        }
    }

    fn read_message_once(&mut self) -> Result<PendingMessage> {
        let first = self.bus.receive_byte()?;
        if first != msg::EXTENDED {
            return Ok(PendingMessage::received(vec![first]));
        }

        self.bus.acknowledge();
        self.expect_phase(Phase::MessageIn)?;
        let len = self.bus.receive_byte()?;
        let mut bytes = Vec::with_capacity(len as usize + 2);
        bytes.push(first);
        bytes.push(len);
        if len == 0 {
            return Ok(PendingMessage::received(bytes));
        }

        self.bus.acknowledge();
        for i in 0..len {
            self.expect_phase(Phase::MessageIn)?;
            bytes.push(self.bus.receive_byte()?);
            if i + 1 < len {
                self.bus.acknowledge();
            }
        }
        tracing::debug!("Message in: {:02x?}", bytes);
        Ok(PendingMessage::received(bytes))
    }

    fn request_retransmission(&mut self) -> Result<()> {
        self.bus.assert_attention();
        self.bus.acknowledge();
        self.expect_phase(Phase::MessageOut)?;
        self.bus.deassert_attention();
        self.bus.send_byte(msg::MESSAGE_PARITY_ERROR)?;
        self.expect_phase(Phase::MessageIn)
    }

    fn send_message(&mut self, cmd: &mut Command, bytes: &[u8]) -> Result<()> {
        let (last, head) = bytes
            .split_last()
            .ok_or_else(|| NegotiationError::InvalidMessage("Empty message".to_string()))?;

        self.bus.assert_attention();
        self.expect_phase(Phase::MessageOut)?;
        for byte in head {
            self.bus.send_byte(*byte)?;
            self.expect_phase(Phase::MessageOut)?;
        }
        self.bus.deassert_attention();
        self.bus.send_byte(*last)?;
        cmd.last_message_out = Some(bytes[0]);
        tracing::debug!("Target {} message out: {:02x?}", cmd.target, bytes);
        Ok(())
    }

    fn expect_phase(&mut self, expected: Phase) -> Result<()> {
        let actual = self.bus.wait_for_request_phase()?;
        if actual != expected {
            return Err(NegotiationError::PhaseMismatch { expected, actual });
        }
        Ok(())
    }

    fn acknowledge(&mut self, message: &mut PendingMessage) {
        if message.ack_needed {
            self.bus.acknowledge();
            message.ack_needed = false;
        }
    }

    /// Raise ATN before releasing the last byte so the target goes to
    /// message-out next.
    fn continue_with_message_out(&mut self, message: &mut PendingMessage) {
        self.bus.assert_attention();
        self.acknowledge(message);
    }

    fn reject_last(&mut self, cmd: &mut Command, message: &mut PendingMessage) -> Result<()> {
        self.continue_with_message_out(message);
        self.expect_phase(Phase::MessageOut)?;
        self.bus.deassert_attention();
        self.bus.send_byte(msg::MESSAGE_REJECT)?;
        cmd.last_message_out = Some(msg::MESSAGE_REJECT);
        self.stats.rejects_sent += 1;
        Ok(())
    }

    fn commit(&mut self, target: u8, rate: RateRecord) -> Result<()> {
        self.devices.commit(target, rate, &mut *self.link)
    }

    fn save_last(&mut self, cmd: &mut Command) -> Result<()> {
        self.devices.save_as_last_negotiated(cmd.target)?;
        self.devices.get_mut(cmd.target)?.needs_negotiation = false;
        cmd.needs_negotiation = false;
        Ok(())
    }

    /// Record the agreement in force and leave the negotiating state.
    fn settle_agreement(&mut self, cmd: &mut Command) -> Result<()> {
        self.save_last(cmd)?;
        cmd.nego_state = NegotiationState::NotNegotiating;
        Ok(())
    }

    fn finish(&mut self, cmd: &mut Command) -> Result<NegotiationOutcome> {
        self.settle_agreement(cmd)?;
        let current = self.devices.get(cmd.target)?.current;
        Ok(NegotiationOutcome::Agreed(current))
    }

    /// Leave a response state once the target has moved on.
    fn settle(&mut self, cmd: &mut Command) {
        if cmd.staged.take().is_some() {
            tracing::debug!("Target {} never took the staged response", cmd.target);
        }
        cmd.nego_state = NegotiationState::NotNegotiating;
    }

    fn fail(&mut self, cmd: &mut Command, err: NegotiationError) -> NegotiationError {
        cmd.nego_state = NegotiationState::NotNegotiating;
        cmd.staged = None;
        cmd.status = CommandStatus::ProtocolError;
        if self.bus.is_bus_free() {
            tracing::warn!("Command {} to target {} failed: {}", cmd.id, cmd.target, err);
        } else {
            tracing::warn!("Aborting connection to target {}: {}", cmd.target, err);
            self.link
                .abort_connection(cmd.target, AbortReason::from(&err));
            self.stats.aborts += 1;
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::protocol::capabilities::DeviceCapability;
    use crate::protocol::rate::ProtocolOptions;
    use crate::transport::{RecordingLink, SimulatedTarget, TargetProfile};

    /// Target that answers whatever we send with a fixed message.
    struct ScriptedBus {
        phase: Phase,
        attention: bool,
        reply: VecDeque<u8>,
        sent: Vec<u8>,
    }

    impl ScriptedBus {
        fn answering(reply: &[u8]) -> Self {
            Self {
                phase: Phase::MessageOut,
                attention: true,
                reply: reply.iter().copied().collect(),
                sent: Vec::new(),
            }
        }
    }

    impl BusTransport for ScriptedBus {
        fn wait_for_request_phase(&mut self) -> std::result::Result<Phase, BusError> {
            Ok(self.phase)
        }

        fn send_byte(&mut self, byte: u8) -> std::result::Result<(), BusError> {
            if self.phase != Phase::MessageOut {
                return Err(BusError::Timeout);
            }
            self.sent.push(byte);
            if !self.attention {
                self.phase = if self.reply.is_empty() {
                    Phase::Command
                } else {
                    Phase::MessageIn
                };
            }
            Ok(())
        }

        fn receive_byte(&mut self) -> std::result::Result<u8, BusError> {
            if self.phase != Phase::MessageIn {
                return Err(BusError::Timeout);
            }
            self.reply.front().copied().ok_or(BusError::Timeout)
        }

        fn acknowledge(&mut self) {
            self.reply.pop_front();
            if self.reply.is_empty() {
                self.phase = if self.attention {
                    Phase::MessageOut
                } else {
                    Phase::Command
                };
            }
        }

        fn assert_attention(&mut self) {
            self.attention = true;
        }

        fn deassert_attention(&mut self) {
            self.attention = false;
        }

        fn is_bus_free(&mut self) -> bool {
            false
        }
    }

    fn ultra320() -> RateRecord {
        RateRecord::sync(0x08, 0x7f, true).with_options(ProtocolOptions::from_bits(
            ProtocolOptions::PACKETIZED | ProtocolOptions::DUAL_EDGE | ProtocolOptions::QUICK_ARB,
        ))
    }

    fn table() -> CapabilityTable {
        CapabilityTable::new(DeviceCapability::new(ultra320()))
    }

    #[test]
    fn test_ppr_agreement() {
        let mut devices = table();
        let mut bus = SimulatedTarget::new(TargetProfile::new(ultra320()));
        let mut link = RecordingLink::default();
        let mut cmd = Command::new(1, 0).tagged().with_negotiation();

        let outcome = Negotiator::new(&mut bus, &mut link, &mut devices)
            .negotiate(&mut cmd)
            .unwrap();

        // Packetized agreement from a non-packetized link is a mode switch
        assert_eq!(outcome, NegotiationOutcome::Requeued);
        assert_eq!(devices.get(0).unwrap().current, ultra320());
        assert_eq!(devices.get(0).unwrap().ppr, PprSupport::Confirmed);
        assert_eq!(cmd.nego_state, NegotiationState::NotNegotiating);
        assert_eq!(cmd.sequencing, Sequencing::NotStarted);
        assert_eq!(link.requeued.len(), 1);
    }

    #[test]
    fn test_untagged_ppr_agreement_continues() {
        let mut devices = table();
        let mut bus = SimulatedTarget::new(TargetProfile::new(ultra320()));
        let mut link = RecordingLink::default();
        let mut cmd = Command::new(1, 0).with_negotiation();

        let outcome = Negotiator::new(&mut bus, &mut link, &mut devices)
            .run(&mut cmd)
            .unwrap();

        assert_eq!(outcome, ConnectionOutcome::Proceed(Phase::Command));
        let current = devices.get(0).unwrap().current;
        assert!(!current.is_packetized());
        assert!(current.is_dual_edge());
        assert_eq!(current.period, 0x09);
        assert!(link.requeued.is_empty());
    }

    #[test]
    fn test_wdtr_answer_to_ppr_stays_staged_until_message_out() {
        let mut devices = table();
        devices.get_mut(0).unwrap().needs_negotiation = false;
        let mut bus = ScriptedBus::answering(&[0x01, 0x02, 0x03, 0x01]);
        let mut link = RecordingLink::default();
        let mut cmd = Command::new(1, 0);

        let mut negotiator = Negotiator::new(&mut bus, &mut link, &mut devices);
        let outcome = negotiator.negotiate(&mut cmd).unwrap();
        assert_eq!(outcome, NegotiationOutcome::TargetInitiated);
        assert_eq!(cmd.nego_state, NegotiationState::ResponseWide);
        assert!(cmd.has_staged_response());

        let outcome = negotiator.run(&mut cmd).unwrap();
        assert_eq!(outcome, ConnectionOutcome::Proceed(Phase::Command));
        assert_eq!(cmd.nego_state, NegotiationState::NotNegotiating);
        assert!(!cmd.has_staged_response());
        drop(negotiator);

        assert_eq!(&bus.sent[bus.sent.len() - 4..], &[0x01, 0x02, 0x03, 0x01]);
        assert_eq!(devices.get(0).unwrap().current, RateRecord::async_with_width(true));
    }

    #[test]
    fn test_timeout_aborts() {
        let mut devices = table();
        let mut bus = SimulatedTarget::new(TargetProfile::new(ultra320()).silent());
        let mut link = RecordingLink::default();
        let mut cmd = Command::new(7, 0).tagged().with_negotiation();

        let err = Negotiator::new(&mut bus, &mut link, &mut devices)
            .negotiate(&mut cmd)
            .unwrap_err();

        assert!(matches!(err, NegotiationError::Timeout));
        assert_eq!(cmd.status, CommandStatus::ProtocolError);
        assert_eq!(cmd.nego_state, NegotiationState::NotNegotiating);
        assert_eq!(link.aborts, vec![(0, AbortReason::Timeout)]);
        assert_eq!(devices.get(0).unwrap().current, RateRecord::async_narrow());
    }

    #[test]
    fn test_no_negotiation_sends_nop() {
        let mut devices = table();
        devices.get_mut(0).unwrap().needs_negotiation = false;
        let mut bus = SimulatedTarget::new(TargetProfile::new(ultra320()));
        let mut link = RecordingLink::default();
        let mut cmd = Command::new(1, 0);

        let outcome = Negotiator::new(&mut bus, &mut link, &mut devices)
            .run(&mut cmd)
            .unwrap();

        assert_eq!(outcome, ConnectionOutcome::Proceed(Phase::Command));
        assert_eq!(bus.received(), &[vec![msg::NO_OPERATION]]);
        assert!(link.programmed.is_empty());
    }

    #[test]
    fn test_stats_merge() {
        let mut total = NegotiationStats::default();
        let one = NegotiationStats {
            ppr_sent: 1,
            aborts: 2,
            ..Default::default()
        };
        total.merge(&one);
        total.merge(&one);
        assert_eq!(total.ppr_sent, 2);
        assert_eq!(total.aborts, 4);
    }
}
