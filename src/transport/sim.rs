//! Simulated SPI target and recording link controller.
//!
//! [`SimulatedTarget`] plays the target side of message phases byte by
//! byte: it collects message-out bytes until ATN drops, answers WDTR, SDTR
//! and PPR from its [`TargetProfile`], and can be told to reject, stay
//! silent, inject parity errors, start its own negotiation or drop out of
//! packetized mode by rejecting identify.

use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use super::{AbortReason, BusError, BusTransport, LinkController, Phase};
use crate::protocol::agreement::{reconcile, reconcile_sync, reconcile_wide};
use crate::protocol::message::{
    decode_message, encode_ppr, encode_sdtr, encode_wdtr, msg, ExtendedKind,
};
use crate::protocol::{Command, RateRecord};

/// How a simulated target behaves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetProfile {
    /// Fastest rate the target accepts
    pub max_rate: RateRecord,
    /// Answers PPR; otherwise rejects it
    pub supports_ppr: bool,
    /// Answers WDTR; otherwise rejects it
    pub supports_wdtr: bool,
    /// Answers SDTR; otherwise rejects it
    pub supports_sdtr: bool,
    /// Link currently runs packetized
    pub packetized: bool,
    /// Never raises REQ
    pub silent: bool,
    /// Messages whose first byte arrives with bad parity
    pub parity_errors: u32,
    /// Keep the bus after a packetized mode switch
    pub stay_connected_on_switch: bool,
    /// Reject identify, then renegotiate narrow async and go bus free
    pub reject_identify: bool,
    /// Period to put in every SDTR/PPR reply instead of the agreed one
    pub reply_period: Option<u8>,
    /// Messages the target sends before the initiator says anything
    pub initiate: Vec<Vec<u8>>,
}

impl Default for TargetProfile {
    fn default() -> Self {
        Self {
            max_rate: RateRecord::async_narrow(),
            supports_ppr: true,
            supports_wdtr: true,
            supports_sdtr: true,
            packetized: false,
            silent: false,
            parity_errors: 0,
            stay_connected_on_switch: false,
            reject_identify: false,
            reply_period: None,
            initiate: Vec::new(),
        }
    }
}

impl TargetProfile {
    /// Target that accepts up to `max_rate`
    pub fn new(max_rate: RateRecord) -> Self {
        Self {
            max_rate,
            ..Self::default()
        }
    }

    /// Rejects PPR
    pub fn legacy_only(mut self) -> Self {
        self.supports_ppr = false;
        self
    }

    /// Rejects WDTR
    pub fn rejecting_wdtr(mut self) -> Self {
        self.supports_wdtr = false;
        self
    }

    /// Rejects SDTR
    pub fn rejecting_sdtr(mut self) -> Self {
        self.supports_sdtr = false;
        self
    }

    /// Starts out packetized
    pub fn packetized(mut self) -> Self {
        self.packetized = true;
        self
    }

    /// Never responds
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    /// Corrupt the first byte of the next `count` messages
    pub fn with_parity_errors(mut self, count: u32) -> Self {
        self.parity_errors = count;
        self
    }

    /// Keep the bus after a mode switch
    pub fn staying_connected(mut self) -> Self {
        self.stay_connected_on_switch = true;
        self
    }

    /// Reject identify and renegotiate out of packetized mode
    pub fn rejecting_identify(mut self) -> Self {
        self.reject_identify = true;
        self
    }

    /// Force the period in replies
    pub fn with_reply_period(mut self, period: u8) -> Self {
        self.reply_period = Some(period);
        self
    }

    /// Send `message` before the initiator does
    pub fn initiating(mut self, message: &[u8]) -> Self {
        self.initiate.push(message.to_vec());
        self
    }
}

/// A target device answering message phases over [`BusTransport`].
#[derive(Debug, Clone)]
pub struct SimulatedTarget {
    profile: TargetProfile,
    /// `None` is bus free
    phase: Option<Phase>,
    attention: bool,
    inbound: Vec<u8>,
    outbound: VecDeque<u8>,
    last_sent: Vec<u8>,
    script: VecDeque<Vec<u8>>,
    awaiting_response: bool,
    identify_reject_pending: bool,
    release_after_message: bool,
    parity_pending: u32,
    agreed: RateRecord,
    packetized: bool,
    received: Vec<Vec<u8>>,
    sent: Vec<Vec<u8>>,
}

impl SimulatedTarget {
    /// Create a target that has just been selected.
    ///
    /// It starts in message-out, unless it rejects identify or opens with
    /// its own messages, in which case it starts in message-in.
    pub fn new(profile: TargetProfile) -> Self {
        let mut target = Self {
            phase: Some(Phase::MessageOut),
            attention: true,
            inbound: Vec::new(),
            outbound: VecDeque::new(),
            last_sent: Vec::new(),
            script: profile.initiate.iter().cloned().collect(),
            awaiting_response: false,
            identify_reject_pending: false,
            release_after_message: false,
            parity_pending: profile.parity_errors,
            agreed: RateRecord::async_narrow(),
            packetized: profile.packetized,
            received: Vec::new(),
            sent: Vec::new(),
            profile,
        };

        if target.profile.reject_identify {
            target.script.push_back(encode_wdtr(&RateRecord::async_narrow()).to_vec());
            let sync = target.profile.max_rate.single_transition();
            target.script.push_back(encode_sdtr(&sync).to_vec());
            target.identify_reject_pending = true;
            target.present(vec![msg::MESSAGE_REJECT]);
        } else if !target.script.is_empty() {
            target.advance();
        }
        // ATN is only held at selection when the initiator has a message
        target.attention = target.phase == Some(Phase::MessageOut);
        target
    }

    /// Messages the initiator sent, in order
    pub fn received(&self) -> &[Vec<u8>] {
        &self.received
    }

    /// Messages the target sent, including retransmissions
    pub fn sent(&self) -> &[Vec<u8>] {
        &self.sent
    }

    /// Rate the target believes is in force
    pub fn agreed(&self) -> RateRecord {
        self.agreed
    }

    /// Whether the target now runs packetized
    pub fn is_packetized(&self) -> bool {
        self.packetized
    }

    fn present(&mut self, message: Vec<u8>) {
        self.outbound = message.iter().copied().collect();
        self.last_sent = message.clone();
        self.sent.push(message);
        self.phase = Some(Phase::MessageIn);
    }

    /// Send the next scripted message, or finish the exchange.
    fn advance(&mut self) {
        if let Some(next) = self.script.pop_front() {
            self.awaiting_response = true;
            self.present(next);
        } else if self.profile.reject_identify || self.release_after_message {
            self.phase = None;
        } else {
            self.phase = Some(Phase::Command);
        }
    }

    fn reply_bytes(&self, mut bytes: Vec<u8>) -> Vec<u8> {
        if let Some(period) = self.profile.reply_period {
            bytes[3] = period;
        }
        bytes
    }

    fn handle_message(&mut self, message: Vec<u8>) {
        match message.as_slice() {
            [msg::NO_OPERATION] => self.phase = Some(Phase::Command),
            [msg::MESSAGE_PARITY_ERROR] => {
                let again = self.last_sent.clone();
                self.present(again);
            },
            [msg::ABORT_TASK_SET] => self.phase = None,
            [msg::MESSAGE_REJECT] => {
                self.agreed = RateRecord::async_with_width(self.agreed.wide);
                self.awaiting_response = false;
                self.advance();
            },
            _ => match decode_message(&message) {
                Ok(decoded) if self.awaiting_response => {
                    self.awaiting_response = false;
                    self.agreed = match decoded.kind {
                        ExtendedKind::Sdtr => decoded.rate.with_wide(self.agreed.wide),
                        _ => decoded.rate,
                    };
                    if decoded.kind == ExtendedKind::Ppr
                        && decoded.rate.is_packetized() != self.packetized
                    {
                        self.packetized = decoded.rate.is_packetized();
                        if !self.profile.stay_connected_on_switch {
                            self.phase = None;
                            return;
                        }
                    }
                    self.advance();
                },
                Ok(decoded) => self.answer(decoded.kind, decoded.rate),
                Err(_) => self.present(vec![msg::MESSAGE_REJECT]),
            },
        }
    }

    fn answer(&mut self, kind: ExtendedKind, request: RateRecord) {
        let max = self.profile.max_rate;
        match kind {
            ExtendedKind::Wdtr if self.profile.supports_wdtr => {
                self.agreed = reconcile_wide(&max, &request);
                let reply = encode_wdtr(&self.agreed).to_vec();
                self.present(reply);
            },
            ExtendedKind::Sdtr if self.profile.supports_sdtr => {
                self.agreed = reconcile_sync(&max, &request, self.agreed.wide);
                let reply = self.reply_bytes(encode_sdtr(&self.agreed).to_vec());
                self.present(reply);
            },
            ExtendedKind::Ppr if self.profile.supports_ppr => {
                self.agreed = reconcile(&max, &request);
                if self.agreed.is_packetized() != self.packetized {
                    self.packetized = self.agreed.is_packetized();
                    self.release_after_message = !self.profile.stay_connected_on_switch;
                }
                let reply = self.reply_bytes(encode_ppr(&self.agreed, true).to_vec());
                self.present(reply);
            },
            _ => self.present(vec![msg::MESSAGE_REJECT]),
        }
    }

    fn after_message_in(&mut self) {
        if self.release_after_message {
            self.release_after_message = false;
            self.phase = None;
        } else if self.identify_reject_pending {
            self.identify_reject_pending = false;
            self.advance();
        } else {
            // Acknowledged without ATN: the initiator has nothing to say
            self.awaiting_response = false;
            self.advance();
        }
    }
}

impl BusTransport for SimulatedTarget {
    fn wait_for_request_phase(&mut self) -> Result<Phase, BusError> {
        if self.profile.silent {
            return Err(BusError::Timeout);
        }
        self.phase.ok_or(BusError::BusFree)
    }

    fn send_byte(&mut self, byte: u8) -> Result<(), BusError> {
        if self.profile.silent || self.phase != Some(Phase::MessageOut) {
            return Err(BusError::Timeout);
        }
        self.inbound.push(byte);
        if !self.attention {
            let message = std::mem::take(&mut self.inbound);
            self.received.push(message.clone());
            self.handle_message(message);
        }
        Ok(())
    }

    fn receive_byte(&mut self) -> Result<u8, BusError> {
        if self.profile.silent || self.phase != Some(Phase::MessageIn) {
            return Err(BusError::Timeout);
        }
        if self.parity_pending > 0 && self.outbound.len() == self.last_sent.len() {
            self.parity_pending -= 1;
            return Err(BusError::Parity);
        }
        self.outbound.front().copied().ok_or(BusError::Timeout)
    }

    fn acknowledge(&mut self) {
        if self.phase != Some(Phase::MessageIn) {
            return;
        }
        self.outbound.pop_front();
        if self.attention {
            self.outbound.clear();
            self.phase = Some(Phase::MessageOut);
        } else if self.outbound.is_empty() {
            self.after_message_in();
        }
    }

    fn assert_attention(&mut self) {
        self.attention = true;
    }

    fn deassert_attention(&mut self) {
        self.attention = false;
    }

    fn is_bus_free(&mut self) -> bool {
        self.phase.is_none()
    }
}

/// Link controller that records every call and keeps per-target queues.
#[derive(Debug, Clone, Default)]
pub struct RecordingLink {
    /// Rates loaded, in order
    pub programmed: Vec<(u8, RateRecord)>,
    /// Aborted connections
    pub aborts: Vec<(u8, AbortReason)>,
    /// Commands put back at the head of a queue
    pub requeued: Vec<(u8, Command)>,
    queues: BTreeMap<u8, VecDeque<Command>>,
}

impl RecordingLink {
    /// Append a command to its target's queue
    pub fn enqueue(&mut self, command: Command) {
        self.queues
            .entry(command.target)
            .or_default()
            .push_back(command);
    }

    /// Take the next command for `target`
    pub fn next_command(&mut self, target: u8) -> Option<Command> {
        self.queues.get_mut(&target).and_then(VecDeque::pop_front)
    }

    /// Commands waiting for `target`
    pub fn queue_len(&self, target: u8) -> usize {
        self.queues.get(&target).map_or(0, VecDeque::len)
    }

    /// Last rate programmed for `target`
    pub fn last_programmed(&self, target: u8) -> Option<RateRecord> {
        self.programmed
            .iter()
            .rev()
            .find(|(t, _)| *t == target)
            .map(|(_, rate)| *rate)
    }
}

impl LinkController for RecordingLink {
    fn program_rate(&mut self, target: u8, rate: &RateRecord) {
        self.programmed.push((target, *rate));
    }

    fn abort_connection(&mut self, target: u8, reason: AbortReason) {
        self.aborts.push((target, reason));
    }

    fn requeue_command_at_head(&mut self, target: u8, command: Command) {
        self.requeued.push((target, command.clone()));
        self.queues.entry(target).or_default().push_front(command);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn send(target: &mut SimulatedTarget, bytes: &[u8]) {
        target.assert_attention();
        let (last, head) = bytes.split_last().unwrap();
        for b in head {
            target.send_byte(*b).unwrap();
        }
        target.deassert_attention();
        target.send_byte(*last).unwrap();
    }

    fn drain(target: &mut SimulatedTarget) -> Vec<u8> {
        let mut out = Vec::new();
        while target.wait_for_request_phase() == Ok(Phase::MessageIn) {
            out.push(target.receive_byte().unwrap());
            target.acknowledge();
        }
        out
    }

    #[test]
    fn test_answers_sdtr() {
        let mut target =
            SimulatedTarget::new(TargetProfile::new(RateRecord::sync(0x0c, 0x10, false)));
        send(&mut target, &hex!("01 03 01 0a 20"));
        assert_eq!(drain(&mut target), hex!("01 03 01 0c 10"));
        assert_eq!(target.wait_for_request_phase(), Ok(Phase::Command));
    }

    #[test]
    fn test_rejects_ppr_when_legacy_only() {
        let mut target = SimulatedTarget::new(TargetProfile::default().legacy_only());
        send(&mut target, &hex!("01 06 04 08 00 7f 01 07"));
        assert_eq!(drain(&mut target), vec![msg::MESSAGE_REJECT]);
    }

    #[test]
    fn test_silent_target_times_out() {
        let mut target = SimulatedTarget::new(TargetProfile::default().silent());
        assert_eq!(target.wait_for_request_phase(), Err(BusError::Timeout));
    }

    #[test]
    fn test_parity_error_then_retransmit() {
        let mut target = SimulatedTarget::new(
            TargetProfile::new(RateRecord::sync(0x0c, 0x10, false)).with_parity_errors(1),
        );
        send(&mut target, &hex!("01 03 01 0c 10"));
        assert_eq!(target.receive_byte(), Err(BusError::Parity));

        target.assert_attention();
        target.acknowledge();
        assert_eq!(target.wait_for_request_phase(), Ok(Phase::MessageOut));
        send(&mut target, &[msg::MESSAGE_PARITY_ERROR]);
        assert_eq!(drain(&mut target), hex!("01 03 01 0c 10"));
    }

    #[test]
    fn test_recording_link_requeues_at_head() {
        let mut link = RecordingLink::default();
        link.enqueue(Command::new(1, 2));
        link.requeue_command_at_head(2, Command::new(9, 2));
        assert_eq!(link.queue_len(2), 2);
        assert_eq!(link.next_command(2).map(|c| c.id), Some(9));
        assert_eq!(link.next_command(2).map(|c| c.id), Some(1));
        assert!(link.next_command(2).is_none());
    }
}
