//! Packetized mode-switch recovery.
//!
//! When an agreement flips the link between packetized and non-packetized
//! transfers, the target drops off the bus after the final message byte.
//! The in-flight command has to be selected again under the new mode, ahead
//! of everything else queued for that target.

use super::message::PendingMessage;
use super::rate::RateRecord;
use super::session::Command;
use crate::error::{NegotiationError, Result};
use crate::transport::{BusTransport, LinkController};

/// What happened after an agreement was put in force.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// No mode switch; the connection carries on
    Continued,
    /// The command was requeued at the head of its target queue
    Requeued,
}

/// Bounded bus-free wait plus head-of-queue requeue.
#[derive(Debug, Clone, Copy)]
pub struct ModeSwitchRecovery {
    bus_free_poll_limit: u32,
}

impl ModeSwitchRecovery {
    /// Create with a bus-free poll bound
    pub fn new(bus_free_poll_limit: u32) -> Self {
        Self {
            bus_free_poll_limit,
        }
    }

    /// Whether moving to `new_rate` changes the packetized mode.
    pub fn is_switch(previous_packetized: bool, new_rate: &RateRecord) -> bool {
        previous_packetized != new_rate.is_packetized()
    }

    /// Handle a freshly committed agreement.
    ///
    /// Without a mode switch nothing happens and `last` is left for the
    /// caller to acknowledge. Otherwise the final byte is acknowledged, the
    /// target must go bus free, and the command is requeued.
    pub fn on_agreement<B, L>(
        &self,
        bus: &mut B,
        link: &mut L,
        cmd: &mut Command,
        previous_packetized: bool,
        new_rate: &RateRecord,
        last: &mut PendingMessage,
    ) -> Result<RecoveryOutcome>
    where
        B: BusTransport + ?Sized,
        L: LinkController + ?Sized,
    {
        if !Self::is_switch(previous_packetized, new_rate) {
            return Ok(RecoveryOutcome::Continued);
        }

        tracing::warn!(
            "Target {} switching to {} transfers",
            cmd.target,
            if new_rate.is_packetized() {
                "packetized"
            } else {
                "non-packetized"
            }
        );
        if last.ack_needed {
            bus.acknowledge();
            last.ack_needed = false;
        }
        self.requeue_after_bus_free(bus, link, cmd)
    }

    /// Wait for bus free, then put the command back at the head of its queue.
    pub fn requeue_after_bus_free<B, L>(
        &self,
        bus: &mut B,
        link: &mut L,
        cmd: &mut Command,
    ) -> Result<RecoveryOutcome>
    where
        B: BusTransport + ?Sized,
        L: LinkController + ?Sized,
    {
        if !self.await_bus_free(bus) {
            return Err(NegotiationError::ModeSwitchTimeout { target: cmd.target });
        }
        cmd.reset_for_requeue();
        link.requeue_command_at_head(cmd.target, cmd.clone());
        tracing::debug!("Command {} requeued at head for target {}", cmd.id, cmd.target);
        Ok(RecoveryOutcome::Requeued)
    }

    /// Poll for bus free at most `bus_free_poll_limit` times.
    pub fn await_bus_free<B>(&self, bus: &mut B) -> bool
    where
        B: BusTransport + ?Sized,
    {
        (0..self.bus_free_poll_limit.max(1)).any(|_| bus.is_bus_free())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::rate::ProtocolOptions;
    use crate::protocol::session::Sequencing;
    use crate::transport::{BusError, Phase, RecordingLink};

    /// Bus that goes free after a fixed number of polls.
    struct SlowRelease {
        polls_until_free: u32,
        acks: u32,
    }

    impl BusTransport for SlowRelease {
        fn wait_for_request_phase(&mut self) -> std::result::Result<Phase, BusError> {
            Err(BusError::Timeout)
        }
        fn send_byte(&mut self, _byte: u8) -> std::result::Result<(), BusError> {
            Ok(())
        }
        fn receive_byte(&mut self) -> std::result::Result<u8, BusError> {
            Err(BusError::Timeout)
        }
        fn acknowledge(&mut self) {
            self.acks += 1;
        }
        fn assert_attention(&mut self) {}
        fn deassert_attention(&mut self) {}
        fn is_bus_free(&mut self) -> bool {
            if self.polls_until_free == 0 {
                return true;
            }
            self.polls_until_free -= 1;
            false
        }
    }

    fn packetized() -> RateRecord {
        RateRecord::sync(0x08, 0x7f, true).with_options(ProtocolOptions::from_bits(
            ProtocolOptions::PACKETIZED | ProtocolOptions::DUAL_EDGE,
        ))
    }

    #[test]
    fn test_no_switch_continues() {
        let mut bus = SlowRelease {
            polls_until_free: 0,
            acks: 0,
        };
        let mut link = RecordingLink::default();
        let mut cmd = Command::new(1, 3);
        let mut last = PendingMessage::received(vec![0x01]);

        let outcome = ModeSwitchRecovery::new(8)
            .on_agreement(&mut bus, &mut link, &mut cmd, true, &packetized(), &mut last)
            .unwrap();

        assert_eq!(outcome, RecoveryOutcome::Continued);
        assert!(last.ack_needed);
        assert_eq!(bus.acks, 0);
    }

    #[test]
    fn test_switch_requeues_after_bus_free() {
        let mut bus = SlowRelease {
            polls_until_free: 3,
            acks: 0,
        };
        let mut link = RecordingLink::default();
        let mut cmd = Command::new(1, 3);
        cmd.sequencing = Sequencing::Connected;
        let mut last = PendingMessage::received(vec![0x01]);

        let outcome = ModeSwitchRecovery::new(8)
            .on_agreement(&mut bus, &mut link, &mut cmd, false, &packetized(), &mut last)
            .unwrap();

        assert_eq!(outcome, RecoveryOutcome::Requeued);
        assert_eq!(bus.acks, 1);
        assert_eq!(cmd.sequencing, Sequencing::NotStarted);
        assert_eq!(link.requeued.len(), 1);
        assert_eq!(link.requeued[0].0, 3);
    }

    #[test]
    fn test_switch_without_bus_free_fails() {
        let mut bus = SlowRelease {
            polls_until_free: 100,
            acks: 0,
        };
        let mut link = RecordingLink::default();
        let mut cmd = Command::new(1, 3);
        let mut last = PendingMessage::received(vec![0x01]);

        let err = ModeSwitchRecovery::new(8)
            .on_agreement(&mut bus, &mut link, &mut cmd, false, &packetized(), &mut last)
            .unwrap_err();

        assert!(matches!(err, NegotiationError::ModeSwitchTimeout { target: 3 }));
        assert!(link.requeued.is_empty());
    }
}
