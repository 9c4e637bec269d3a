//! Host adapter façade.
//!
//! An [`Adapter`] owns the capability table for every target on its bus and
//! hands it to a [`Negotiator`] for each connection. Counters from every
//! connection accumulate here.

use crate::config::Config;
use crate::error::Result;
use crate::protocol::{
    choose_strategy, CapabilityTable, Command, ConnectionOutcome, NegotiationPolicy,
    NegotiationStats, Negotiator, PprSupport, RateRecord, Strategy,
};
use crate::transport::{BusTransport, LinkController};

/// One host adapter and the transfer agreements with its targets.
#[derive(Debug)]
pub struct Adapter {
    host_id: u8,
    devices: CapabilityTable,
    policy: NegotiationPolicy,
    stats: NegotiationStats,
}

impl Adapter {
    /// Build from configuration
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            host_id: config.adapter.host_id,
            devices: config.to_capability_table()?,
            policy: config.policy(),
            stats: NegotiationStats::default(),
        })
    }

    /// Build from an existing table
    pub fn with_table(host_id: u8, devices: CapabilityTable, policy: NegotiationPolicy) -> Self {
        Self {
            host_id,
            devices,
            policy,
            stats: NegotiationStats::default(),
        }
    }

    /// The adapter's own SCSI id
    pub fn host_id(&self) -> u8 {
        self.host_id
    }

    /// Capability records
    pub fn devices(&self) -> &CapabilityTable {
        &self.devices
    }

    /// Capability records, mutably
    pub fn devices_mut(&mut self) -> &mut CapabilityTable {
        &mut self.devices
    }

    /// Counters accumulated over every connection
    pub fn stats(&self) -> NegotiationStats {
        self.stats
    }

    /// Rate and message family the next negotiation with `target` would use.
    pub fn propose(&self, target: u8, tagged: bool) -> Result<(RateRecord, Strategy)> {
        let rate = self.devices.get_negotiating_rate(target, tagged)?;
        let strategy = choose_strategy(self.devices.get(target)?, &rate);
        Ok((rate, strategy))
    }

    /// Drive the message phases of one connection to `cmd.target`.
    pub fn run_connection<B, L>(
        &mut self,
        cmd: &mut Command,
        bus: &mut B,
        link: &mut L,
    ) -> Result<ConnectionOutcome>
    where
        B: BusTransport + ?Sized,
        L: LinkController + ?Sized,
    {
        let mut negotiator = Negotiator::new(bus, link, &mut self.devices).with_policy(self.policy);
        let result = negotiator.run(cmd);
        self.stats.merge(&negotiator.stats());
        match &result {
            Ok(outcome) => {
                tracing::debug!("Command {} to target {}: {:?}", cmd.id, cmd.target, outcome)
            },
            Err(e) => tracing::debug!("Command {} to target {} failed: {}", cmd.id, cmd.target, e),
        }
        result
    }

    /// Make the next command to `target` negotiate again.
    pub fn request_negotiation(&mut self, target: u8) -> Result<()> {
        let device = self.devices.get_mut(target)?;
        if !device.suppress_negotiation {
            device.needs_negotiation = true;
        }
        Ok(())
    }

    /// Forget every agreement after a bus reset.
    ///
    /// Targets fall back to async narrow, proposals return to the configured
    /// defaults, and PPR support is rediscovered.
    pub fn on_bus_reset<L>(&mut self, link: &mut L) -> Result<()>
    where
        L: LinkController + ?Sized,
    {
        tracing::info!("Bus reset, renegotiating with every target");
        for target in 0..self.devices.len() as u8 {
            if target == self.host_id {
                continue;
            }
            let device = self.devices.get_mut(target)?;
            device.negotiating = device.configured_default;
            device.last_negotiated = None;
            device.wide_agreed = false;
            device.needs_negotiation = !device.suppress_negotiation;
            if device.ppr != PprSupport::Disabled {
                device.ppr = PprSupport::Configured;
            }
            self.devices
                .commit(target, RateRecord::async_narrow(), &mut *link)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::NegotiationState;
    use crate::transport::{Phase, RecordingLink, SimulatedTarget, TargetProfile};

    #[test]
    fn test_propose_from_config() {
        let adapter = Adapter::new(&Config::default()).unwrap();
        let (rate, strategy) = adapter.propose(0, true).unwrap();
        assert!(rate.is_packetized());
        assert_eq!(rate.period, 0x08);
        assert_eq!(strategy, Strategy::UsePpr);

        let (rate, _) = adapter.propose(7, true).unwrap();
        assert_eq!(rate, RateRecord::async_narrow());
    }

    #[test]
    fn test_run_connection_accumulates_stats() {
        let mut adapter = Adapter::new(&Config::default()).unwrap();
        let mut link = RecordingLink::default();

        for id in 0..2 {
            let profile = TargetProfile::new(RateRecord::sync(0x0c, 0x10, false));
            let mut bus = SimulatedTarget::new(profile);
            let mut cmd = Command::new(id, 1);
            let outcome = adapter.run_connection(&mut cmd, &mut bus, &mut link).unwrap();
            assert_eq!(outcome, ConnectionOutcome::Proceed(Phase::Command));
            assert_eq!(cmd.nego_state, NegotiationState::NotNegotiating);
        }

        // Only the first connection negotiates
        let stats = adapter.stats();
        assert_eq!(stats.ppr_sent, 1);
        assert!(!adapter.devices().get(1).unwrap().needs_negotiation);
    }

    #[test]
    fn test_bus_reset_forgets_agreements() {
        let mut adapter = Adapter::new(&Config::default()).unwrap();
        let mut link = RecordingLink::default();
        {
            let device = adapter.devices_mut().get_mut(4).unwrap();
            device.current = RateRecord::sync(0x0a, 0x20, true);
            device.needs_negotiation = false;
            device.ppr = PprSupport::Rejected;
        }

        adapter.on_bus_reset(&mut link).unwrap();

        let device = adapter.devices().get(4).unwrap();
        assert_eq!(device.current, RateRecord::async_narrow());
        assert!(device.needs_negotiation);
        assert_eq!(device.ppr, PprSupport::Configured);
        assert_eq!(link.last_programmed(4), Some(RateRecord::async_narrow()));
        assert_eq!(link.last_programmed(7), None);
    }

    #[test]
    fn test_request_negotiation_skips_suppressed() {
        let mut adapter = Adapter::new(&Config::default()).unwrap();
        adapter.devices_mut().get_mut(2).unwrap().needs_negotiation = false;
        adapter.request_negotiation(2).unwrap();
        assert!(adapter.devices().get(2).unwrap().needs_negotiation);

        adapter.request_negotiation(7).unwrap();
        assert!(!adapter.devices().get(7).unwrap().needs_negotiation);
        assert!(adapter.request_negotiation(16).is_err());
    }
}
