//! Per-target capability model.
//!
//! Each target carries several [`RateRecord`]s: what the adapter hardware
//! can do, what the operator configured, what is being proposed, what is in
//! force, and what the last completed exchange produced. The negotiation
//! state machine is the only writer; the agreement algorithm reads.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::rate::{ProtocolOptions, RateRecord};
use super::{
    FAST20_PERIOD, MAX_DT_PERIOD, MAX_TARGETS, NON_PACKETIZED_MIN_PERIOD, PACED_PERIOD,
    ST_MIN_PERIOD,
};
use crate::error::{NegotiationError, Result};
use crate::transport::LinkController;

/// Electrical class of the path to a target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BusClass {
    /// Low-voltage differential, all Ultra320 features available
    #[default]
    Lvd,
    /// Single-ended segment, limited to Fast-20 single-transition
    SingleEnded,
    /// Behind an expander that cannot pass DT clocking
    Expander,
}

impl BusClass {
    /// Whether double-transition clocking can run on this class.
    pub fn supports_dual_edge(self) -> bool {
        matches!(self, Self::Lvd)
    }

    /// Fastest period this class can carry.
    pub fn period_floor(self) -> u8 {
        match self {
            Self::Lvd => 0,
            Self::SingleEnded | Self::Expander => FAST20_PERIOD,
        }
    }

    /// Get descriptive name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Lvd => "lvd",
            Self::SingleEnded => "single-ended",
            Self::Expander => "expander",
        }
    }
}

impl fmt::Display for BusClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for BusClass {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lvd" => Ok(Self::Lvd),
            "se" | "single-ended" => Ok(Self::SingleEnded),
            "expander" => Ok(Self::Expander),
            _ => Err(format!("Unknown bus class: {}", s)),
        }
    }
}

/// What we believe about a target's PPR support.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PprSupport {
    /// PPR is never attempted
    Disabled,
    /// Allowed by configuration, not yet tried
    #[default]
    Configured,
    /// Target answered a PPR
    Confirmed,
    /// Target rejected a PPR; legacy messages from now on
    Rejected,
}

impl PprSupport {
    /// Whether a PPR should be attempted.
    pub fn is_believed(self) -> bool {
        matches!(self, Self::Configured | Self::Confirmed)
    }
}

/// Transfer capability and agreement state of one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapability {
    /// What the adapter silicon can do
    pub hardware_max: RateRecord,
    /// Operator-configured ceiling for this target
    pub configured_default: RateRecord,
    /// Value about to be proposed; narrowed by rejections
    pub negotiating: RateRecord,
    /// Rate in force on the link
    pub current: RateRecord,
    /// Result of the last completed exchange
    pub last_negotiated: Option<RateRecord>,
    /// Most capable rate the target has echoed back
    pub target_capability: Option<RateRecord>,
    /// Never negotiate; run async narrow
    pub suppress_negotiation: bool,
    /// Electrical class of the path
    pub bus: BusClass,
    /// PPR belief
    pub ppr: PprSupport,
    /// Width in `current` came from a completed WDTR or PPR exchange
    pub wide_agreed: bool,
    /// Next command to this target must negotiate
    pub needs_negotiation: bool,
}

impl Default for DeviceCapability {
    fn default() -> Self {
        Self::new(RateRecord::async_narrow())
    }
}

impl DeviceCapability {
    /// Create with hardware limits; the configured default starts equal.
    pub fn new(hardware_max: RateRecord) -> Self {
        Self {
            hardware_max,
            configured_default: hardware_max,
            negotiating: hardware_max,
            current: RateRecord::async_narrow(),
            last_negotiated: None,
            target_capability: None,
            suppress_negotiation: false,
            bus: BusClass::Lvd,
            ppr: PprSupport::Configured,
            wide_agreed: false,
            needs_negotiation: true,
        }
    }

    /// Set the configured default
    pub fn with_configured_default(mut self, rate: RateRecord) -> Self {
        self.configured_default = rate;
        self
    }

    /// Set the bus class
    pub fn with_bus(mut self, bus: BusClass) -> Self {
        self.bus = bus;
        self
    }

    /// Set the PPR belief
    pub fn with_ppr(mut self, ppr: PprSupport) -> Self {
        self.ppr = ppr;
        self
    }

    /// Never negotiate with this target
    pub fn suppressed(mut self) -> Self {
        self.suppress_negotiation = true;
        self.needs_negotiation = false;
        self
    }

    /// Width was refused: stop proposing it and forget it was ever agreed.
    pub fn drop_width(&mut self) {
        self.negotiating.wide = false;
        self.negotiating = self.negotiating.normalized();
        if let Some(last) = self.last_negotiated.as_mut() {
            *last = last.with_wide(false).normalized();
        }
        self.wide_agreed = false;
    }

    /// Merge a rate the target echoed into `target_capability`.
    pub fn record_target_capability(&mut self, seen: RateRecord) {
        let merged = match self.target_capability {
            None => seen,
            Some(prev) => RateRecord {
                period: if seen.is_async() {
                    prev.period
                } else if prev.is_async() {
                    seen.period
                } else {
                    prev.period.min(seen.period)
                },
                offset: prev.offset.max(seen.offset),
                options: ProtocolOptions::from_bits(prev.options.bits() | seen.options.bits()),
                wide: prev.wide || seen.wide,
            },
        };
        self.target_capability = Some(merged);
    }
}

/// Revision- or device-specific clipping applied after the generic rules.
pub trait RateClipper: fmt::Debug + Send + Sync {
    /// Clip a proposed rate for `target`.
    fn clip(&self, target: u8, rate: RateRecord) -> RateRecord;
}

/// Default clipper.
#[derive(Debug, Clone, Default)]
pub struct StandardClipper {
    /// Some U160 devices misbehave with offsets of 0x80 and above at 0x09
    pub limit_u160_offset: bool,
}

/// Largest offset sent at the U160 period when limiting is on
pub const U160_OFFSET_LIMIT: u8 = 0x7f;

impl RateClipper for StandardClipper {
    fn clip(&self, _target: u8, mut rate: RateRecord) -> RateRecord {
        if self.limit_u160_offset
            && rate.period == NON_PACKETIZED_MIN_PERIOD
            && rate.offset > U160_OFFSET_LIMIT
        {
            rate.offset = U160_OFFSET_LIMIT;
        }
        rate
    }
}

/// Capability records for every target on the bus.
#[derive(Debug)]
pub struct CapabilityTable {
    devices: Vec<DeviceCapability>,
    clipper: Box<dyn RateClipper>,
}

impl CapabilityTable {
    /// Create a table with every target seeded from `template`.
    pub fn new(template: DeviceCapability) -> Self {
        Self {
            devices: vec![template; MAX_TARGETS],
            clipper: Box::new(StandardClipper::default()),
        }
    }

    /// Replace the rate clipper
    pub fn with_clipper(mut self, clipper: impl RateClipper + 'static) -> Self {
        self.clipper = Box::new(clipper);
        self
    }

    /// Number of addressable targets
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Always false; a table covers every target ID
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Get a target's record
    pub fn get(&self, target: u8) -> Result<&DeviceCapability> {
        self.devices
            .get(target as usize)
            .ok_or(NegotiationError::InvalidTarget(target))
    }

    /// Get a target's record mutably
    pub fn get_mut(&mut self, target: u8) -> Result<&mut DeviceCapability> {
        self.devices
            .get_mut(target as usize)
            .ok_or(NegotiationError::InvalidTarget(target))
    }

    /// Replace a target's record
    pub fn set(&mut self, target: u8, device: DeviceCapability) -> Result<()> {
        *self.get_mut(target)? = device;
        Ok(())
    }

    /// Iterate `(target, record)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (u8, &DeviceCapability)> {
        self.devices
            .iter()
            .enumerate()
            .map(|(id, dev)| (id as u8, dev))
    }

    /// Rate to propose to `target` for a command.
    ///
    /// Starts from the negotiating value clipped by the configured default
    /// and hardware maximum, then applies the target and command limits.
    pub fn get_negotiating_rate(&self, target: u8, tagged: bool) -> Result<RateRecord> {
        let dev = self.get(target)?;
        if dev.suppress_negotiation {
            return Ok(RateRecord::async_narrow());
        }

        let cfg = dev.configured_default;
        let hw = dev.hardware_max;
        let mut rate = dev.negotiating;
        rate.offset = rate.offset.min(cfg.offset).min(hw.offset);
        rate.period = rate.period.max(cfg.period).max(hw.period);
        rate.options = rate.options.intersect(cfg.options).intersect(hw.options);
        // No wide hardware means no wide proposal, whatever was configured
        rate.wide = rate.wide && cfg.wide && hw.wide;

        if !dev.bus.supports_dual_edge() {
            rate.options = ProtocolOptions::new();
            rate.period = rate.period.max(dev.bus.period_floor());
        }
        if !rate.wide || !rate.is_dual_edge() || rate.period > MAX_DT_PERIOD {
            rate.options = ProtocolOptions::new();
            rate.period = rate.period.max(ST_MIN_PERIOD);
        }
        if !tagged {
            rate.options
                .clear(ProtocolOptions::PACKETIZED | ProtocolOptions::PACKETIZED_ONLY);
        }
        if !rate.is_packetized() {
            rate.period = rate.period.max(NON_PACKETIZED_MIN_PERIOD);
        }
        if rate.period > PACED_PERIOD {
            rate.options
                .clear(ProtocolOptions::RETAIN_TRAINING | ProtocolOptions::PRECOMP);
        }

        let rate = self.clipper.clip(target, rate.normalized()).normalized();
        tracing::debug!("Target {} negotiating rate: {}", target, rate);
        Ok(rate)
    }

    /// Put `rate` in force for `target` and program the link.
    pub fn commit<L>(&mut self, target: u8, rate: RateRecord, link: &mut L) -> Result<()>
    where
        L: LinkController + ?Sized,
    {
        let dev = self.get_mut(target)?;
        dev.current = rate;
        link.program_rate(target, &rate);
        tracing::debug!("Target {} committed: {}", target, rate);
        Ok(())
    }

    /// Remember the rate in force as the last negotiated one.
    pub fn save_as_last_negotiated(&mut self, target: u8) -> Result<()> {
        let dev = self.get_mut(target)?;
        dev.last_negotiated = Some(dev.current);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ultra320() -> RateRecord {
        RateRecord::sync(0x08, 0xfe, true).with_options(ProtocolOptions::from_bits(
            ProtocolOptions::ALL,
        ))
    }

    fn table() -> CapabilityTable {
        CapabilityTable::new(DeviceCapability::new(ultra320()))
    }

    #[test]
    fn test_full_rate_for_tagged_command() {
        let rate = table().get_negotiating_rate(0, true).unwrap();
        assert_eq!(rate, ultra320());
    }

    #[test]
    fn test_suppressed_target_is_async_narrow() {
        let mut table = table();
        let dev = DeviceCapability::new(ultra320()).suppressed();
        table.set(3, dev).unwrap();
        assert_eq!(
            table.get_negotiating_rate(3, true).unwrap(),
            RateRecord::async_narrow()
        );
    }

    #[test]
    fn test_narrow_hardware_clears_wide_and_dt() {
        let hw = ultra320().with_wide(false);
        let table = CapabilityTable::new(DeviceCapability::new(hw));
        let rate = table.get_negotiating_rate(0, true).unwrap();
        assert!(!rate.wide);
        assert!(rate.options.is_empty());
        assert_eq!(rate.period, ST_MIN_PERIOD);
    }

    #[test]
    fn test_single_ended_floors_to_fast20() {
        let mut table = table();
        table
            .set(2, DeviceCapability::new(ultra320()).with_bus(BusClass::SingleEnded))
            .unwrap();
        let rate = table.get_negotiating_rate(2, true).unwrap();
        assert_eq!(rate.period, FAST20_PERIOD);
        assert!(rate.options.is_empty());
        assert!(rate.wide);
    }

    #[test]
    fn test_untagged_command_drops_packetized() {
        let rate = table().get_negotiating_rate(0, false).unwrap();
        assert!(!rate.is_packetized());
        assert!(rate.is_dual_edge());
        assert!(rate.options.has(ProtocolOptions::QUICK_ARB));
        assert!(!rate.options.has(ProtocolOptions::RETAIN_TRAINING));
        assert_eq!(rate.period, NON_PACKETIZED_MIN_PERIOD);
    }

    #[test]
    fn test_configured_default_clips() {
        let mut table = table();
        let cfg = RateRecord::sync(0x0c, 0x20, true);
        table
            .set(1, DeviceCapability::new(ultra320()).with_configured_default(cfg))
            .unwrap();
        let rate = table.get_negotiating_rate(1, true).unwrap();
        assert_eq!(rate, cfg);
    }

    #[test]
    fn test_u160_offset_limit() {
        let hw = RateRecord::sync(0x09, 0xfe, true)
            .with_options(ProtocolOptions::from_bits(ProtocolOptions::DUAL_EDGE));
        let table = CapabilityTable::new(DeviceCapability::new(hw)).with_clipper(StandardClipper {
            limit_u160_offset: true,
        });
        let rate = table.get_negotiating_rate(0, false).unwrap();
        assert_eq!(rate.offset, U160_OFFSET_LIMIT);
    }

    #[test]
    fn test_invalid_target() {
        assert!(matches!(
            table().get_negotiating_rate(16, true),
            Err(NegotiationError::InvalidTarget(16))
        ));
    }

    #[test]
    fn test_drop_width() {
        let mut dev = DeviceCapability::new(ultra320());
        dev.last_negotiated = Some(ultra320());
        dev.drop_width();
        assert!(!dev.negotiating.wide);
        assert!(dev.negotiating.options.is_empty());
        assert!(!dev.last_negotiated.unwrap().wide);
    }

    #[test]
    fn test_record_target_capability_keeps_best() {
        let mut dev = DeviceCapability::default();
        dev.record_target_capability(RateRecord::sync(0x0c, 0x10, false));
        dev.record_target_capability(RateRecord::sync(0x0a, 0x08, true));
        dev.record_target_capability(RateRecord::async_narrow());
        let cap = dev.target_capability.unwrap();
        assert_eq!(cap.period, 0x0a);
        assert_eq!(cap.offset, 0x10);
        assert!(cap.wide);
    }
}
