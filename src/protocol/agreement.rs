//! Agreement algorithm.
//!
//! Folds a local proposal and a target response into the rate both sides
//! can run. Every result is at least as conservative as either input: the
//! offset never grows, the period never shrinks, and an option survives
//! only when both sides asked for it.

use serde::{Deserialize, Serialize};

use super::capabilities::{CapabilityTable, DeviceCapability};
use super::rate::{ProtocolOptions, RateRecord};
use super::{PACED_PERIOD, ST_MIN_PERIOD};
use crate::error::Result;

/// Which message family to negotiate with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// One PPR carries width, period, offset and options
    UsePpr,
    /// WDTR then SDTR
    UseLegacy,
}

/// Rate to propose to `target` for a command.
pub fn propose(table: &CapabilityTable, target: u8, tagged: bool) -> Result<RateRecord> {
    table.get_negotiating_rate(target, tagged)
}

/// Reconcile a local proposal with the target's response.
///
/// A remote offset of zero means the target wants asynchronous transfers,
/// and that absorbs everything else. Precompensation is not part of the
/// exchange: the local side keeps it when the agreement is packetized at a
/// paced period.
pub fn reconcile(local: &RateRecord, remote: &RateRecord) -> RateRecord {
    if remote.offset == 0 {
        return RateRecord::async_narrow();
    }

    let mut options = local.options.intersect(remote.options);
    options.clear(ProtocolOptions::PRECOMP);

    let mut agreed = RateRecord {
        period: local.period.max(remote.period),
        offset: local.offset.min(remote.offset),
        options,
        wide: local.wide && remote.wide,
    }
    .normalized();
    // Without DT the agreement runs single-transition
    if !agreed.is_dual_edge() {
        agreed = agreed.single_transition();
    }

    if local.options.has(ProtocolOptions::PRECOMP)
        && agreed.is_packetized()
        && agreed.period <= PACED_PERIOD
    {
        agreed.options.set(ProtocolOptions::PRECOMP);
    }
    agreed
}

/// Reconcile a WDTR exchange. Width is all it carries; a WDTR resets the
/// synchronous agreement, so the result is asynchronous.
pub fn reconcile_wide(local: &RateRecord, remote: &RateRecord) -> RateRecord {
    RateRecord::async_with_width(local.wide && remote.wide)
}

/// Reconcile an SDTR exchange under the width already in force.
///
/// SDTR only carries single-transition period and offset, so options are
/// dropped and width comes from the preceding WDTR agreement.
pub fn reconcile_sync(local: &RateRecord, remote: &RateRecord, width_in_force: bool) -> RateRecord {
    let local = local.single_transition().with_wide(width_in_force);
    let remote = remote.single_transition().with_wide(width_in_force);
    let mut agreed = reconcile(&local, &remote);
    agreed.wide = width_in_force;
    if agreed.is_async() {
        return RateRecord::async_with_width(width_in_force);
    }
    agreed
}

/// Pick PPR or legacy negotiation for a proposal.
///
/// PPR is only worth it when the target is believed to understand it and
/// the proposal needs something beyond plain narrow single-transition
/// synchronous transfers.
pub fn choose_strategy(device: &DeviceCapability, proposal: &RateRecord) -> Strategy {
    let believed = device.ppr.is_believed() && device.bus.supports_dual_edge();
    let needs_ppr =
        proposal.wide || proposal.period < ST_MIN_PERIOD || !proposal.options.is_empty();
    if believed && needs_ppr {
        Strategy::UsePpr
    } else {
        Strategy::UseLegacy
    }
}
