//! Transfer rate records and PPR protocol options.
//!
//! A [`RateRecord`] is the unit every other component trades in: the
//! capability table stores several per target, the codec turns them into
//! WDTR/SDTR/PPR bytes, and the agreement algorithm folds two of them into
//! one.
//!
//! Option bits use the PPR wire layout so encoding is a plain byte copy:
//!
//! | Bit | Option           | PPR name  |
//! |-----|------------------|-----------|
//! | 0   | `PACKETIZED`     | IU_REQ    |
//! | 1   | `DUAL_EDGE`      | DT_REQ    |
//! | 2   | `QUICK_ARB`      | QAS_REQ   |
//! | 3   | (reserved)       |           |
//! | 4   | `WRITE_FLOW`     | WR_FLOW   |
//! | 5   | `READ_STREAM`    | RD_STRM   |
//! | 6   | `RETAIN_TRAINING`| RTI       |
//! | 7   | `PRECOMP`        | PCOMP_EN  |

use std::fmt;

use serde::{Deserialize, Serialize};

use super::{ASYNC_PERIOD, ST_MIN_PERIOD, SYNC_CEILING};

/// PPR protocol option bitset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<ProtocolOption>", into = "Vec<ProtocolOption>")]
pub struct ProtocolOptions(u8);

#[allow(missing_docs)]
impl ProtocolOptions {
    /// Information-unit (packetized) transfers
    pub const PACKETIZED: u8 = 1 << 0;
    /// Double-transition clocking
    pub const DUAL_EDGE: u8 = 1 << 1;
    /// Quick arbitration and selection
    pub const QUICK_ARB: u8 = 1 << 2;
    // Bit 3 reserved
    /// Write flow control
    pub const WRITE_FLOW: u8 = 1 << 4;
    /// Read streaming
    pub const READ_STREAM: u8 = 1 << 5;
    /// Retain training information
    pub const RETAIN_TRAINING: u8 = 1 << 6;
    /// Driver precompensation
    pub const PRECOMP: u8 = 1 << 7;

    /// Bits that only mean something on a packetized link
    pub const PACKETIZED_ONLY: u8 =
        Self::RETAIN_TRAINING | Self::WRITE_FLOW | Self::READ_STREAM | Self::PRECOMP;

    /// Every defined bit
    pub const ALL: u8 = Self::PACKETIZED
        | Self::DUAL_EDGE
        | Self::QUICK_ARB
        | Self::WRITE_FLOW
        | Self::READ_STREAM
        | Self::RETAIN_TRAINING
        | Self::PRECOMP;

    /// Create new empty options
    pub fn new() -> Self {
        Self(0)
    }

    /// Create from raw bits, dropping the reserved bit
    pub fn from_bits(bits: u8) -> Self {
        Self(bits & Self::ALL)
    }

    /// Get raw bits
    pub fn bits(&self) -> u8 {
        self.0
    }

    /// Set an option
    pub fn set(&mut self, flag: u8) {
        self.0 |= flag & Self::ALL;
    }

    /// Clear an option
    pub fn clear(&mut self, flag: u8) {
        self.0 &= !flag;
    }

    /// Check if any of the given options is set
    pub fn has(&self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    /// Keep only the given options
    pub fn retain(&mut self, mask: u8) {
        self.0 &= mask;
    }

    /// True when no option is set
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Options present in both sets
    pub fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Iterate the named options that are set
    pub fn iter(&self) -> impl Iterator<Item = ProtocolOption> + '_ {
        ProtocolOption::ALL
            .iter()
            .copied()
            .filter(move |opt| self.has(opt.bit()))
    }
}

impl From<Vec<ProtocolOption>> for ProtocolOptions {
    fn from(options: Vec<ProtocolOption>) -> Self {
        options.into_iter().collect()
    }
}

impl From<ProtocolOptions> for Vec<ProtocolOption> {
    fn from(options: ProtocolOptions) -> Self {
        options.iter().collect()
    }
}

impl FromIterator<ProtocolOption> for ProtocolOptions {
    fn from_iter<I: IntoIterator<Item = ProtocolOption>>(iter: I) -> Self {
        let mut options = Self::new();
        for opt in iter {
            options.set(opt.bit());
        }
        options
    }
}

impl fmt::Display for ProtocolOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let names: Vec<&str> = self.iter().map(|opt| opt.name()).collect();
        write!(f, "{}", names.join("|"))
    }
}

/// A single named protocol option, used for config files and JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolOption {
    /// Information-unit transfers
    Packetized,
    /// Double-transition clocking
    DualEdge,
    /// Quick arbitration and selection
    QuickArb,
    /// Write flow control
    WriteFlow,
    /// Read streaming
    ReadStream,
    /// Retain training information
    RetainTraining,
    /// Driver precompensation
    Precomp,
}

impl ProtocolOption {
    /// All options in bit order.
    pub const ALL: [ProtocolOption; 7] = [
        Self::Packetized,
        Self::DualEdge,
        Self::QuickArb,
        Self::WriteFlow,
        Self::ReadStream,
        Self::RetainTraining,
        Self::Precomp,
    ];

    /// Bit in [`ProtocolOptions`]
    pub fn bit(self) -> u8 {
        match self {
            Self::Packetized => ProtocolOptions::PACKETIZED,
            Self::DualEdge => ProtocolOptions::DUAL_EDGE,
            Self::QuickArb => ProtocolOptions::QUICK_ARB,
            Self::WriteFlow => ProtocolOptions::WRITE_FLOW,
            Self::ReadStream => ProtocolOptions::READ_STREAM,
            Self::RetainTraining => ProtocolOptions::RETAIN_TRAINING,
            Self::Precomp => ProtocolOptions::PRECOMP,
        }
    }

    /// Short name as used in config files
    pub fn name(self) -> &'static str {
        match self {
            Self::Packetized => "packetized",
            Self::DualEdge => "dual-edge",
            Self::QuickArb => "quick-arb",
            Self::WriteFlow => "write-flow",
            Self::ReadStream => "read-stream",
            Self::RetainTraining => "retain-training",
            Self::Precomp => "precomp",
        }
    }
}

impl std::str::FromStr for ProtocolOption {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "packetized" | "iu" => Ok(Self::Packetized),
            "dual-edge" | "dt" => Ok(Self::DualEdge),
            "quick-arb" | "qas" => Ok(Self::QuickArb),
            "write-flow" | "wr-flow" => Ok(Self::WriteFlow),
            "read-stream" | "rd-strm" => Ok(Self::ReadStream),
            "retain-training" | "rti" => Ok(Self::RetainTraining),
            "precomp" | "pcomp" => Ok(Self::Precomp),
            _ => Err(format!("Unknown protocol option: {}", s)),
        }
    }
}

/// Transfer parameters for one direction of agreement.
///
/// `period` is the SPI transfer period factor (smaller is faster) and
/// `offset` the REQ/ACK offset; an offset of zero means asynchronous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateRecord {
    /// Transfer period factor
    pub period: u8,
    /// REQ/ACK offset, 0 = asynchronous
    pub offset: u8,
    /// PPR protocol options
    #[serde(default)]
    pub options: ProtocolOptions,
    /// 16-bit transfers
    #[serde(default)]
    pub wide: bool,
}

impl Default for RateRecord {
    fn default() -> Self {
        Self::async_narrow()
    }
}

impl RateRecord {
    /// Asynchronous, narrow, no options.
    pub const fn async_narrow() -> Self {
        Self {
            period: ASYNC_PERIOD,
            offset: 0,
            options: ProtocolOptions(0),
            wide: false,
        }
    }

    /// Asynchronous at the given width.
    pub const fn async_with_width(wide: bool) -> Self {
        Self {
            period: ASYNC_PERIOD,
            offset: 0,
            options: ProtocolOptions(0),
            wide,
        }
    }

    /// Synchronous record without options.
    pub fn sync(period: u8, offset: u8, wide: bool) -> Self {
        Self {
            period,
            offset,
            options: ProtocolOptions::new(),
            wide,
        }
    }

    /// Set the options
    pub fn with_options(mut self, options: ProtocolOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the width
    pub fn with_wide(mut self, wide: bool) -> Self {
        self.wide = wide;
        self
    }

    /// True for asynchronous transfers
    pub fn is_async(&self) -> bool {
        self.offset == 0
    }

    /// True when the record asks for packetized transfers
    pub fn is_packetized(&self) -> bool {
        self.options.has(ProtocolOptions::PACKETIZED)
    }

    /// True when the record asks for double-transition clocking
    pub fn is_dual_edge(&self) -> bool {
        self.options.has(ProtocolOptions::DUAL_EDGE)
    }

    /// The same record restricted to single-transition transfers: options
    /// dropped and the period floored to the fastest ST period.
    pub fn single_transition(mut self) -> Self {
        self.options = ProtocolOptions::new();
        if self.offset != 0 && self.period < ST_MIN_PERIOD {
            self.period = ST_MIN_PERIOD;
        }
        self
    }

    /// Enforce the record invariants, demoting whatever cannot hold.
    ///
    /// - `DualEdge` needs a wide bus; without it every option is cleared
    /// - `Packetized` needs `DualEdge`; the packetized-only bits need `Packetized`
    /// - a period beyond [`SYNC_CEILING`] or a zero offset means asynchronous
    ///
    /// The period of a synchronous record is kept as is. Flooring ST rates
    /// to [`ST_MIN_PERIOD`] belongs to proposals and agreements.
    pub fn normalized(mut self) -> Self {
        if !self.wide || !self.is_dual_edge() {
            self.options = ProtocolOptions::new();
        }
        if !self.is_packetized() {
            self.options.clear(ProtocolOptions::PACKETIZED_ONLY);
        }
        if self.offset == 0 || self.period > SYNC_CEILING {
            return Self::async_with_width(self.wide);
        }
        self
    }

    /// Check the record invariants without modifying it.
    pub fn is_valid(&self) -> bool {
        *self == self.normalized()
    }
}

impl fmt::Display for RateRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_async() {
            write!(f, "async {}", if self.wide { "wide" } else { "narrow" })
        } else {
            write!(
                f,
                "period 0x{:02x} offset 0x{:02x} {} [{}]",
                self.period,
                self.offset,
                if self.wide { "wide" } else { "narrow" },
                self.options
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u320() -> RateRecord {
        RateRecord::sync(0x08, 0x7f, true).with_options(ProtocolOptions::from_bits(
            ProtocolOptions::PACKETIZED
                | ProtocolOptions::DUAL_EDGE
                | ProtocolOptions::QUICK_ARB
                | ProtocolOptions::RETAIN_TRAINING,
        ))
    }

    #[test]
    fn test_options_bits() {
        let mut opts = ProtocolOptions::new();
        opts.set(ProtocolOptions::DUAL_EDGE);
        opts.set(ProtocolOptions::QUICK_ARB);
        assert_eq!(opts.bits(), 0x06);
        assert!(opts.has(ProtocolOptions::DUAL_EDGE));

        opts.clear(ProtocolOptions::QUICK_ARB);
        assert_eq!(opts.bits(), 0x02);
    }

    #[test]
    fn test_reserved_bit_dropped() {
        assert_eq!(ProtocolOptions::from_bits(0xff).bits(), 0xf7);
    }

    #[test]
    fn test_valid_u320_record() {
        assert!(u320().is_valid());
    }

    #[test]
    fn test_narrow_drops_dual_edge() {
        let rate = u320().with_wide(false).normalized();
        assert!(rate.options.is_empty());
        assert_eq!(rate.period, 0x08);
        assert!(rate.is_valid());

        assert_eq!(rate.single_transition().period, ST_MIN_PERIOD);
    }

    #[test]
    fn test_packetized_only_bits_need_packetized() {
        let rate = RateRecord::sync(0x09, 0x40, true)
            .with_options(ProtocolOptions::from_bits(
                ProtocolOptions::DUAL_EDGE | ProtocolOptions::RETAIN_TRAINING,
            ))
            .normalized();
        assert_eq!(rate.options.bits(), ProtocolOptions::DUAL_EDGE);
        assert_eq!(rate.period, 0x09);
    }

    #[test]
    fn test_zero_offset_is_async() {
        let rate = RateRecord::sync(0x0c, 0, true).normalized();
        assert_eq!(rate, RateRecord::async_with_width(true));
    }

    #[test]
    fn test_period_beyond_ceiling_is_async() {
        let rate = RateRecord::sync(0x40, 0x10, false).normalized();
        assert_eq!(rate, RateRecord::async_narrow());
    }

    #[test]
    fn test_options_serde_as_names() {
        let json = serde_json::to_string(&u320()).unwrap();
        assert!(json.contains("\"packetized\""));
        assert!(json.contains("\"retain-training\""));

        let back: RateRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, u320());
    }

    #[test]
    fn test_option_from_str_aliases() {
        assert_eq!("iu".parse::<ProtocolOption>(), Ok(ProtocolOption::Packetized));
        assert_eq!("DT".parse::<ProtocolOption>(), Ok(ProtocolOption::DualEdge));
        assert!("bogus".parse::<ProtocolOption>().is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(RateRecord::async_narrow().to_string(), "async narrow");
        assert_eq!(
            RateRecord::sync(0x0c, 0x10, true).to_string(),
            "period 0x0c offset 0x10 wide [none]"
        );
    }
}
