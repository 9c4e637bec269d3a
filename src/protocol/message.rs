//! Transfer negotiation message codec.
//!
//! Pure transforms between [`RateRecord`]s and the SPI extended messages:
//!
//! ```text
//! WDTR  01 02 03 <width exponent>
//! SDTR  01 03 01 <period> <offset>
//! PPR   01 06 04 <period> 00 <offset> <width exponent> <protocol options>
//! ```
//!
//! Precompensation is a unilateral driver setting and never goes on the
//! wire; the PCOMP_EN bit is always sent clear and ignored on receipt.

#![allow(missing_docs)]

use std::fmt;

use bytes::Bytes;

use super::rate::{ProtocolOptions, RateRecord};
use super::{NON_PACKETIZED_MIN_PERIOD, SYNC_CEILING};
use crate::error::{NegotiationError, Result};

/// Single-byte message codes
pub mod msg {
    /// Command complete
    pub const COMMAND_COMPLETE: u8 = 0x00;
    /// Extended message lead-in
    pub const EXTENDED: u8 = 0x01;
    /// Save data pointer
    pub const SAVE_DATA_POINTER: u8 = 0x02;
    /// Restore pointers
    pub const RESTORE_POINTERS: u8 = 0x03;
    /// Disconnect
    pub const DISCONNECT: u8 = 0x04;
    /// Abort task set
    pub const ABORT_TASK_SET: u8 = 0x06;
    /// Message reject
    pub const MESSAGE_REJECT: u8 = 0x07;
    /// No operation
    pub const NO_OPERATION: u8 = 0x08;
    /// Message parity error
    pub const MESSAGE_PARITY_ERROR: u8 = 0x09;
    /// Simple queue tag
    pub const SIMPLE_QUEUE_TAG: u8 = 0x20;
    /// Head of queue tag
    pub const HEAD_OF_QUEUE_TAG: u8 = 0x21;
    /// Ordered queue tag
    pub const ORDERED_QUEUE_TAG: u8 = 0x22;
    /// Identify (bit 7 set)
    pub const IDENTIFY: u8 = 0x80;

    /// Whether `code` is an identify message
    pub fn is_identify(code: u8) -> bool {
        code & IDENTIFY != 0
    }

    /// Whether `code` is one of the queue tag messages
    pub fn is_queue_tag(code: u8) -> bool {
        matches!(code, SIMPLE_QUEUE_TAG | HEAD_OF_QUEUE_TAG | ORDERED_QUEUE_TAG)
    }
}

/// Encoded WDTR length
pub const WDTR_LEN: usize = 4;
/// Encoded SDTR length
pub const SDTR_LEN: usize = 5;
/// Encoded PPR length
pub const PPR_LEN: usize = 8;

/// Extended message type code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtendedKind {
    ModifyDataPointer,
    Sdtr,
    Wdtr,
    Ppr,
    Other(u8),
}

impl ExtendedKind {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x00 => Self::ModifyDataPointer,
            0x01 => Self::Sdtr,
            0x03 => Self::Wdtr,
            0x04 => Self::Ppr,
            other => Self::Other(other),
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            Self::ModifyDataPointer => 0x00,
            Self::Sdtr => 0x01,
            Self::Wdtr => 0x03,
            Self::Ppr => 0x04,
            Self::Other(b) => b,
        }
    }

    /// Whether this is one of the transfer negotiation messages
    pub fn is_negotiation(self) -> bool {
        matches!(self, Self::Sdtr | Self::Wdtr | Self::Ppr)
    }
}

impl fmt::Display for ExtendedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ModifyDataPointer => write!(f, "MDP"),
            Self::Sdtr => write!(f, "SDTR"),
            Self::Wdtr => write!(f, "WDTR"),
            Self::Ppr => write!(f, "PPR"),
            Self::Other(b) => write!(f, "extended 0x{:02x}", b),
        }
    }
}

/// A decoded extended message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedMessage {
    /// Message type
    pub kind: ExtendedKind,
    /// Rate carried, already demoted to something valid
    pub rate: RateRecord,
    /// The target asked for a period slower than the synchronous ceiling
    pub beyond_ceiling: bool,
}

/// A message on its way to or from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    /// Message bytes
    pub bytes: Bytes,
    /// Last byte of a received message is still waiting for ACK
    pub ack_needed: bool,
}

impl PendingMessage {
    /// Message to send
    pub fn outgoing(bytes: &[u8]) -> Self {
        Self {
            bytes: Bytes::copy_from_slice(bytes),
            ack_needed: false,
        }
    }

    /// Message read from the target, last byte not yet acknowledged
    pub fn received(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Bytes::from(bytes),
            ack_needed: true,
        }
    }

    /// Single-byte message reject
    pub fn reject() -> Self {
        Self::outgoing(&[msg::MESSAGE_REJECT])
    }

    /// First byte (message code), 0 for an empty buffer
    pub fn code(&self) -> u8 {
        self.bytes.first().copied().unwrap_or(msg::COMMAND_COMPLETE)
    }

    /// Whether this is a message reject
    pub fn is_reject(&self) -> bool {
        self.bytes.len() == 1 && self.code() == msg::MESSAGE_REJECT
    }

    /// Whether this is an extended message
    pub fn is_extended(&self) -> bool {
        self.bytes.len() > 1 && self.code() == msg::EXTENDED
    }
}

/// Encode a WDTR carrying the record's width.
pub fn encode_wdtr(rate: &RateRecord) -> [u8; WDTR_LEN] {
    [msg::EXTENDED, 2, ExtendedKind::Wdtr.as_byte(), u8::from(rate.wide)]
}

/// Encode an SDTR carrying the record's period and offset.
pub fn encode_sdtr(rate: &RateRecord) -> [u8; SDTR_LEN] {
    [
        msg::EXTENDED,
        3,
        ExtendedKind::Sdtr.as_byte(),
        rate.period,
        rate.offset,
    ]
}

/// Encode a PPR.
///
/// Options are only advertised for a wide synchronous DT rate. A command
/// that is not tag-queued cannot run packetized, so it only offers QAS
/// and DT.
pub fn encode_ppr(rate: &RateRecord, target_is_tagged: bool) -> [u8; PPR_LEN] {
    let mut options = rate.options;
    options.clear(ProtocolOptions::PRECOMP);
    if !rate.wide || rate.offset == 0 || !rate.is_dual_edge() {
        options = ProtocolOptions::new();
    } else if !target_is_tagged {
        options.retain(ProtocolOptions::QUICK_ARB | ProtocolOptions::DUAL_EDGE);
    }
    [
        msg::EXTENDED,
        6,
        ExtendedKind::Ppr.as_byte(),
        rate.period,
        0,
        rate.offset,
        u8::from(rate.wide),
        options.bits(),
    ]
}

/// Decode a WDTR, SDTR or PPR into the rate it carries.
pub fn decode_extended(bytes: &[u8]) -> Result<RateRecord> {
    let message = decode_message(bytes)?;
    if !message.kind.is_negotiation() {
        return Err(NegotiationError::InvalidMessage(format!(
            "{} is not a transfer negotiation message",
            message.kind
        )));
    }
    Ok(message.rate)
}

/// Decode any extended message, keeping the type and ceiling verdict.
pub fn decode_message(bytes: &[u8]) -> Result<ExtendedMessage> {
    if bytes.len() < 3 {
        return Err(NegotiationError::InvalidMessage(format!(
            "Extended message too short: {} bytes",
            bytes.len()
        )));
    }
    if bytes[0] != msg::EXTENDED {
        return Err(NegotiationError::InvalidMessage(format!(
            "Not an extended message: 0x{:02x}",
            bytes[0]
        )));
    }
    let declared = bytes[1] as usize;
    if bytes.len() != declared + 2 {
        return Err(NegotiationError::InvalidMessage(format!(
            "Length byte says {} but {} bytes follow",
            declared,
            bytes.len() - 2
        )));
    }

    let kind = ExtendedKind::from_byte(bytes[2]);
    let expected = match kind {
        ExtendedKind::Wdtr => Some(WDTR_LEN),
        ExtendedKind::Sdtr => Some(SDTR_LEN),
        ExtendedKind::Ppr => Some(PPR_LEN),
        _ => None,
    };
    if let Some(expected) = expected {
        if bytes.len() != expected {
            return Err(NegotiationError::InvalidMessage(format!(
                "{} must be {} bytes, got {}",
                kind,
                expected,
                bytes.len()
            )));
        }
    }

    let (rate, beyond_ceiling) = match kind {
        ExtendedKind::Wdtr => (RateRecord::async_with_width(bytes[3] != 0), false),
        ExtendedKind::Sdtr => decode_sync(bytes[3], bytes[4]),
        ExtendedKind::Ppr => decode_ppr(bytes[3], bytes[5], bytes[6], bytes[7]),
        _ => (RateRecord::async_narrow(), false),
    };

    Ok(ExtendedMessage {
        kind,
        rate,
        beyond_ceiling,
    })
}

fn decode_sync(period: u8, offset: u8) -> (RateRecord, bool) {
    if offset == 0 {
        return (RateRecord::async_narrow(), false);
    }
    if period > SYNC_CEILING {
        return (RateRecord::async_narrow(), true);
    }
    (RateRecord::sync(period, offset, false), false)
}

fn decode_ppr(period: u8, offset: u8, width: u8, options: u8) -> (RateRecord, bool) {
    let wide = width != 0;
    if offset == 0 {
        return (RateRecord::async_with_width(wide), false);
    }
    if period > SYNC_CEILING {
        return (RateRecord::async_narrow(), true);
    }

    let mut options = ProtocolOptions::from_bits(options);
    options.clear(ProtocolOptions::PRECOMP);
    if !wide || !options.has(ProtocolOptions::DUAL_EDGE) {
        options = ProtocolOptions::new();
    }
    if !options.has(ProtocolOptions::PACKETIZED) {
        options.clear(ProtocolOptions::PACKETIZED_ONLY);
    }
    // ST clocking cannot run this fast; the reply is unusable
    if !options.has(ProtocolOptions::DUAL_EDGE) && period <= NON_PACKETIZED_MIN_PERIOD {
        return (RateRecord::async_narrow(), false);
    }

    let rate = RateRecord {
        period,
        offset,
        options,
        wide,
    };
    (rate.normalized(), false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    fn u320_packetized() -> RateRecord {
        RateRecord::sync(0x08, 0x7f, true).with_options(ProtocolOptions::from_bits(
            ProtocolOptions::PACKETIZED
                | ProtocolOptions::DUAL_EDGE
                | ProtocolOptions::QUICK_ARB
                | ProtocolOptions::RETAIN_TRAINING,
        ))
    }

    #[test]
    fn test_encode_wdtr() {
        assert_eq!(
            encode_wdtr(&RateRecord::async_with_width(true)),
            hex!("01 02 03 01")
        );
        assert_eq!(encode_wdtr(&RateRecord::async_narrow()), hex!("01 02 03 00"));
    }

    #[test]
    fn test_encode_sdtr() {
        let rate = RateRecord::sync(0x0c, 0x10, false);
        assert_eq!(encode_sdtr(&rate), hex!("01 03 01 0c 10"));
    }

    #[test]
    fn test_encode_ppr_tagged() {
        assert_eq!(
            encode_ppr(&u320_packetized(), true),
            hex!("01 06 04 08 00 7f 01 47")
        );
    }

    #[test]
    fn test_encode_ppr_untagged_keeps_qas_dt() {
        assert_eq!(
            encode_ppr(&u320_packetized(), false),
            hex!("01 06 04 08 00 7f 01 06")
        );
    }

    #[test]
    fn test_encode_ppr_never_sends_precomp() {
        let mut rate = u320_packetized();
        rate.options.set(ProtocolOptions::PRECOMP);
        assert_eq!(encode_ppr(&rate, true)[7] & ProtocolOptions::PRECOMP, 0);
    }

    #[test]
    fn test_encode_ppr_narrow_has_no_options() {
        let rate = RateRecord::sync(0x0a, 0x20, false);
        assert_eq!(encode_ppr(&rate, true), hex!("01 06 04 0a 00 20 00 00"));
    }

    #[test]
    fn test_decode_sdtr() {
        let rate = decode_extended(&hex!("01 03 01 0c 10")).unwrap();
        assert_eq!(rate, RateRecord::sync(0x0c, 0x10, false));
    }

    #[test]
    fn test_decode_sdtr_keeps_fast_periods() {
        for period in [0x08, 0x09] {
            let rate = RateRecord::sync(period, 0x10, false);
            let bytes = encode_sdtr(&rate);
            assert_eq!(bytes, [0x01, 0x03, 0x01, period, 0x10]);
            assert_eq!(decode_extended(&bytes).unwrap(), rate);
        }
    }

    #[test]
    fn test_decode_sdtr_beyond_ceiling_is_async() {
        let msg = decode_message(&hex!("01 03 01 40 10")).unwrap();
        assert_eq!(msg.kind, ExtendedKind::Sdtr);
        assert!(msg.beyond_ceiling);
        assert_eq!(msg.rate, RateRecord::async_narrow());
    }

    #[test]
    fn test_decode_wdtr() {
        let rate = decode_extended(&hex!("01 02 03 01")).unwrap();
        assert_eq!(rate, RateRecord::async_with_width(true));
    }

    #[test]
    fn test_decode_ppr_narrow_demotes_options() {
        let rate = decode_extended(&hex!("01 06 04 0a 00 20 00 47")).unwrap();
        assert!(!rate.wide);
        assert!(rate.options.is_empty());
    }

    #[test]
    fn test_decode_ppr_without_iu_clears_packetized_bits() {
        let rate = decode_extended(&hex!("01 06 04 09 00 40 01 72")).unwrap();
        assert_eq!(
            rate.options.bits(),
            ProtocolOptions::DUAL_EDGE
        );
    }

    #[test]
    fn test_decode_ppr_fast_st_is_async_narrow() {
        let rate = decode_extended(&hex!("01 06 04 09 00 40 01 00")).unwrap();
        assert_eq!(rate, RateRecord::async_narrow());
    }

    #[test]
    fn test_decode_ppr_roundtrip_u320() {
        let rate = u320_packetized();
        assert_eq!(decode_extended(&encode_ppr(&rate, true)).unwrap(), rate);
    }

    #[test]
    fn test_decode_rejects_bad_length() {
        assert!(matches!(
            decode_extended(&hex!("01 03 01 0c")),
            Err(NegotiationError::InvalidMessage(_))
        ));
        assert!(matches!(
            decode_extended(&hex!("01 02 01 0c")),
            Err(NegotiationError::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_decode_rejects_non_extended() {
        assert!(decode_extended(&hex!("07 00 00")).is_err());
    }

    #[test]
    fn test_modify_data_pointer_is_not_negotiation() {
        let bytes = hex!("01 05 00 00 00 01 00");
        let msg = decode_message(&bytes).unwrap();
        assert_eq!(msg.kind, ExtendedKind::ModifyDataPointer);
        assert!(decode_extended(&bytes).is_err());
    }

    #[test]
    fn test_pending_message_flags() {
        assert!(PendingMessage::reject().is_reject());
        assert!(!PendingMessage::reject().ack_needed);
        let received = PendingMessage::received(encode_wdtr(&RateRecord::async_narrow()).to_vec());
        assert!(received.is_extended());
        assert!(received.ack_needed);
    }
}
