//! Text encoding and concatenated-SMS segmentation.
//!
//! The default alphabet is encoded byte-for-byte through the ISO-8859-1
//! mapping, matching the carrier contract this gateway has always shipped
//! with. Characters outside Latin-1 degrade to `?`.

use std::time::{SystemTime, UNIX_EPOCH};

/// Longest body that fits one PDU without concatenation headers.
pub const SINGLE_SEGMENT_MAX: usize = 160;

/// Payload bytes per segment once the 6-byte UDH is in place.
pub const SEGMENT_SIZE: usize = 153;

/// Concatenation header length: IEI 0x00 (8-bit reference), three octets.
pub const UDH_LEN: usize = 6;

/// One wire-ready part of a segmented message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// 1-based part number.
    pub part_num: u8,
    pub total_parts: u8,
    /// Short-message bytes: UDH (multi-part only) plus encoded payload.
    pub body: Vec<u8>,
}

/// A message encoded and split for submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentedMessage {
    /// Fits a single PDU; no UDH, `esm_class 0x00`.
    Single(Vec<u8>),
    /// Concatenated parts sharing one reference byte; `esm_class 0x40`.
    Multi { ref_num: u8, parts: Vec<Segment> },
}

impl SegmentedMessage {
    pub fn total_parts(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Multi { parts, .. } => parts.len(),
        }
    }
}

/// Encode `text` through the ISO-8859-1 byte mapping.
pub fn encode_gsm7(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| {
            let code = c as u32;
            if code <= 0xFF {
                code as u8
            } else {
                b'?'
            }
        })
        .collect()
}

/// Split an encoded body into wire-ready segments. Bodies up to 160 bytes
/// stay whole; longer bodies become ⌈len/153⌉ parts, each prefixed with the
/// `05 00 03 ref total part` concatenation header.
pub fn split_segments(encoded: Vec<u8>, ref_num: u8) -> SegmentedMessage {
    if encoded.len() <= SINGLE_SEGMENT_MAX {
        return SegmentedMessage::Single(encoded);
    }

    let total_parts = encoded.len().div_ceil(SEGMENT_SIZE);
    let parts = encoded
        .chunks(SEGMENT_SIZE)
        .enumerate()
        .map(|(index, chunk)| {
            let mut body = Vec::with_capacity(UDH_LEN + chunk.len());
            body.extend_from_slice(&[
                0x05,
                0x00,
                0x03,
                ref_num,
                total_parts as u8,
                (index + 1) as u8,
            ]);
            body.extend_from_slice(chunk);
            Segment {
                part_num: (index + 1) as u8,
                total_parts: total_parts as u8,
                body,
            }
        })
        .collect();

    SegmentedMessage::Multi { ref_num, parts }
}

/// One-byte concatenation reference shared by all parts of a message: the
/// low byte of the current epoch milliseconds.
pub fn reference_number() -> u8 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    millis as u8
}
