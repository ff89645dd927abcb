//! Minimal SMPP 3.4 wire layer.
//!
//! Only the PDUs this gateway exchanges exist here: transceiver bind, unbind,
//! enquire_link, submit_sm, deliver_sm (plus responses) and generic_nack.
//! Framing follows the SMPP 3.4 header layout: 4-byte big-endian
//! command_length / command_id / command_status / sequence_number, then the
//! mandatory body fields.

mod codec;
mod pdu;
mod types;

pub use codec::SmppCodec;
pub use pdu::{
    BindTransceiver, BindTransceiverResp, DeliverSm, DeliverSmResp, Frame, Pdu, PduHeader,
    SubmitSm, SubmitSmResp,
};
pub use types::{
    status_text, CommandId, WireError, ESM_CLASS_DEFAULT, ESM_CLASS_DELIVERY_RECEIPT,
    ESM_CLASS_UDHI, INTERFACE_VERSION_3_4, NPI_ISDN, STATUS_OK, TON_INTERNATIONAL,
};

/// Hex rendering for raw-byte session logs.
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_dump_formats_bytes() {
        assert_eq!(hex_dump(&[0x05, 0x00, 0x03]), "05 00 03");
        assert_eq!(hex_dump(&[]), "");
    }
}
