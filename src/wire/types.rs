//! Command identifiers, status codes and field constants.

use thiserror::Error;

/// SMPP interface version negotiated at bind time.
pub const INTERFACE_VERSION_3_4: u8 = 0x34;

/// `command_status` for an accepted request.
pub const STATUS_OK: u32 = 0x0000_0000;

/// Type of number used for both source and destination addresses.
pub const TON_INTERNATIONAL: u8 = 0x01;

/// Numbering plan indicator used for both source and destination addresses.
pub const NPI_ISDN: u8 = 0x01;

/// `esm_class` for a plain single-segment submit.
pub const ESM_CLASS_DEFAULT: u8 = 0x00;

/// `esm_class` bit marking a UDH-prefixed short message.
pub const ESM_CLASS_UDHI: u8 = 0x40;

/// `esm_class` bit marking an inbound deliver_sm as a delivery receipt.
pub const ESM_CLASS_DELIVERY_RECEIPT: u8 = 0x04;

/// Command identifiers for the PDUs this gateway speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum CommandId {
    GenericNack = 0x8000_0000,
    SubmitSm = 0x0000_0004,
    SubmitSmResp = 0x8000_0004,
    DeliverSm = 0x0000_0005,
    DeliverSmResp = 0x8000_0005,
    Unbind = 0x0000_0006,
    UnbindResp = 0x8000_0006,
    BindTransceiver = 0x0000_0009,
    BindTransceiverResp = 0x8000_0009,
    EnquireLink = 0x0000_0015,
    EnquireLinkResp = 0x8000_0015,
}

impl CommandId {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            0x8000_0000 => Self::GenericNack,
            0x0000_0004 => Self::SubmitSm,
            0x8000_0004 => Self::SubmitSmResp,
            0x0000_0005 => Self::DeliverSm,
            0x8000_0005 => Self::DeliverSmResp,
            0x0000_0006 => Self::Unbind,
            0x8000_0006 => Self::UnbindResp,
            0x0000_0009 => Self::BindTransceiver,
            0x8000_0009 => Self::BindTransceiverResp,
            0x0000_0015 => Self::EnquireLink,
            0x8000_0015 => Self::EnquireLinkResp,
            _ => return None,
        })
    }

    /// Responses have the high bit of the command id set.
    pub fn is_response(raw: u32) -> bool {
        raw & 0x8000_0000 != 0
    }
}

/// Short description of a command_status, used in logs and persisted
/// response texts.
pub fn status_text(status: u32) -> &'static str {
    match status {
        0x0000_0000 => "OK",
        0x0000_0001 => "ESME_RINVMSGLEN",
        0x0000_0002 => "ESME_RINVCMDLEN",
        0x0000_0003 => "ESME_RINVCMDID",
        0x0000_0004 => "ESME_RINVBNDSTS",
        0x0000_0005 => "ESME_RALYBND",
        0x0000_0008 => "ESME_RSYSERR",
        0x0000_000A => "ESME_RINVSRCADR",
        0x0000_000B => "ESME_RINVDSTADR",
        0x0000_000C => "ESME_RINVMSGID",
        0x0000_000D => "ESME_RBINDFAIL",
        0x0000_000E => "ESME_RINVPASWD",
        0x0000_0014 => "ESME_RMSGQFUL",
        0x0000_0058 => "ESME_RTHROTTLED",
        0x0000_0061 => "ESME_RINVSCHED",
        0x0000_0062 => "ESME_RINVEXPIRY",
        0x0000_00FE => "ESME_RDELIVERYFAILURE",
        0x0000_00FF => "ESME_RUNKNOWNERR",
        _ => "ESTADO_DESCONOCIDO",
    }
}

/// Wire-level errors with enough context to diagnose a broken peer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("invalid PDU length {length}, must be {min}-{max}")]
    InvalidPduLength { length: u32, min: u32, max: u32 },

    #[error("truncated PDU while reading field '{field}'")]
    Truncated { field: &'static str },

    #[error("unterminated C-octet string in field '{field}'")]
    Unterminated { field: &'static str },

    #[error("field '{field}' exceeds maximum length {max}")]
    FieldTooLong { field: &'static str, max: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
