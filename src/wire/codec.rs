//! Length-prefixed framing for use with `tokio_util::codec::Framed`.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use super::hex_dump;
use super::pdu::{Frame, PduHeader, MAX_PDU_SIZE};
use super::types::WireError;

/// Stateless SMPP frame codec.
///
/// When `log_bytes` is set, every frame is hex-dumped at trace level under
/// the owning session's name.
#[derive(Debug)]
pub struct SmppCodec {
    session_name: String,
    log_bytes: bool,
}

impl SmppCodec {
    pub fn new(session_name: impl Into<String>, log_bytes: bool) -> Self {
        Self {
            session_name: session_name.into(),
            log_bytes,
        }
    }
}

impl Decoder for SmppCodec {
    type Item = Frame;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        if src.len() < PduHeader::SIZE {
            return Ok(None);
        }

        let command_length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if command_length < PduHeader::SIZE as u32 || command_length > MAX_PDU_SIZE {
            return Err(WireError::InvalidPduLength {
                length: command_length,
                min: PduHeader::SIZE as u32,
                max: MAX_PDU_SIZE,
            });
        }

        let total = command_length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let raw = src.copy_to_bytes(total);
        if self.log_bytes {
            trace!(session = %self.session_name, bytes = %hex_dump(&raw), "rx pdu");
        }

        Frame::decode(&raw).map(Some)
    }
}

impl Encoder<Frame> for SmppCodec {
    type Error = WireError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), WireError> {
        let start = dst.len();
        item.encode(dst)?;
        if self.log_bytes {
            trace!(session = %self.session_name, bytes = %hex_dump(&dst[start..]), "tx pdu");
        }
        Ok(())
    }
}
