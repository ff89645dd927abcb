//! PDU bodies and the frame type exchanged with the carrier.

use std::io::Cursor;

use bytes::{Buf, BufMut, BytesMut};

use super::types::{CommandId, WireError};

/// Maximum accepted PDU size; anything larger is a broken peer.
pub const MAX_PDU_SIZE: u32 = 65_536;

/// Common 16-byte header. `command_length` is computed at encode time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PduHeader {
    pub command_id: u32,
    pub command_status: u32,
    pub sequence_number: u32,
}

impl PduHeader {
    pub const SIZE: usize = 16;

    pub fn new(command_id: CommandId, sequence_number: u32) -> Self {
        Self {
            command_id: command_id as u32,
            command_status: 0,
            sequence_number,
        }
    }

    pub fn with_status(command_id: CommandId, sequence_number: u32, status: u32) -> Self {
        Self {
            command_id: command_id as u32,
            command_status: status,
            sequence_number,
        }
    }
}

/// bind_transceiver body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindTransceiver {
    pub system_id: String,
    pub password: String,
    pub system_type: String,
    pub interface_version: u8,
    pub addr_ton: u8,
    pub addr_npi: u8,
    pub address_range: String,
}

/// bind_transceiver_resp body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindTransceiverResp {
    pub system_id: String,
}

/// submit_sm body, mandatory fields only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitSm {
    pub service_type: String,
    pub source_addr_ton: u8,
    pub source_addr_npi: u8,
    pub source_addr: String,
    pub dest_addr_ton: u8,
    pub dest_addr_npi: u8,
    pub dest_addr: String,
    pub esm_class: u8,
    pub protocol_id: u8,
    pub priority_flag: u8,
    pub schedule_delivery_time: String,
    pub validity_period: String,
    pub registered_delivery: u8,
    pub replace_if_present_flag: u8,
    pub data_coding: u8,
    pub sm_default_msg_id: u8,
    pub short_message: Vec<u8>,
}

/// submit_sm_resp body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitSmResp {
    pub message_id: String,
}

/// deliver_sm body; same layout as submit_sm.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliverSm {
    pub service_type: String,
    pub source_addr_ton: u8,
    pub source_addr_npi: u8,
    pub source_addr: String,
    pub dest_addr_ton: u8,
    pub dest_addr_npi: u8,
    pub dest_addr: String,
    pub esm_class: u8,
    pub protocol_id: u8,
    pub priority_flag: u8,
    pub schedule_delivery_time: String,
    pub validity_period: String,
    pub registered_delivery: u8,
    pub replace_if_present_flag: u8,
    pub data_coding: u8,
    pub sm_default_msg_id: u8,
    pub short_message: Vec<u8>,
}

/// deliver_sm_resp body; message_id is always empty on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliverSmResp {
    pub message_id: String,
}

/// Decoded PDU body.
#[derive(Debug, Clone, PartialEq)]
pub enum Pdu {
    BindTransceiver(BindTransceiver),
    BindTransceiverResp(BindTransceiverResp),
    SubmitSm(Box<SubmitSm>),
    SubmitSmResp(SubmitSmResp),
    DeliverSm(Box<DeliverSm>),
    DeliverSmResp(DeliverSmResp),
    Unbind,
    UnbindResp,
    EnquireLink,
    EnquireLinkResp,
    GenericNack,
    /// Forward compatibility: anything we do not speak is carried opaquely.
    Unknown { body: Vec<u8> },
}

/// One full PDU: header plus body.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub header: PduHeader,
    pub pdu: Pdu,
}

impl Frame {
    pub fn new(header: PduHeader, pdu: Pdu) -> Self {
        Self { header, pdu }
    }

    pub fn sequence(&self) -> u32 {
        self.header.sequence_number
    }

    pub fn status(&self) -> u32 {
        self.header.command_status
    }

    pub fn is_response(&self) -> bool {
        CommandId::is_response(self.header.command_id)
    }

    /// Encode this frame into `dst`, fixing up `command_length` at the end.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), WireError> {
        let start = dst.len();
        dst.put_u32(0); // command_length, patched below
        dst.put_u32(self.header.command_id);
        dst.put_u32(self.header.command_status);
        dst.put_u32(self.header.sequence_number);

        match &self.pdu {
            Pdu::BindTransceiver(bind) => {
                put_cstring(dst, &bind.system_id, 16, "system_id")?;
                put_cstring(dst, &bind.password, 9, "password")?;
                put_cstring(dst, &bind.system_type, 13, "system_type")?;
                dst.put_u8(bind.interface_version);
                dst.put_u8(bind.addr_ton);
                dst.put_u8(bind.addr_npi);
                put_cstring(dst, &bind.address_range, 41, "address_range")?;
            }
            Pdu::BindTransceiverResp(resp) => {
                put_cstring(dst, &resp.system_id, 16, "system_id")?;
            }
            Pdu::SubmitSm(submit) => {
                encode_sm_body(dst, SmBodyRef::from_submit(submit))?;
            }
            Pdu::SubmitSmResp(resp) => {
                put_cstring(dst, &resp.message_id, 65, "message_id")?;
            }
            Pdu::DeliverSm(deliver) => {
                encode_sm_body(dst, SmBodyRef::from_deliver(deliver))?;
            }
            Pdu::DeliverSmResp(resp) => {
                put_cstring(dst, &resp.message_id, 65, "message_id")?;
            }
            Pdu::Unbind
            | Pdu::UnbindResp
            | Pdu::EnquireLink
            | Pdu::EnquireLinkResp
            | Pdu::GenericNack => {}
            Pdu::Unknown { body } => dst.put_slice(body),
        }

        let length = (dst.len() - start) as u32;
        dst[start..start + 4].copy_from_slice(&length.to_be_bytes());
        Ok(())
    }

    /// Decode one complete PDU from `buf` (header included, exact length).
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let mut cur = Cursor::new(buf);
        if cur.remaining() < PduHeader::SIZE {
            return Err(WireError::Truncated { field: "header" });
        }

        let command_length = cur.get_u32();
        if (command_length as usize) != buf.len() {
            return Err(WireError::InvalidPduLength {
                length: command_length,
                min: PduHeader::SIZE as u32,
                max: MAX_PDU_SIZE,
            });
        }

        let header = PduHeader {
            command_id: cur.get_u32(),
            command_status: cur.get_u32(),
            sequence_number: cur.get_u32(),
        };

        let pdu = match CommandId::from_u32(header.command_id) {
            Some(CommandId::BindTransceiver) => Pdu::BindTransceiver(BindTransceiver {
                system_id: get_cstring(&mut cur, 16, "system_id")?,
                password: get_cstring(&mut cur, 9, "password")?,
                system_type: get_cstring(&mut cur, 13, "system_type")?,
                interface_version: get_u8(&mut cur, "interface_version")?,
                addr_ton: get_u8(&mut cur, "addr_ton")?,
                addr_npi: get_u8(&mut cur, "addr_npi")?,
                address_range: get_cstring(&mut cur, 41, "address_range")?,
            }),
            Some(CommandId::BindTransceiverResp) => {
                // Error responses may come with an empty body.
                let system_id = if cur.has_remaining() {
                    get_cstring(&mut cur, 16, "system_id")?
                } else {
                    String::new()
                };
                Pdu::BindTransceiverResp(BindTransceiverResp { system_id })
            }
            Some(CommandId::SubmitSm) => {
                let body = decode_sm_body(&mut cur)?;
                Pdu::SubmitSm(Box::new(body.into_submit()))
            }
            Some(CommandId::SubmitSmResp) => {
                let message_id = if cur.has_remaining() {
                    get_cstring(&mut cur, 65, "message_id")?
                } else {
                    String::new()
                };
                Pdu::SubmitSmResp(SubmitSmResp { message_id })
            }
            Some(CommandId::DeliverSm) => {
                let body = decode_sm_body(&mut cur)?;
                Pdu::DeliverSm(Box::new(body.into_deliver()))
            }
            Some(CommandId::DeliverSmResp) => {
                let message_id = if cur.has_remaining() {
                    get_cstring(&mut cur, 65, "message_id")?
                } else {
                    String::new()
                };
                Pdu::DeliverSmResp(DeliverSmResp { message_id })
            }
            Some(CommandId::Unbind) => Pdu::Unbind,
            Some(CommandId::UnbindResp) => Pdu::UnbindResp,
            Some(CommandId::EnquireLink) => Pdu::EnquireLink,
            Some(CommandId::EnquireLinkResp) => Pdu::EnquireLinkResp,
            Some(CommandId::GenericNack) => Pdu::GenericNack,
            None => {
                let mut body = vec![0u8; cur.remaining()];
                cur.copy_to_slice(&mut body);
                Pdu::Unknown { body }
            }
        };

        Ok(Frame { header, pdu })
    }
}

/// The shared submit_sm/deliver_sm mandatory-field layout.
struct SmBody {
    service_type: String,
    source_addr_ton: u8,
    source_addr_npi: u8,
    source_addr: String,
    dest_addr_ton: u8,
    dest_addr_npi: u8,
    dest_addr: String,
    esm_class: u8,
    protocol_id: u8,
    priority_flag: u8,
    schedule_delivery_time: String,
    validity_period: String,
    registered_delivery: u8,
    replace_if_present_flag: u8,
    data_coding: u8,
    sm_default_msg_id: u8,
    short_message: Vec<u8>,
}

impl SmBody {
    fn into_submit(self) -> SubmitSm {
        SubmitSm {
            service_type: self.service_type,
            source_addr_ton: self.source_addr_ton,
            source_addr_npi: self.source_addr_npi,
            source_addr: self.source_addr,
            dest_addr_ton: self.dest_addr_ton,
            dest_addr_npi: self.dest_addr_npi,
            dest_addr: self.dest_addr,
            esm_class: self.esm_class,
            protocol_id: self.protocol_id,
            priority_flag: self.priority_flag,
            schedule_delivery_time: self.schedule_delivery_time,
            validity_period: self.validity_period,
            registered_delivery: self.registered_delivery,
            replace_if_present_flag: self.replace_if_present_flag,
            data_coding: self.data_coding,
            sm_default_msg_id: self.sm_default_msg_id,
            short_message: self.short_message,
        }
    }

    fn into_deliver(self) -> DeliverSm {
        DeliverSm {
            service_type: self.service_type,
            source_addr_ton: self.source_addr_ton,
            source_addr_npi: self.source_addr_npi,
            source_addr: self.source_addr,
            dest_addr_ton: self.dest_addr_ton,
            dest_addr_npi: self.dest_addr_npi,
            dest_addr: self.dest_addr,
            esm_class: self.esm_class,
            protocol_id: self.protocol_id,
            priority_flag: self.priority_flag,
            schedule_delivery_time: self.schedule_delivery_time,
            validity_period: self.validity_period,
            registered_delivery: self.registered_delivery,
            replace_if_present_flag: self.replace_if_present_flag,
            data_coding: self.data_coding,
            sm_default_msg_id: self.sm_default_msg_id,
            short_message: self.short_message,
        }
    }
}

struct SmBodyRef<'a> {
    service_type: &'a str,
    source_addr_ton: u8,
    source_addr_npi: u8,
    source_addr: &'a str,
    dest_addr_ton: u8,
    dest_addr_npi: u8,
    dest_addr: &'a str,
    esm_class: u8,
    protocol_id: u8,
    priority_flag: u8,
    schedule_delivery_time: &'a str,
    validity_period: &'a str,
    registered_delivery: u8,
    replace_if_present_flag: u8,
    data_coding: u8,
    sm_default_msg_id: u8,
    short_message: &'a [u8],
}

impl<'a> SmBodyRef<'a> {
    fn from_submit(s: &'a SubmitSm) -> Self {
        Self {
            service_type: &s.service_type,
            source_addr_ton: s.source_addr_ton,
            source_addr_npi: s.source_addr_npi,
            source_addr: &s.source_addr,
            dest_addr_ton: s.dest_addr_ton,
            dest_addr_npi: s.dest_addr_npi,
            dest_addr: &s.dest_addr,
            esm_class: s.esm_class,
            protocol_id: s.protocol_id,
            priority_flag: s.priority_flag,
            schedule_delivery_time: &s.schedule_delivery_time,
            validity_period: &s.validity_period,
            registered_delivery: s.registered_delivery,
            replace_if_present_flag: s.replace_if_present_flag,
            data_coding: s.data_coding,
            sm_default_msg_id: s.sm_default_msg_id,
            short_message: &s.short_message,
        }
    }

    fn from_deliver(d: &'a DeliverSm) -> Self {
        Self {
            service_type: &d.service_type,
            source_addr_ton: d.source_addr_ton,
            source_addr_npi: d.source_addr_npi,
            source_addr: &d.source_addr,
            dest_addr_ton: d.dest_addr_ton,
            dest_addr_npi: d.dest_addr_npi,
            dest_addr: &d.dest_addr,
            esm_class: d.esm_class,
            protocol_id: d.protocol_id,
            priority_flag: d.priority_flag,
            schedule_delivery_time: &d.schedule_delivery_time,
            validity_period: &d.validity_period,
            registered_delivery: d.registered_delivery,
            replace_if_present_flag: d.replace_if_present_flag,
            data_coding: d.data_coding,
            sm_default_msg_id: d.sm_default_msg_id,
            short_message: &d.short_message,
        }
    }
}

fn encode_sm_body(dst: &mut BytesMut, body: SmBodyRef<'_>) -> Result<(), WireError> {
    put_cstring(dst, body.service_type, 6, "service_type")?;
    dst.put_u8(body.source_addr_ton);
    dst.put_u8(body.source_addr_npi);
    put_cstring(dst, body.source_addr, 21, "source_addr")?;
    dst.put_u8(body.dest_addr_ton);
    dst.put_u8(body.dest_addr_npi);
    put_cstring(dst, body.dest_addr, 21, "dest_addr")?;
    dst.put_u8(body.esm_class);
    dst.put_u8(body.protocol_id);
    dst.put_u8(body.priority_flag);
    put_cstring(dst, body.schedule_delivery_time, 17, "schedule_delivery_time")?;
    put_cstring(dst, body.validity_period, 17, "validity_period")?;
    dst.put_u8(body.registered_delivery);
    dst.put_u8(body.replace_if_present_flag);
    dst.put_u8(body.data_coding);
    dst.put_u8(body.sm_default_msg_id);
    if body.short_message.len() > 254 {
        return Err(WireError::FieldTooLong {
            field: "short_message",
            max: 254,
        });
    }
    dst.put_u8(body.short_message.len() as u8);
    dst.put_slice(body.short_message);
    Ok(())
}

fn decode_sm_body(cur: &mut Cursor<&[u8]>) -> Result<SmBody, WireError> {
    let service_type = get_cstring(cur, 6, "service_type")?;
    let source_addr_ton = get_u8(cur, "source_addr_ton")?;
    let source_addr_npi = get_u8(cur, "source_addr_npi")?;
    let source_addr = get_cstring(cur, 21, "source_addr")?;
    let dest_addr_ton = get_u8(cur, "dest_addr_ton")?;
    let dest_addr_npi = get_u8(cur, "dest_addr_npi")?;
    let dest_addr = get_cstring(cur, 21, "dest_addr")?;
    let esm_class = get_u8(cur, "esm_class")?;
    let protocol_id = get_u8(cur, "protocol_id")?;
    let priority_flag = get_u8(cur, "priority_flag")?;
    let schedule_delivery_time = get_cstring(cur, 17, "schedule_delivery_time")?;
    let validity_period = get_cstring(cur, 17, "validity_period")?;
    let registered_delivery = get_u8(cur, "registered_delivery")?;
    let replace_if_present_flag = get_u8(cur, "replace_if_present_flag")?;
    let data_coding = get_u8(cur, "data_coding")?;
    let sm_default_msg_id = get_u8(cur, "sm_default_msg_id")?;
    let sm_length = get_u8(cur, "sm_length")? as usize;
    if cur.remaining() < sm_length {
        return Err(WireError::Truncated {
            field: "short_message",
        });
    }
    let mut short_message = vec![0u8; sm_length];
    cur.copy_to_slice(&mut short_message);

    Ok(SmBody {
        service_type,
        source_addr_ton,
        source_addr_npi,
        source_addr,
        dest_addr_ton,
        dest_addr_npi,
        dest_addr,
        esm_class,
        protocol_id,
        priority_flag,
        schedule_delivery_time,
        validity_period,
        registered_delivery,
        replace_if_present_flag,
        data_coding,
        sm_default_msg_id,
        short_message,
    })
}

/// Write a variable-length C-octet string: content bytes plus NUL terminator.
fn put_cstring(
    dst: &mut BytesMut,
    value: &str,
    max: usize,
    field: &'static str,
) -> Result<(), WireError> {
    let bytes = value.as_bytes();
    if bytes.len() + 1 > max {
        return Err(WireError::FieldTooLong { field, max });
    }
    dst.put_slice(bytes);
    dst.put_u8(0);
    Ok(())
}

/// Read a variable-length C-octet string bounded by `max` bytes (NUL included).
fn get_cstring(
    cur: &mut Cursor<&[u8]>,
    max: usize,
    field: &'static str,
) -> Result<String, WireError> {
    let buf = *cur.get_ref();
    let start = cur.position() as usize;
    let limit = (start + max).min(buf.len());

    let Some(end) = buf[start..limit].iter().position(|&b| b == 0) else {
        return Err(if limit == buf.len() {
            WireError::Truncated { field }
        } else {
            WireError::Unterminated { field }
        });
    };

    let value = String::from_utf8_lossy(&buf[start..start + end]).into_owned();
    cur.set_position((start + end + 1) as u64);
    Ok(value)
}

fn get_u8(cur: &mut Cursor<&[u8]>, field: &'static str) -> Result<u8, WireError> {
    if !cur.has_remaining() {
        return Err(WireError::Truncated { field });
    }
    Ok(cur.get_u8())
}
