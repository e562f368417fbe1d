use crate::crc::body_crc;
use crate::{DecodeError, MAX_BODY_LEN};

/// Branch/sink device GUID as carried in LINK_ADDRESS traffic.
pub type Guid = [u8; 16];

pub const REQ_LINK_ADDRESS: u8 = 0x01;
pub const REQ_ENUM_PATH_RESOURCES: u8 = 0x10;
pub const REQ_ALLOCATE_PAYLOAD: u8 = 0x11;
pub const REQ_CLEAR_PAYLOAD_ID_TABLE: u8 = 0x14;

/// Downstream requests the source originates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidebandRequest {
    LinkAddress,
    EnumPathResources { port_number: u8 },
    AllocatePayload { port_number: u8, vcpi: u8, pbn: u16 },
    ClearPayloadIdTable,
}

impl SidebandRequest {
    pub fn request_type(&self) -> u8 {
        match self {
            SidebandRequest::LinkAddress => REQ_LINK_ADDRESS,
            SidebandRequest::EnumPathResources { .. } => REQ_ENUM_PATH_RESOURCES,
            SidebandRequest::AllocatePayload { .. } => REQ_ALLOCATE_PAYLOAD,
            SidebandRequest::ClearPayloadIdTable => REQ_CLEAR_PAYLOAD_ID_TABLE,
        }
    }

    /// CLEAR_PAYLOAD_ID_TABLE is a broadcast path message; everything else is
    /// unicast.
    pub fn is_broadcast(&self) -> bool {
        matches!(self, SidebandRequest::ClearPayloadIdTable)
    }

    /// Serializes the request body, appending the trailing body CRC byte.
    pub fn encode_body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(8);
        body.push(self.request_type());
        match *self {
            SidebandRequest::LinkAddress | SidebandRequest::ClearPayloadIdTable => {}
            SidebandRequest::EnumPathResources { port_number } => {
                body.push((port_number & 0xf) << 4);
            }
            SidebandRequest::AllocatePayload {
                port_number,
                vcpi,
                pbn,
            } => {
                // No SDP streams: the low nibble of the port byte stays 0.
                body.push((port_number & 0xf) << 4);
                body.push(vcpi & 0x7f);
                body.extend_from_slice(&pbn.to_be_bytes());
            }
        }
        body.push(body_crc(&body));
        debug_assert!(body.len() <= MAX_BODY_LEN);
        body
    }
}

/// Verifies the trailing body CRC of a single chunk and returns the body
/// bytes without it.
pub fn strip_body_crc(chunk: &[u8]) -> Result<&[u8], DecodeError> {
    let (payload, crc) = match chunk.split_last() {
        Some((crc, payload)) if !payload.is_empty() => (payload, *crc),
        _ => {
            return Err(DecodeError::TooShort {
                needed: 2,
                actual: chunk.len(),
            })
        }
    };
    let expected = body_crc(payload);
    if expected != crc {
        return Err(DecodeError::BodyCrc {
            expected,
            actual: crc,
        });
    }
    Ok(payload)
}

/// Downstream peer device type nibble from a LINK_ADDRESS reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerDeviceType {
    None,
    SourceOrSst,
    MstBranching,
    SstSink,
    DpLegacyConverter,
    Unknown(u8),
}

impl From<u8> for PeerDeviceType {
    fn from(raw: u8) -> Self {
        match raw {
            0x0 => PeerDeviceType::None,
            0x1 => PeerDeviceType::SourceOrSst,
            0x2 => PeerDeviceType::MstBranching,
            0x3 => PeerDeviceType::SstSink,
            0x4 => PeerDeviceType::DpLegacyConverter,
            other => PeerDeviceType::Unknown(other),
        }
    }
}

/// One port entry from a LINK_ADDRESS reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortInfo {
    pub input_port: bool,
    pub peer_device_type: PeerDeviceType,
    pub port_number: u8,
    /// Message capability status: the peer is itself a sideband concentrator.
    pub message_capable: bool,
    /// DisplayPort device plug status.
    pub plugged: bool,
    pub legacy_plugged: bool,
    /// Present for output ports only.
    pub dpcd_revision: u8,
    pub peer_guid: Guid,
    pub num_sdp_streams: u8,
    pub num_sdp_stream_sinks: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkAddressReply {
    pub guid: Guid,
    pub ports: Vec<PortInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnumPathResourcesReply {
    pub port_number: u8,
    pub full_pbn: u16,
    pub available_pbn: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatePayloadReply {
    pub port_number: u8,
    pub vcpi: u8,
    pub allocated_pbn: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NakReply {
    pub guid: Guid,
    pub reason: u8,
    pub nak_data: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SidebandReply {
    LinkAddress(LinkAddressReply),
    EnumPathResources(EnumPathResourcesReply),
    AllocatePayload(AllocatePayloadReply),
    ClearPayloadIdTable,
    Nak { request_type: u8, nak: NakReply },
}

impl SidebandReply {
    /// Request type this reply answers (low 7 bits of the first body byte).
    pub fn request_type(&self) -> u8 {
        match self {
            SidebandReply::LinkAddress(_) => REQ_LINK_ADDRESS,
            SidebandReply::EnumPathResources(_) => REQ_ENUM_PATH_RESOURCES,
            SidebandReply::AllocatePayload(_) => REQ_ALLOCATE_PAYLOAD,
            SidebandReply::ClearPayloadIdTable => REQ_CLEAR_PAYLOAD_ID_TABLE,
            SidebandReply::Nak { request_type, .. } => *request_type,
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self.buf.get(self.pos).ok_or(DecodeError::TooShort {
            needed: self.pos + 1,
            actual: self.buf.len(),
        })?;
        self.pos += 1;
        Ok(b)
    }

    fn u16_be(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes([self.u8()?, self.u8()?]))
    }

    fn guid(&mut self) -> Result<Guid, DecodeError> {
        let mut g = [0u8; 16];
        for byte in &mut g {
            *byte = self.u8()?;
        }
        Ok(g)
    }
}

/// Parses a fully reassembled reply body (all chunk CRCs already stripped).
pub fn parse_reply(body: &[u8]) -> Result<SidebandReply, DecodeError> {
    let mut r = Reader::new(body);
    let first = r.u8()?;
    let request_type = first & 0x7f;
    if first & 0x80 != 0 {
        // NAK reply: replying device GUID, reason, NAK data.
        let nak = NakReply {
            guid: r.guid()?,
            reason: r.u8()?,
            nak_data: r.u8()?,
        };
        return Ok(SidebandReply::Nak { request_type, nak });
    }
    match request_type {
        REQ_LINK_ADDRESS => parse_link_address(&mut r),
        REQ_ENUM_PATH_RESOURCES => {
            let port_byte = r.u8()?;
            Ok(SidebandReply::EnumPathResources(EnumPathResourcesReply {
                port_number: port_byte >> 4,
                full_pbn: r.u16_be()?,
                available_pbn: r.u16_be()?,
            }))
        }
        REQ_ALLOCATE_PAYLOAD => {
            let port_byte = r.u8()?;
            Ok(SidebandReply::AllocatePayload(AllocatePayloadReply {
                port_number: port_byte >> 4,
                vcpi: r.u8()? & 0x7f,
                allocated_pbn: r.u16_be()?,
            }))
        }
        REQ_CLEAR_PAYLOAD_ID_TABLE => Ok(SidebandReply::ClearPayloadIdTable),
        other => Err(DecodeError::UnknownRequestType {
            request_type: other,
        }),
    }
}

fn parse_link_address(r: &mut Reader<'_>) -> Result<SidebandReply, DecodeError> {
    let guid = r.guid()?;
    let nports = usize::from(r.u8()? & 0xf);
    let mut ports = Vec::with_capacity(nports);
    for _ in 0..nports {
        let first = r.u8()?;
        let input_port = first & 0x80 != 0;
        let second = r.u8()?;
        let mut port = PortInfo {
            input_port,
            peer_device_type: PeerDeviceType::from((first >> 4) & 0x7),
            port_number: first & 0xf,
            message_capable: second & 0x80 != 0,
            plugged: second & 0x40 != 0,
            legacy_plugged: false,
            dpcd_revision: 0,
            peer_guid: [0; 16],
            num_sdp_streams: 0,
            num_sdp_stream_sinks: 0,
        };
        if !input_port {
            port.legacy_plugged = second & 0x20 != 0;
            port.dpcd_revision = r.u8()?;
            port.peer_guid = r.guid()?;
            let sdp = r.u8()?;
            port.num_sdp_streams = sdp >> 4;
            port.num_sdp_stream_sinks = sdp & 0xf;
        }
        ports.push(port);
    }
    Ok(SidebandReply::LinkAddress(LinkAddressReply { guid, ports }))
}

/// Serializes an ACK reply body for `reply` without the trailing CRC.
///
/// The driver never sends replies; this exists so tests (and the simulated
/// sink they drive) can produce wire-exact branch responses with the same
/// codec that parses them.
pub fn encode_reply(reply: &SidebandReply) -> Vec<u8> {
    let mut body = Vec::new();
    match reply {
        SidebandReply::LinkAddress(rep) => {
            body.push(REQ_LINK_ADDRESS);
            body.extend_from_slice(&rep.guid);
            body.push(rep.ports.len() as u8);
            for port in &rep.ports {
                let peer: u8 = match port.peer_device_type {
                    PeerDeviceType::None => 0x0,
                    PeerDeviceType::SourceOrSst => 0x1,
                    PeerDeviceType::MstBranching => 0x2,
                    PeerDeviceType::SstSink => 0x3,
                    PeerDeviceType::DpLegacyConverter => 0x4,
                    PeerDeviceType::Unknown(raw) => raw,
                };
                body.push(
                    (u8::from(port.input_port) << 7) | ((peer & 0x7) << 4) | (port.port_number & 0xf),
                );
                body.push(
                    (u8::from(port.message_capable) << 7)
                        | (u8::from(port.plugged) << 6)
                        | (u8::from(port.legacy_plugged) << 5),
                );
                if !port.input_port {
                    body.push(port.dpcd_revision);
                    body.extend_from_slice(&port.peer_guid);
                    body.push((port.num_sdp_streams << 4) | (port.num_sdp_stream_sinks & 0xf));
                }
            }
        }
        SidebandReply::EnumPathResources(rep) => {
            body.push(REQ_ENUM_PATH_RESOURCES);
            body.push(rep.port_number << 4);
            body.extend_from_slice(&rep.full_pbn.to_be_bytes());
            body.extend_from_slice(&rep.available_pbn.to_be_bytes());
        }
        SidebandReply::AllocatePayload(rep) => {
            body.push(REQ_ALLOCATE_PAYLOAD);
            body.push(rep.port_number << 4);
            body.push(rep.vcpi & 0x7f);
            body.extend_from_slice(&rep.allocated_pbn.to_be_bytes());
        }
        SidebandReply::ClearPayloadIdTable => body.push(REQ_CLEAR_PAYLOAD_ID_TABLE),
        SidebandReply::Nak { request_type, nak } => {
            body.push(0x80 | (request_type & 0x7f));
            body.extend_from_slice(&nak.guid);
            body.push(nak.reason);
            body.push(nak.nak_data);
        }
    }
    body
}
