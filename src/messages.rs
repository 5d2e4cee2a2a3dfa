//! # Wire Protocol Messages
//!
//! This module defines the VRR wire format: a fixed 24-byte header followed by
//! a per-type payload, all integer fields in network byte order with no
//! padding.
//!
//! ## Header Layout
//!
//! ```text
//! version (1) || pkt_type (1) || protocol (2) || payload_len (2)
//! || reserved (2) || checksum (2) || src_id (4) || dest_id (4)
//! || dest_link (6)
//! ```
//!
//! The checksum is the 16-bit ones'-complement sum over the header with the
//! checksum field zeroed. The destination link address is part of the header
//! so that relays can rewrite the next hop without re-framing; HELLO packets
//! carry the broadcast address there.
//!
//! ## Payload Layouts (u32 fields, network order)
//!
//! | Type       | Fields |
//! |------------|--------|
//! | DATA       | opaque bytes |
//! | HELLO      | active, la_size, lna_size, p_size, then the three id lists |
//! | SETUP_REQ  | proxy, vset_size, vset ids |
//! | SETUP      | path_id, proxy, vset_size, vset ids |
//! | SETUP_FAIL | proxy, vset_size, vset ids |
//! | TEARDOWN   | endpoint, path_id, vset_size, vset ids |
//!
//! ## Security Limits
//!
//! Every declared list size is validated against its protocol bound
//! ([`WireLimits`]) *before* any allocation happens. A size above the bound is
//! a decode failure, never an attacker-controlled allocation.

use thiserror::Error;

use crate::identity::{LinkAddr, NodeId};

/// Protocol version carried in every header.
pub const VRR_VERSION: u8 = 1;

/// Protocol tag carried in the header's protocol field.
pub const VRR_PROTOCOL: u16 = 27;

/// Ethertype under which VRR frames travel on the link layer.
pub const ETHERTYPE_VRR: u16 = 0x8777;

/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 24;

/// The six packet types, in wire order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Data = 0,
    Hello = 1,
    SetupReq = 2,
    Setup = 3,
    SetupFail = 4,
    Teardown = 5,
}

impl PacketType {
    fn from_wire(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Data),
            1 => Some(Self::Hello),
            2 => Some(Self::SetupReq),
            3 => Some(Self::Setup),
            4 => Some(Self::SetupFail),
            5 => Some(Self::Teardown),
            _ => None,
        }
    }
}

/// Wire-format bounds derived from the node configuration.
///
/// `max_pset_list` bounds each of the three HELLO id lists; `max_vset_list`
/// bounds the vset list carried by setup and teardown packets.
#[derive(Clone, Copy, Debug)]
pub struct WireLimits {
    pub max_pset_list: usize,
    pub max_vset_list: usize,
}

impl Default for WireLimits {
    fn default() -> Self {
        Self {
            max_pset_list: 20,
            max_vset_list: 4,
        }
    }
}

/// Decoded header fields relevant to dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub pkt_type: PacketType,
    pub src: NodeId,
    pub dst: NodeId,
    pub dest_link: LinkAddr,
}

/// Decoded per-type payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Data(Vec<u8>),
    Hello {
        active: bool,
        linked_active: Vec<NodeId>,
        linked_inactive: Vec<NodeId>,
        pending: Vec<NodeId>,
    },
    SetupReq {
        proxy: NodeId,
        vset: Vec<NodeId>,
    },
    Setup {
        path_id: u32,
        proxy: NodeId,
        vset: Vec<NodeId>,
    },
    SetupFail {
        proxy: NodeId,
        vset: Vec<NodeId>,
    },
    Teardown {
        endpoint: NodeId,
        path_id: u32,
        vset: Vec<NodeId>,
    },
}

impl Payload {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Payload::Data(_) => PacketType::Data,
            Payload::Hello { .. } => PacketType::Hello,
            Payload::SetupReq { .. } => PacketType::SetupReq,
            Payload::Setup { .. } => PacketType::Setup,
            Payload::SetupFail { .. } => PacketType::SetupFail,
            Payload::Teardown { .. } => PacketType::Teardown,
        }
    }
}

/// Structural decode failures. All of them drop the frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("buffer shorter than expected")]
    Truncated,
    #[error("unsupported version {0}")]
    BadVersion(u8),
    #[error("unknown packet type {0}")]
    BadType(u8),
    #[error("unknown protocol tag {0}")]
    BadProtocol(u16),
    #[error("declared payload length {declared} exceeds buffer ({available})")]
    BadLength { declared: usize, available: usize },
    #[error("declared list size {len} exceeds protocol bound {max}")]
    OversizedList { len: usize, max: usize },
    #[error("header checksum mismatch")]
    BadChecksum,
}

/// 16-bit ones'-complement sum over `buf`, carries folded back in.
fn header_checksum(buf: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = buf.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_ids(buf: &mut Vec<u8>, ids: &[NodeId]) {
    for id in ids {
        put_u32(buf, id.raw());
    }
}

/// Encode a packet: header fields plus payload into one owned buffer.
pub fn encode(src: NodeId, dst: NodeId, dest_link: LinkAddr, payload: &Payload) -> Vec<u8> {
    let mut body = Vec::new();
    match payload {
        Payload::Data(data) => body.extend_from_slice(data),
        Payload::Hello {
            active,
            linked_active,
            linked_inactive,
            pending,
        } => {
            put_u32(&mut body, u32::from(*active));
            put_u32(&mut body, linked_active.len() as u32);
            put_u32(&mut body, linked_inactive.len() as u32);
            put_u32(&mut body, pending.len() as u32);
            put_ids(&mut body, linked_active);
            put_ids(&mut body, linked_inactive);
            put_ids(&mut body, pending);
        }
        Payload::SetupReq { proxy, vset } => {
            put_u32(&mut body, proxy.raw());
            put_u32(&mut body, vset.len() as u32);
            put_ids(&mut body, vset);
        }
        Payload::Setup {
            path_id,
            proxy,
            vset,
        } => {
            put_u32(&mut body, *path_id);
            put_u32(&mut body, proxy.raw());
            put_u32(&mut body, vset.len() as u32);
            put_ids(&mut body, vset);
        }
        Payload::SetupFail { proxy, vset } => {
            put_u32(&mut body, proxy.raw());
            put_u32(&mut body, vset.len() as u32);
            put_ids(&mut body, vset);
        }
        Payload::Teardown {
            endpoint,
            path_id,
            vset,
        } => {
            put_u32(&mut body, endpoint.raw());
            put_u32(&mut body, *path_id);
            put_u32(&mut body, vset.len() as u32);
            put_ids(&mut body, vset);
        }
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
    buf.push(VRR_VERSION);
    buf.push(payload.packet_type() as u8);
    buf.extend_from_slice(&VRR_PROTOCOL.to_be_bytes());
    buf.extend_from_slice(&(body.len() as u16).to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes()); // reserved
    buf.extend_from_slice(&0u16.to_be_bytes()); // checksum placeholder
    buf.extend_from_slice(&src.raw().to_be_bytes());
    buf.extend_from_slice(&dst.raw().to_be_bytes());
    buf.extend_from_slice(dest_link.as_bytes());

    let csum = header_checksum(&buf[..HEADER_LEN]);
    buf[8..10].copy_from_slice(&csum.to_be_bytes());

    buf.extend_from_slice(&body);
    buf
}

/// Cursor over a received payload.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        if self.pos + 4 > self.buf.len() {
            return Err(DecodeError::Truncated);
        }
        let v = u32::from_be_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    fn read_id(&mut self) -> Result<NodeId, DecodeError> {
        Ok(NodeId::new(self.read_u32()?))
    }

    /// Read a size field, validate it against `max`, then read that many ids.
    fn read_id_list(&mut self, len: usize, max: usize) -> Result<Vec<NodeId>, DecodeError> {
        if len > max {
            return Err(DecodeError::OversizedList { len, max });
        }
        let mut ids = Vec::with_capacity(len);
        for _ in 0..len {
            ids.push(self.read_id()?);
        }
        Ok(ids)
    }

    fn read_size(&mut self) -> Result<usize, DecodeError> {
        Ok(self.read_u32()? as usize)
    }
}

/// Decode a received frame body into header and payload.
///
/// Trailing bytes beyond the declared payload length are tolerated (links may
/// pad short frames); everything else that deviates from the format is an
/// error and the caller drops the frame without touching any state.
pub fn decode(buf: &[u8], limits: WireLimits) -> Result<(Header, Payload), DecodeError> {
    if buf.len() < HEADER_LEN {
        return Err(DecodeError::Truncated);
    }

    let version = buf[0];
    if version != VRR_VERSION {
        return Err(DecodeError::BadVersion(version));
    }
    let pkt_type = PacketType::from_wire(buf[1]).ok_or(DecodeError::BadType(buf[1]))?;
    let protocol = u16::from_be_bytes([buf[2], buf[3]]);
    if protocol != VRR_PROTOCOL {
        return Err(DecodeError::BadProtocol(protocol));
    }
    let declared = u16::from_be_bytes([buf[4], buf[5]]) as usize;
    let available = buf.len() - HEADER_LEN;
    if declared > available {
        return Err(DecodeError::BadLength {
            declared,
            available,
        });
    }

    let mut header_bytes = [0u8; HEADER_LEN];
    header_bytes.copy_from_slice(&buf[..HEADER_LEN]);
    let wire_csum = u16::from_be_bytes([header_bytes[8], header_bytes[9]]);
    header_bytes[8] = 0;
    header_bytes[9] = 0;
    if header_checksum(&header_bytes) != wire_csum {
        return Err(DecodeError::BadChecksum);
    }

    let src = NodeId::new(u32::from_be_bytes(buf[10..14].try_into().unwrap()));
    let dst = NodeId::new(u32::from_be_bytes(buf[14..18].try_into().unwrap()));
    let dest_link = LinkAddr::from_bytes(buf[18..24].try_into().unwrap());

    let header = Header {
        version,
        pkt_type,
        src,
        dst,
        dest_link,
    };

    let body = &buf[HEADER_LEN..HEADER_LEN + declared];
    let mut r = Reader::new(body);

    let payload = match pkt_type {
        PacketType::Data => Payload::Data(body.to_vec()),
        PacketType::Hello => {
            let active = r.read_u32()? != 0;
            let la_size = r.read_size()?;
            let lna_size = r.read_size()?;
            let p_size = r.read_size()?;
            let linked_active = r.read_id_list(la_size, limits.max_pset_list)?;
            let linked_inactive = r.read_id_list(lna_size, limits.max_pset_list)?;
            let pending = r.read_id_list(p_size, limits.max_pset_list)?;
            Payload::Hello {
                active,
                linked_active,
                linked_inactive,
                pending,
            }
        }
        PacketType::SetupReq => {
            let proxy = r.read_id()?;
            let size = r.read_size()?;
            let vset = r.read_id_list(size, limits.max_vset_list)?;
            Payload::SetupReq { proxy, vset }
        }
        PacketType::Setup => {
            let path_id = r.read_u32()?;
            let proxy = r.read_id()?;
            let size = r.read_size()?;
            let vset = r.read_id_list(size, limits.max_vset_list)?;
            Payload::Setup {
                path_id,
                proxy,
                vset,
            }
        }
        PacketType::SetupFail => {
            let proxy = r.read_id()?;
            let size = r.read_size()?;
            let vset = r.read_id_list(size, limits.max_vset_list)?;
            Payload::SetupFail { proxy, vset }
        }
        PacketType::Teardown => {
            let endpoint = r.read_id()?;
            let path_id = r.read_u32()?;
            let size = r.read_size()?;
            let vset = r.read_id_list(size, limits.max_vset_list)?;
            Payload::Teardown {
                endpoint,
                path_id,
                vset,
            }
        }
    };

    Ok((header, payload))
}
