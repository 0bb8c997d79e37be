//! Payload layouts of the control messages.
//!
//! All integers are big-endian. Readers take the payload (the bytes after the header) and
//! return `None` for anything malformed, the caller drops the datagram.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use super::{canonical, read_type, Family, MeshId, HEADER_LEN, ID_LEN, TYPE_LEN};

pub const TIMESTAMP_LEN: usize = 8;
pub const HEARTBEAT_LEN: usize = TIMESTAMP_LEN;
pub const HEARTBEAT_REPLY_LEN: usize = 2 * TIMESTAMP_LEN;

const PORT_LEN: usize = 2;
const V4_ENTRY_LEN: usize = 4 + PORT_LEN;
const V6_ENTRY_LEN: usize = 16 + PORT_LEN;

/// Offset of the relayed envelope inside a relay request or delivery datagram.
pub const RELAY_INNER_OFFSET: usize = HEADER_LEN + ID_LEN;
/// Outer header, destination id and a complete inner header.
pub const RELAY_MIN_LEN: usize = RELAY_INNER_OFFSET + HEADER_LEN;

const HINT_V4_PAYLOAD_LEN: usize = ID_LEN + 1 + V4_ENTRY_LEN;
const HINT_V6_PAYLOAD_LEN: usize = ID_LEN + 1 + V6_ENTRY_LEN;
pub const HINT_V4_LEN: usize = HEADER_LEN + HINT_V4_PAYLOAD_LEN;
pub const HINT_V6_LEN: usize = HEADER_LEN + HINT_V6_PAYLOAD_LEN;

const HINT_FAMILY_V4: u8 = 4;
const HINT_FAMILY_V6: u8 = 6;

/// Append a candidate endpoint list: v4 count, v4 entries, v6 count, v6 entries.
///
/// Each family carries at most 255 entries, extra ones are left out.
pub fn write_endpoints(buf: &mut Vec<u8>, endpoints: &[SocketAddr]) {
    let v4: Vec<_> = endpoints
        .iter()
        .map(|e| canonical(*e))
        .filter(|e| e.is_ipv4())
        .take(u8::MAX as usize)
        .collect();
    let v6: Vec<_> = endpoints
        .iter()
        .map(|e| canonical(*e))
        .filter(|e| e.is_ipv6())
        .take(u8::MAX as usize)
        .collect();

    buf.push(v4.len() as u8);
    for e in &v4 {
        if let SocketAddr::V4(e) = e {
            buf.extend_from_slice(&e.ip().octets());
            buf.extend_from_slice(&e.port().to_be_bytes());
        }
    }

    buf.push(v6.len() as u8);
    for e in &v6 {
        if let SocketAddr::V6(e) = e {
            buf.extend_from_slice(&e.ip().octets());
            buf.extend_from_slice(&e.port().to_be_bytes());
        }
    }
}

pub fn endpoint_list(endpoints: &[SocketAddr]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + endpoints.len() * V6_ENTRY_LEN);
    write_endpoints(&mut buf, endpoints);
    buf
}

/// Read a list written by [`write_endpoints`]. Truncated lists are rejected.
pub fn read_endpoints(buf: &[u8]) -> Option<Vec<SocketAddr>> {
    let mut r = Reader(buf);
    let mut endpoints = Vec::new();

    let count = r.u8()?;
    for _ in 0..count {
        let ip: [u8; 4] = r.array()?;
        let port = r.port()?;
        endpoints.push(SocketAddr::new(Ipv4Addr::from(ip).into(), port));
    }

    let count = r.u8()?;
    for _ in 0..count {
        let ip: [u8; 16] = r.array()?;
        let port = r.port()?;
        endpoints.push(canonical(SocketAddr::new(Ipv6Addr::from(ip).into(), port)));
    }

    Some(endpoints)
}

/// `-1`: concatenated peer ids.
pub fn membership<'a>(ids: impl IntoIterator<Item = &'a MeshId>) -> Vec<u8> {
    ids.into_iter()
        .flat_map(|id| id.as_bytes().iter().copied())
        .collect()
}

/// Trailing bytes short of a full id are ignored.
pub fn read_membership(payload: &[u8]) -> Vec<MeshId> {
    payload
        .chunks_exact(ID_LEN)
        .filter_map(MeshId::from_slice)
        .collect()
}

/// `-2`: peer id followed by an encoded endpoint list.
pub fn peer_endpoints(id: &MeshId, endpoint_list: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ID_LEN + endpoint_list.len());
    buf.extend_from_slice(id.as_bytes());
    buf.extend_from_slice(endpoint_list);
    buf
}

pub fn read_peer_endpoints(payload: &[u8]) -> Option<(MeshId, Vec<SocketAddr>)> {
    let id = MeshId::from_slice(payload)?;
    let endpoints = read_endpoints(&payload[ID_LEN..])?;
    Some((id, endpoints))
}

/// `-201`: sender's timestamp.
pub fn heartbeat(sent_at: i64) -> [u8; HEARTBEAT_LEN] {
    sent_at.to_be_bytes()
}

pub fn read_heartbeat(payload: &[u8]) -> Option<i64> {
    if payload.len() != HEARTBEAT_LEN {
        return None;
    }
    Reader(payload).i64()
}

/// `-202`: echoed timestamp followed by the responder's clock.
pub fn heartbeat_reply(echoed: i64, responder_now: i64) -> [u8; HEARTBEAT_REPLY_LEN] {
    let mut buf = [0u8; HEARTBEAT_REPLY_LEN];
    buf[..TIMESTAMP_LEN].copy_from_slice(&echoed.to_be_bytes());
    buf[TIMESTAMP_LEN..].copy_from_slice(&responder_now.to_be_bytes());
    buf
}

pub fn read_heartbeat_reply(payload: &[u8]) -> Option<(i64, i64)> {
    if payload.len() != HEARTBEAT_REPLY_LEN {
        return None;
    }
    let mut r = Reader(payload);
    Some((r.i64()?, r.i64()?))
}

/// `-102`: destination id followed by the envelope to forward.
pub fn relay_request(destination: &MeshId, inner: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(ID_LEN + inner.len());
    buf.extend_from_slice(destination.as_bytes());
    buf.extend_from_slice(inner);
    buf
}

/// A relay request as seen by the server.
#[derive(Debug, Clone, Copy)]
pub struct RelayRequest<'a> {
    pub destination: MeshId,
    pub inner_type: i32,
    pub inner: &'a [u8],
}

impl<'a> RelayRequest<'a> {
    /// Parse a whole relay datagram, header included.
    pub fn parse(datagram: &'a [u8]) -> Option<Self> {
        if datagram.len() < RELAY_MIN_LEN {
            return None;
        }
        let inner = &datagram[RELAY_INNER_OFFSET..];
        Some(Self {
            destination: MeshId::from_slice(&datagram[HEADER_LEN..])?,
            inner_type: read_type(inner, HEADER_LEN - TYPE_LEN)?,
            inner,
        })
    }

    /// Relaying mesh control messages is refused.
    pub fn is_forwardable(&self) -> bool {
        self.inner_type >= 0
    }
}

/// Envelope carried by a `-3` relay delivery.
pub fn relay_delivery_inner(datagram: &[u8]) -> Option<&[u8]> {
    if datagram.len() < RELAY_MIN_LEN {
        return None;
    }
    Some(&datagram[RELAY_INNER_OFFSET..])
}

/// `-103`: peer id, family tag (4 or 6), address and port it was observed at.
pub fn observed_address(peer: &MeshId, observed: SocketAddr) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HINT_V6_PAYLOAD_LEN);
    buf.extend_from_slice(peer.as_bytes());
    match canonical(observed) {
        SocketAddr::V4(a) => {
            buf.push(HINT_FAMILY_V4);
            buf.extend_from_slice(&a.ip().octets());
        }
        SocketAddr::V6(a) => {
            buf.push(HINT_FAMILY_V6);
            buf.extend_from_slice(&a.ip().octets());
        }
    }
    buf.extend_from_slice(&observed.port().to_be_bytes());
    buf
}

pub fn read_observed_address(payload: &[u8]) -> Option<(MeshId, SocketAddr)> {
    let mut r = Reader(payload);
    let peer = MeshId::from_bytes(r.array()?);
    let tag = r.u8()?;

    let addr = match (payload.len(), tag) {
        (HINT_V4_PAYLOAD_LEN, HINT_FAMILY_V4) => {
            let ip: [u8; 4] = r.array()?;
            SocketAddr::new(Ipv4Addr::from(ip).into(), r.port()?)
        }
        (HINT_V6_PAYLOAD_LEN, HINT_FAMILY_V6) => {
            let ip: [u8; 16] = r.array()?;
            SocketAddr::new(Ipv6Addr::from(ip).into(), r.port()?)
        }
        _ => return None,
    };

    Some((peer, addr))
}

/// Keep only endpoints of one family.
pub fn of_family(endpoints: &[SocketAddr], family: Family) -> impl Iterator<Item = &SocketAddr> {
    endpoints.iter().filter(move |e| Family::of(e) == family)
}

struct Reader<'a>(&'a [u8]);

impl Reader<'_> {
    fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let head = self.0.get(..N)?.try_into().ok()?;
        self.0 = &self.0[N..];
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.array::<1>().map(|b| b[0])
    }

    fn port(&mut self) -> Option<u16> {
        self.array().map(u16::from_be_bytes)
    }

    fn i64(&mut self) -> Option<i64> {
        self.array().map(i64::from_be_bytes)
    }
}
