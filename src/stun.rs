//! STUN binding requests, used to learn the address a NAT maps our socket to.
//!
//! STUN shares the client socket with mesh traffic. The two are told apart by the magic
//! cookie at bytes 4..8 of a STUN message, checked before any envelope decoding.

use rand::RngCore;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

pub const STUN_PORT: u16 = 19302;
pub const DEFAULT_STUN_SERVERS: &[&str] = &["stun1.l.google.com", "stun2.l.google.com"];

pub const MAGIC_COOKIE: u32 = 0x2112A442;

const HEADER_LEN: usize = 20;
const REQUEST_LEN: usize = 28;
const TRANSACTION_OFFSET: usize = 4;
const TRANSACTION_LEN: usize = 16;

const BINDING_REQUEST: u16 = 0x0001;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_CHANGE_REQUEST: u16 = 0x0003;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// The 16 byte transaction field of a STUN message, magic cookie included.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId(pub [u8; TRANSACTION_LEN]);

impl TransactionId {
    pub fn random() -> Self {
        let mut id = [0u8; TRANSACTION_LEN];
        id[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
        rand::thread_rng().fill_bytes(&mut id[4..]);
        Self(id)
    }
}

/// Build a binding request with a CHANGE-REQUEST attribute asking for neither IP nor port
/// change.
pub fn binding_request() -> ([u8; REQUEST_LEN], TransactionId) {
    let transaction = TransactionId::random();
    (build_binding_request(&transaction), transaction)
}

pub fn build_binding_request(transaction: &TransactionId) -> [u8; REQUEST_LEN] {
    let mut req = [0u8; REQUEST_LEN];
    req[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    req[2..4].copy_from_slice(&((REQUEST_LEN - HEADER_LEN) as u16).to_be_bytes());
    req[TRANSACTION_OFFSET..HEADER_LEN].copy_from_slice(&transaction.0);
    req[20..22].copy_from_slice(&ATTR_CHANGE_REQUEST.to_be_bytes());
    req[22..24].copy_from_slice(&4u16.to_be_bytes());
    req
}

/// Whether a datagram looks like STUN rather than a mesh envelope.
pub fn is_stun(buf: &[u8]) -> bool {
    buf.len() >= HEADER_LEN && buf[4..8] == MAGIC_COOKIE.to_be_bytes()
}

/// A parsed binding response.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BindingResponse {
    pub mapped: SocketAddr,
    pub transaction: TransactionId,
}

/// Parse a binding response.
///
/// The attribute walk stops quietly at the first truncated attribute. XOR-MAPPED-ADDRESS wins
/// over MAPPED-ADDRESS when both are present.
pub fn parse_binding_response(buf: &[u8]) -> Option<BindingResponse> {
    if buf.len() < HEADER_LEN {
        return None;
    }

    let message_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    let transaction = TransactionId(buf[TRANSACTION_OFFSET..HEADER_LEN].try_into().ok()?);

    let end = (HEADER_LEN + message_len).min(buf.len());
    let mut offset = HEADER_LEN;
    let mut mapped = None;
    let mut xor_mapped = None;

    while offset + 4 <= end {
        let attr_type = u16::from_be_bytes([buf[offset], buf[offset + 1]]);
        let attr_len = u16::from_be_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
        offset += 4;

        if offset + attr_len > end {
            log::trace!("truncated stun attribute {:#06x}", attr_type);
            break;
        }
        let value = &buf[offset..offset + attr_len];

        match attr_type {
            ATTR_MAPPED_ADDRESS => mapped = parse_address(value, None).or(mapped),
            ATTR_XOR_MAPPED_ADDRESS => {
                xor_mapped = parse_address(value, Some(&transaction)).or(xor_mapped)
            }
            _ => {}
        }

        offset += (attr_len + 3) & !3;
    }

    Some(BindingResponse {
        mapped: xor_mapped.or(mapped)?,
        transaction,
    })
}

fn parse_address(value: &[u8], xor: Option<&TransactionId>) -> Option<SocketAddr> {
    let mask = xor.map_or([0u8; TRANSACTION_LEN], |t| t.0);

    let family = *value.get(1)?;
    let port = u16::from_be_bytes([value.get(2)? ^ mask[0], value.get(3)? ^ mask[1]]);

    match (family, value.len()) {
        (FAMILY_IPV4, 8) => {
            let mut ip = [0u8; 4];
            for (i, b) in ip.iter_mut().enumerate() {
                *b = value[4 + i] ^ mask[i];
            }
            Some(SocketAddr::new(Ipv4Addr::from(ip).into(), port))
        }
        (FAMILY_IPV6, 20) => {
            let mut ip = [0u8; 16];
            for (i, b) in ip.iter_mut().enumerate() {
                *b = value[4 + i] ^ mask[i];
            }
            Some(SocketAddr::new(Ipv6Addr::from(ip).into(), port))
        }
        _ => None,
    }
}
