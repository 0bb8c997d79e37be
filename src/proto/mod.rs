//! Mesh wire format.
//!
//! Every mesh datagram starts with a fixed 24 byte header:
//!
//! ```text
//! +-------+-------------+--------------+-----------------
//! | magic |  sender id  | message type | payload ...
//! |  4B   |     16B     |  4B, i32 BE  |
//! +-------+-------------+--------------+-----------------
//! ```
//!
//! Message types are split by sign. Negative types are the mesh's own control messages
//! ([`ControlType`]), zero and positive types belong to the embedding application ([`AppType`]).

mod dispatch;
pub mod payload;

pub use dispatch::{Handler, Handlers};

use rand::RngCore;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// "UDPM"
pub const MAGIC: [u8; 4] = *b"UDPM";
pub const MAGIC_LEN: usize = MAGIC.len();
pub const ID_LEN: usize = 16;
pub const TYPE_LEN: usize = 4;
pub const HEADER_LEN: usize = MAGIC_LEN + ID_LEN + TYPE_LEN;

const ID_OFFSET: usize = MAGIC_LEN;
const TYPE_OFFSET: usize = MAGIC_LEN + ID_LEN;

/// Identity of a mesh node, stable for the lifetime of the process.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MeshId([u8; ID_LEN]);

impl MeshId {
    /// generate a fresh random identity.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.get(..ID_LEN)?.try_into().ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }
}

impl fmt::Display for MeshId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                f.write_str("-")?;
            }
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for MeshId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MeshId({})", self)
    }
}

/// Control messages reserved by the mesh protocol.
#[repr(i32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ControlType {
    /// server -> client: ids of all registered peers
    Membership = -1,
    /// server -> client: one peer's id and candidate endpoints
    PeerEndpoints = -2,
    /// server -> client: relayed envelope
    RelayDelivery = -3,
    /// client -> server: the sender's own candidate endpoints
    Register = -101,
    /// client -> server: envelope to relay to another peer
    RelayRequest = -102,
    /// client -> server: address a peer was observed at
    ObservedAddress = -103,
    /// client -> client
    Heartbeat = -201,
    /// client -> client
    HeartbeatReply = -202,
}

impl ControlType {
    pub fn from_code(code: i32) -> Option<Self> {
        use ControlType::*;
        Some(match code {
            -1 => Membership,
            -2 => PeerEndpoints,
            -3 => RelayDelivery,
            -101 => Register,
            -102 => RelayRequest,
            -103 => ObservedAddress,
            -201 => Heartbeat,
            -202 => HeartbeatReply,
            _ => return None,
        })
    }

    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Application message type, always non-negative.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppType(i32);

impl AppType {
    /// # Panics
    ///
    /// Panics if `code` is negative, those types are reserved for mesh control messages.
    pub fn new(code: i32) -> Self {
        assert!(
            code >= 0,
            "application message type {} is negative, negative types are reserved for the mesh",
            code
        );
        Self(code)
    }

    pub fn code(self) -> i32 {
        self.0
    }
}

/// Which namespace a decoded message type falls in.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Control(ControlType),
    App(AppType),
    /// negative type this version does not know about
    Reserved(i32),
}

impl MessageKind {
    pub fn from_code(code: i32) -> Self {
        if code >= 0 {
            return MessageKind::App(AppType(code));
        }
        match ControlType::from_code(code) {
            Some(ctl) => MessageKind::Control(ctl),
            None => MessageKind::Reserved(code),
        }
    }
}

/// A decoded mesh datagram, borrowing the receive buffer.
#[derive(Debug, Clone, Copy)]
pub struct Envelope<'a> {
    pub sender: MeshId,
    pub msg_type: i32,
    pub payload: &'a [u8],
    /// the whole datagram, header included
    pub bytes: &'a [u8],
}

impl Envelope<'_> {
    pub fn kind(&self) -> MessageKind {
        MessageKind::from_code(self.msg_type)
    }
}

/// Build a datagram: header followed by `payload` verbatim.
pub fn encode(sender: &MeshId, msg_type: i32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    write_header(&mut buf, sender, msg_type);
    buf.extend_from_slice(payload);
    buf
}

pub(crate) fn write_header(buf: &mut Vec<u8>, sender: &MeshId, msg_type: i32) {
    buf.extend_from_slice(&MAGIC);
    buf.extend_from_slice(sender.as_bytes());
    buf.extend_from_slice(&msg_type.to_be_bytes());
}

/// Parse a datagram header. Anything too short or without the magic is rejected.
pub fn decode(bytes: &[u8]) -> Option<Envelope<'_>> {
    if bytes.len() < HEADER_LEN || bytes[..MAGIC_LEN] != MAGIC {
        return None;
    }

    let sender = MeshId::from_slice(&bytes[ID_OFFSET..])?;
    let msg_type = read_type(bytes, TYPE_OFFSET)?;

    Some(Envelope {
        sender,
        msg_type,
        payload: &bytes[HEADER_LEN..],
        bytes,
    })
}

pub(crate) fn read_type(bytes: &[u8], offset: usize) -> Option<i32> {
    let raw: [u8; TYPE_LEN] = bytes.get(offset..offset + TYPE_LEN)?.try_into().ok()?;
    Some(i32::from_be_bytes(raw))
}

/// Address family of an endpoint.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    /// IPv4-mapped IPv6 addresses count as IPv4.
    pub fn of(addr: &SocketAddr) -> Self {
        match canonical(*addr) {
            SocketAddr::V4(_) => Family::V4,
            SocketAddr::V6(_) => Family::V6,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Family::V4 => "v4",
            Family::V6 => "v6",
        })
    }
}

/// Unwrap IPv4-mapped IPv6 addresses so equal endpoints compare equal.
pub fn canonical(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
            Some(v4) => SocketAddr::new(IpAddr::V4(v4), v6.port()),
            None => addr,
        },
        _ => addr,
    }
}
