//! Per-peer connectivity state, shared by the client and server engines.

use crate::proto::{canonical, payload, Family, MeshId};
use std::net::SocketAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Unanswered heartbeat rounds before a peer counts as relayed rather than discovering.
pub const DISCOVERY_ROUNDS: u32 = 3;

/// Wall clock in microseconds since the Unix epoch, as carried by heartbeats.
pub fn unix_micros() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_micros() as i64,
        Err(e) => -(e.duration().as_micros() as i64),
    }
}

/// How a peer can currently be reached.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Connectivity {
    /// id known, no endpoints yet
    Unknown,
    /// candidates known, probing them
    Discovering,
    /// probing keeps failing, traffic goes through the server
    Relayed,
    DirectV4,
    DirectV6,
    DirectBoth,
}

/// One remote mesh participant.
#[derive(Debug, Clone)]
pub struct Peer {
    id: MeshId,
    candidates: Vec<SocketAddr>,
    contact_v4: Option<SocketAddr>,
    contact_v6: Option<SocketAddr>,
    latency_v4: Duration,
    latency_v6: Duration,
    clock_offset: i64,
    last_receive: Instant,
    probe_rounds: u32,
    endpoint_cache: Option<Vec<u8>>,
}

impl Peer {
    pub fn new(id: MeshId) -> Self {
        Self {
            id,
            candidates: Vec::new(),
            contact_v4: None,
            contact_v6: None,
            latency_v4: Duration::MAX,
            latency_v6: Duration::MAX,
            clock_offset: 0,
            last_receive: Instant::now(),
            probe_rounds: 0,
            endpoint_cache: None,
        }
    }

    pub fn id(&self) -> MeshId {
        self.id
    }

    /// Endpoints learned for this peer, in insertion order.
    pub fn candidates(&self) -> &[SocketAddr] {
        &self.candidates
    }

    /// Confirmed endpoint for a family.
    pub fn contact(&self, family: Family) -> Option<SocketAddr> {
        match family {
            Family::V4 => self.contact_v4,
            Family::V6 => self.contact_v6,
        }
    }

    pub fn uses(&self, family: Family) -> bool {
        self.contact(family).is_some()
    }

    pub fn uses_v4(&self) -> bool {
        self.contact_v4.is_some()
    }

    pub fn uses_v6(&self) -> bool {
        self.contact_v6.is_some()
    }

    /// Last round trip measured over a family, `Duration::MAX` until one is.
    pub fn latency(&self, family: Family) -> Duration {
        match family {
            Family::V4 => self.latency_v4,
            Family::V6 => self.latency_v6,
        }
    }

    /// Estimated `our clock - peer clock` in microseconds.
    pub fn clock_offset_micros(&self) -> i64 {
        self.clock_offset
    }

    pub fn last_receive(&self) -> Instant {
        self.last_receive
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_receive = now;
    }

    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_receive) > timeout
    }

    /// Returns false if the endpoint was already known.
    pub fn add_candidate(&mut self, endpoint: SocketAddr) -> bool {
        let endpoint = canonical(endpoint);
        if self.candidates.contains(&endpoint) {
            return false;
        }
        self.candidates.push(endpoint);
        self.endpoint_cache = None;
        true
    }

    /// Confirm `endpoint` for its family unless one is confirmed already.
    pub fn promote_if_first(&mut self, endpoint: SocketAddr) -> bool {
        let endpoint = canonical(endpoint);
        let slot = self.contact_slot(Family::of(&endpoint));
        if slot.is_some() {
            return false;
        }
        *slot = Some(endpoint);
        true
    }

    /// Replace the confirmed endpoint of the family, used for server registrations.
    pub fn set_contact(&mut self, endpoint: SocketAddr) {
        let endpoint = canonical(endpoint);
        *self.contact_slot(Family::of(&endpoint)) = Some(endpoint);
    }

    fn contact_slot(&mut self, family: Family) -> &mut Option<SocketAddr> {
        match family {
            Family::V4 => &mut self.contact_v4,
            Family::V6 => &mut self.contact_v6,
        }
    }

    /// Update latency and clock offset from a heartbeat reply.
    ///
    /// `sent` and `received` are our clock, `remote` is the peer's clock when it replied.
    pub fn record_heartbeat_reply(
        &mut self,
        sent: i64,
        remote: i64,
        received: i64,
        family: Family,
    ) {
        let rtt = received.saturating_sub(sent).max(0);
        let latency = Duration::from_micros(rtt as u64);
        match family {
            Family::V4 => self.latency_v4 = latency,
            Family::V6 => self.latency_v6 = latency,
        }

        let expected_at_peer = sent.saturating_add(rtt / 2);
        self.clock_offset = expected_at_peer.saturating_sub(remote);
        self.probe_rounds = 0;
    }

    /// Encoded candidate list, cached until a new candidate is added.
    pub fn endpoint_list(&mut self) -> &[u8] {
        let candidates = &self.candidates;
        self.endpoint_cache
            .get_or_insert_with(|| payload::endpoint_list(candidates))
    }

    pub(crate) fn note_probe_round(&mut self) {
        self.probe_rounds = self.probe_rounds.saturating_add(1);
    }

    pub fn connectivity(&self) -> Connectivity {
        match (self.contact_v4, self.contact_v6) {
            (Some(_), Some(_)) => Connectivity::DirectBoth,
            (Some(_), None) => Connectivity::DirectV4,
            (None, Some(_)) => Connectivity::DirectV6,
            (None, None) if self.candidates.is_empty() => Connectivity::Unknown,
            (None, None) if self.probe_rounds < DISCOVERY_ROUNDS => Connectivity::Discovering,
            (None, None) => Connectivity::Relayed,
        }
    }

    /// Pick the direct endpoint for application traffic, `None` means relay.
    ///
    /// With both families confirmed the lower latency wins, ties go to IPv6. A family whose
    /// local socket is down is never chosen.
    pub fn select_route(&self, v4_up: bool, v6_up: bool) -> Option<SocketAddr> {
        let v4 = self.contact_v4.filter(|_| v4_up);
        let v6 = self.contact_v6.filter(|_| v6_up);

        match (v4, v6) {
            (Some(v4), Some(v6)) => Some(if self.latency_v4 < self.latency_v6 {
                v4
            } else {
                v6
            }),
            (v4, v6) => v6.or(v4),
        }
    }
}
