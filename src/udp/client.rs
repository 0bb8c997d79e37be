use crate::peer::{unix_micros, Peer};
use crate::proto::{
    self, canonical, payload, AppType, ControlType, Envelope, Family, Handlers, MeshId,
    MessageKind,
};
use crate::stun::{self, TransactionId};
use std::collections::{HashMap, HashSet};
use std::io::{Error, ErrorKind, Result};
use std::net::{IpAddr, SocketAddr};
use std::sync::{
    atomic::{AtomicBool, Ordering::Relaxed},
    Arc, Mutex,
};
use std::thread::{spawn, JoinHandle};
use std::time::{Duration, Instant};

use super::socket::DualSocket;

/// Client engine settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// rendezvous server, IPv4
    pub server_v4: Option<SocketAddr>,
    /// rendezvous server, IPv6
    pub server_v6: Option<SocketAddr>,
    /// local interface addresses, advertised with the bound ports as candidates
    pub local_addresses: Vec<IpAddr>,
    /// resolved STUN servers, empty disables external address discovery
    pub stun_servers: Vec<SocketAddr>,
    /// 0 picks an ephemeral port per family
    pub bind_port: u16,
    /// registration and heartbeat period
    pub heartbeat_interval: Duration,
    /// re-run STUN when the last answer is older than this
    pub stun_refresh: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_v4: None,
            server_v6: None,
            local_addresses: Vec::new(),
            stun_servers: Vec::new(),
            bind_port: 0,
            heartbeat_interval: Duration::from_secs(10),
            stun_refresh: Duration::from_secs(5 * 60),
        }
    }
}

/// Mesh client
///
/// Registers with a rendezvous server, learns the other peers and their candidate endpoints,
/// heartbeats them to open direct paths and falls back to server relay when there is none.
///
/// # example
/// ```no_run
/// use udpmesh::proto::MeshId;
/// use udpmesh::udp::{Client, ClientConfig};
///
/// let config = ClientConfig {
///     server_v4: Some("203.0.113.1:6702".parse().unwrap()),
///     ..Default::default()
/// };
/// let mut c = Client::new(MeshId::random(), config).unwrap();
/// c.register_handler(0, |env, _| println!("{} says {:?}", env.sender, env.payload));
/// c.start().unwrap();
/// ```
pub struct Client {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<Result<()>>>,
}

struct Shared {
    id: MeshId,
    config: ClientConfig,
    sockets: DualSocket,
    me: Mutex<Peer>,
    peers: Mutex<HashMap<MeshId, Peer>>,
    handlers: Handlers,
    contacted: Mutex<HashSet<SocketAddr>>,
    stun: Mutex<StunState>,
    connected_v4: AtomicBool,
    connected_v6: AtomicBool,
    exit: AtomicBool,
    errored: AtomicBool,
}

#[derive(Default)]
struct StunState {
    last_response: Option<Instant>,
    pending: Vec<TransactionId>,
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Client {
    /// Bind the v4 and v6 sockets. A family that fails to bind stays disabled.
    pub fn new(id: MeshId, config: ClientConfig) -> Result<Self> {
        let sockets = DualSocket::bind(config.bind_port, true)?;

        let mut me = Peer::new(id);
        for family in [Family::V4, Family::V6] {
            let Some(local) = sockets.local_addr(family) else {
                continue;
            };
            log::info!("listening on {} port {}", family, local.port());

            for ip in &config.local_addresses {
                let candidate = canonical(SocketAddr::new(*ip, local.port()));
                if Family::of(&candidate) == family {
                    me.add_candidate(candidate);
                }
            }
        }

        Ok(Self {
            shared: Arc::new(Shared {
                id,
                config,
                sockets,
                me: Mutex::new(me),
                peers: Default::default(),
                handlers: Default::default(),
                contacted: Default::default(),
                stun: Default::default(),
                connected_v4: Default::default(),
                connected_v6: Default::default(),
                exit: Default::default(),
                errored: Default::default(),
            }),
            thread: None,
        })
    }

    pub fn id(&self) -> MeshId {
        self.shared.id
    }

    /// Register a handler for an application message type.
    ///
    /// # Panics
    ///
    /// Panics if `msg_type` is negative.
    pub fn register_handler<F>(&self, msg_type: i32, handler: F)
    where
        F: Fn(&Envelope<'_>, Option<SocketAddr>) + Send + Sync + 'static,
    {
        self.shared.handlers.register(msg_type, handler);
    }

    /// Run the engine on a background thread.
    pub fn start(&mut self) -> Result<()> {
        if self.thread.is_some() {
            return Err(Error::new(ErrorKind::Other, "client already started"));
        }

        let shared = self.shared.clone();
        self.thread = Some(spawn(move || shared.run()));
        Ok(())
    }

    /// Stop the background thread and wait for it.
    pub fn shutdown(&mut self) {
        self.shared.exit.store(true, Relaxed);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }

    /// The receive loop hit an unrecoverable error and stopped.
    pub fn is_errored(&self) -> bool {
        self.shared.errored.load(Relaxed)
    }

    pub fn local_addr(&self, family: Family) -> Option<SocketAddr> {
        self.shared.sockets.local_addr(family)
    }

    /// A membership broadcast arrived from the server over IPv4.
    pub fn connected_v4(&self) -> bool {
        self.shared.connected_v4.load(Relaxed)
    }

    pub fn connected_v6(&self) -> bool {
        self.shared.connected_v6.load(Relaxed)
    }

    /// Time of the last successful STUN response.
    pub fn last_stun(&self) -> Option<Instant> {
        self.shared.stun.lock().unwrap().last_response
    }

    /// Our own candidate endpoints as advertised to the server.
    pub fn candidates(&self) -> Vec<SocketAddr> {
        self.shared.me.lock().unwrap().candidates().to_vec()
    }

    /// Snapshot of all known peers.
    pub fn peers(&self) -> Vec<Peer> {
        self.shared.peers.lock().unwrap().values().cloned().collect()
    }

    pub fn peer(&self, id: &MeshId) -> Option<Peer> {
        self.shared.peers.lock().unwrap().get(id).cloned()
    }

    /// Send an application message to a peer.
    ///
    /// Goes direct when a path is confirmed, otherwise through the server.
    ///
    /// # Panics
    ///
    /// Panics if `msg_type` is negative.
    pub fn send_message(&self, dest: MeshId, msg_type: i32, data: &[u8]) -> Result<()> {
        self.shared.send_message(dest, AppType::new(msg_type), data)
    }
}

impl Shared {
    fn run(&self) -> Result<()> {
        let res = self.sockets.run(
            &self.exit,
            &self.errored,
            self.config.heartbeat_interval,
            |buf, from| self.handle_datagram(buf, from),
            || self.tick(),
        );

        if let Err(e) = &res {
            log::error!("client receive loop failed: {}", e);
        }
        res
    }

    fn tick(&self) {
        self.refresh_stun();
        self.send_register();
        self.send_heartbeats();
    }

    fn server(&self, family: Family) -> Option<SocketAddr> {
        match family {
            Family::V4 => self.config.server_v4,
            Family::V6 => self.config.server_v6,
        }
    }

    fn connected(&self, family: Family) -> bool {
        match family {
            Family::V4 => self.connected_v4.load(Relaxed),
            Family::V6 => self.connected_v6.load(Relaxed),
        }
    }

    fn refresh_stun(&self) {
        let mut stun = self.stun.lock().unwrap();
        let fresh = stun
            .last_response
            .is_some_and(|t| t.elapsed() < self.config.stun_refresh);
        if fresh {
            return;
        }

        stun.pending.clear();
        for server in &self.config.stun_servers {
            if !self.sockets.has(Family::of(server)) {
                continue;
            }
            let (req, transaction) = stun::binding_request();
            log::debug!("stun binding request to {}", server);
            self.sockets.send_to(&req, *server);
            stun.pending.push(transaction);
        }
    }

    fn send_register(&self) {
        let msg = {
            let mut me = self.me.lock().unwrap();
            proto::encode(&self.id, ControlType::Register.code(), me.endpoint_list())
        };

        for family in [Family::V4, Family::V6] {
            if let Some(server) = self.server(family) {
                self.sockets.send_to(&msg, server);
            }
        }
    }

    fn send_heartbeats(&self) {
        let msg = proto::encode(
            &self.id,
            ControlType::Heartbeat.code(),
            &payload::heartbeat(unix_micros()),
        );

        let mut peers = self.peers.lock().unwrap();
        let mut contacted = self.contacted.lock().unwrap();

        for peer in peers.values_mut() {
            for family in [Family::V4, Family::V6] {
                if !self.sockets.has(family) {
                    continue;
                }

                if let Some(contact) = peer.contact(family) {
                    self.sockets.send_to(&msg, contact);
                    continue;
                }

                for candidate in payload::of_family(peer.candidates(), family) {
                    if contacted.insert(*candidate) {
                        log::info!("attempting new contact {} for {}", candidate, peer.id());
                    }
                    self.sockets.send_to(&msg, *candidate);
                }
            }

            if !peer.uses_v4() && !peer.uses_v6() && !peer.candidates().is_empty() {
                peer.note_probe_round();
            }
        }
    }

    fn handle_datagram(&self, buf: &[u8], from: SocketAddr) {
        let from = canonical(from);

        if stun::is_stun(buf) {
            self.handle_stun(buf, from);
            return;
        }

        let Some(env) = proto::decode(buf) else {
            log::trace!("dropping {} bytes from {}", buf.len(), from);
            return;
        };

        match env.kind() {
            MessageKind::Control(ctl) => match ctl {
                ControlType::Membership => self.handle_membership(&env, from),
                ControlType::PeerEndpoints => self.handle_peer_endpoints(&env),
                ControlType::RelayDelivery => self.handle_relay_delivery(&env),
                ControlType::Heartbeat => self.handle_heartbeat(&env, from),
                ControlType::HeartbeatReply => self.handle_heartbeat_reply(&env, from),
                ControlType::Register
                | ControlType::RelayRequest
                | ControlType::ObservedAddress => {
                    log::trace!("ignoring server-bound {:?} from {}", ctl, from)
                }
            },
            MessageKind::App(_) => self.deliver(&env, Some(from)),
            MessageKind::Reserved(code) => log::trace!("unknown control type {}", code),
        }
    }

    fn deliver(&self, env: &Envelope<'_>, from: Option<SocketAddr>) {
        if let Some(peer) = self.peers.lock().unwrap().get_mut(&env.sender) {
            peer.touch(Instant::now());
        }
        self.handlers.dispatch(env, from);
    }

    fn handle_stun(&self, buf: &[u8], from: SocketAddr) {
        let Some(resp) = stun::parse_binding_response(buf) else {
            log::trace!("unusable stun response from {}", from);
            return;
        };

        {
            let mut stun = self.stun.lock().unwrap();
            if !stun.pending.contains(&resp.transaction) {
                log::debug!("stun response from {} matches no pending request", from);
            }
            stun.last_response = Some(Instant::now());
        }

        if self.me.lock().unwrap().add_candidate(resp.mapped) {
            log::info!("discovered external endpoint {}", resp.mapped);
        }
    }

    fn handle_membership(&self, env: &Envelope<'_>, from: SocketAddr) {
        match Family::of(&from) {
            Family::V4 => self.connected_v4.store(true, Relaxed),
            Family::V6 => self.connected_v6.store(true, Relaxed),
        }

        let ids: HashSet<MeshId> = payload::read_membership(env.payload)
            .into_iter()
            .filter(|id| *id != self.id)
            .collect();

        let mut peers = self.peers.lock().unwrap();
        peers.retain(|id, _| {
            let keep = ids.contains(id);
            if !keep {
                log::info!("peer {} left the mesh", id);
            }
            keep
        });
        for id in ids {
            peers.entry(id).or_insert_with(|| {
                log::info!("peer {} joined the mesh", id);
                Peer::new(id)
            });
        }
    }

    fn handle_peer_endpoints(&self, env: &Envelope<'_>) {
        let Some((id, endpoints)) = payload::read_peer_endpoints(env.payload) else {
            log::trace!("malformed endpoint list");
            return;
        };
        if id == self.id {
            return;
        }

        let mut peers = self.peers.lock().unwrap();
        let peer = peers.entry(id).or_insert_with(|| Peer::new(id));
        for endpoint in endpoints {
            if peer.add_candidate(endpoint) {
                log::debug!("peer {} candidate {}", id, endpoint);
            }
        }
    }

    fn handle_relay_delivery(&self, env: &Envelope<'_>) {
        let Some(inner) = payload::relay_delivery_inner(env.bytes).and_then(proto::decode) else {
            log::trace!("malformed relay delivery");
            return;
        };

        match inner.kind() {
            MessageKind::App(_) => self.deliver(&inner, None),
            _ => log::debug!("dropping relayed control type {}", inner.msg_type),
        }
    }

    fn handle_heartbeat(&self, env: &Envelope<'_>, from: SocketAddr) {
        let Some(sent) = payload::read_heartbeat(env.payload) else {
            return;
        };

        let family = Family::of(&from);
        let confirmed = {
            let mut peers = self.peers.lock().unwrap();
            let Some(peer) = peers.get_mut(&env.sender) else {
                log::trace!("heartbeat from unknown peer {}", env.sender);
                return;
            };
            peer.touch(Instant::now());
            peer.uses(family)
        };

        let reply = proto::encode(
            &self.id,
            ControlType::HeartbeatReply.code(),
            &payload::heartbeat_reply(sent, unix_micros()),
        );
        self.sockets.send_to(&reply, from);

        if !confirmed {
            if let Some(server) = self.server(family) {
                log::debug!("hinting server: {} seen at {}", env.sender, from);
                let hint = proto::encode(
                    &self.id,
                    ControlType::ObservedAddress.code(),
                    &payload::observed_address(&env.sender, from),
                );
                self.sockets.send_to(&hint, server);
            }
        }
    }

    fn handle_heartbeat_reply(&self, env: &Envelope<'_>, from: SocketAddr) {
        let Some((sent, remote)) = payload::read_heartbeat_reply(env.payload) else {
            return;
        };
        let received = unix_micros();
        let family = Family::of(&from);

        let mut peers = self.peers.lock().unwrap();
        let Some(peer) = peers.get_mut(&env.sender) else {
            return;
        };

        peer.touch(Instant::now());
        peer.record_heartbeat_reply(sent, remote, received, family);
        peer.add_candidate(from);
        if peer.promote_if_first(from) {
            log::info!("peer {} reachable over {} at {}", peer.id(), family, from);
        }
        log::trace!(
            "peer {} {} latency {:?} offset {}us",
            peer.id(),
            family,
            peer.latency(family),
            peer.clock_offset_micros()
        );
    }

    fn send_message(&self, dest: MeshId, msg_type: AppType, data: &[u8]) -> Result<()> {
        let msg = proto::encode(&self.id, msg_type.code(), data);

        let route = {
            let peers = self.peers.lock().unwrap();
            let peer = peers
                .get(&dest)
                .ok_or_else(|| Error::new(ErrorKind::NotFound, "unknown peer"))?;
            peer.select_route(
                self.sockets.has(Family::V4),
                self.sockets.has(Family::V6),
            )
        };

        match route {
            Some(addr) => {
                self.sockets.send_to(&msg, addr);
                Ok(())
            }
            None => self.relay(dest, &msg),
        }
    }

    /// IPv4 is tried first, then IPv6.
    fn relay(&self, dest: MeshId, msg: &[u8]) -> Result<()> {
        let server = [Family::V4, Family::V6]
            .into_iter()
            .filter(|f| self.connected(*f) && self.sockets.has(*f))
            .find_map(|f| self.server(f))
            .ok_or_else(|| Error::new(ErrorKind::NotConnected, "no path to peer or server"))?;

        log::trace!("relaying to {} via {}", dest, server);
        let relay = proto::encode(
            &self.id,
            ControlType::RelayRequest.code(),
            &payload::relay_request(&dest, msg),
        );
        self.sockets.send_to(&relay, server);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{SocketAddrV4, UdpSocket};
    use std::sync::mpsc::channel;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn listener() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(300)))
            .unwrap();
        socket
    }

    fn recv_envelope(socket: &UdpSocket) -> Option<(MeshId, i32, Vec<u8>)> {
        let mut buf = [0u8; 2048];
        let (n, _) = socket.recv_from(&mut buf).ok()?;
        let env = proto::decode(&buf[..n])?;
        Some((env.sender, env.msg_type, env.payload.to_vec()))
    }

    fn binding_response(transaction: &TransactionId, mapped: SocketAddrV4) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0x0101u16.to_be_bytes());
        buf.extend_from_slice(&12u16.to_be_bytes());
        buf.extend_from_slice(&transaction.0);
        buf.extend_from_slice(&0x0020u16.to_be_bytes());
        buf.extend_from_slice(&8u16.to_be_bytes());
        buf.extend_from_slice(&[0, 1]);
        buf.extend_from_slice(&(mapped.port() ^ 0x2112).to_be_bytes());
        let cookie = stun::MAGIC_COOKIE.to_be_bytes();
        for (b, m) in mapped.ip().octets().iter().zip(cookie) {
            buf.push(b ^ m);
        }
        buf
    }

    fn client() -> Client {
        let config = ClientConfig {
            local_addresses: vec!["127.0.0.1".parse().unwrap()],
            ..Default::default()
        };
        Client::new(MeshId::random(), config).unwrap()
    }

    fn from_server(c: &Client, ctl: ControlType, payload: &[u8]) {
        let server = MeshId::random();
        let msg = proto::encode(&server, ctl.code(), payload);
        c.shared.handle_datagram(&msg, addr("127.0.0.1:6702"));
    }

    #[test]
    fn test_local_candidates() {
        let c = client();
        match c.local_addr(Family::V4) {
            Some(local) => assert_eq!(
                c.candidates(),
                vec![SocketAddr::new("127.0.0.1".parse().unwrap(), local.port())]
            ),
            None => assert!(c.candidates().is_empty()),
        }
    }

    #[test]
    fn test_membership_sync() {
        let c = client();
        let (a, b) = (MeshId::random(), MeshId::random());

        from_server(&c, ControlType::Membership, &payload::membership([&a, &b, &c.id()]));
        assert!(c.connected_v4());
        assert!(!c.connected_v6());
        let mut ids: Vec<_> = c.peers().iter().map(|p| p.id()).collect();
        ids.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(ids, expected);

        from_server(&c, ControlType::Membership, &payload::membership([&b]));
        assert!(c.peer(&a).is_none());
        assert!(c.peer(&b).is_some());
    }

    #[test]
    fn test_peer_endpoints() {
        let c = client();
        let a = MeshId::random();
        let list = payload::endpoint_list(&[addr("10.0.0.1:1"), addr("[2001:db8::1]:2")]);

        from_server(&c, ControlType::PeerEndpoints, &payload::peer_endpoints(&a, &list));
        from_server(&c, ControlType::PeerEndpoints, &payload::peer_endpoints(&a, &list));
        let peer = c.peer(&a).unwrap();
        assert_eq!(
            peer.candidates(),
            &[addr("10.0.0.1:1"), addr("[2001:db8::1]:2")]
        );

        // truncated lists are dropped whole
        let b = MeshId::random();
        let msg = payload::peer_endpoints(&b, &list[..list.len() - 1]);
        from_server(&c, ControlType::PeerEndpoints, &msg);
        assert!(c.peer(&b).is_none());
    }

    #[test]
    fn test_heartbeat_reply_promotes_first_endpoint() {
        let c = client();
        let a = MeshId::random();
        from_server(&c, ControlType::Membership, &payload::membership([&a]));

        let now = unix_micros();
        let reply = proto::encode(
            &a,
            ControlType::HeartbeatReply.code(),
            &payload::heartbeat_reply(now - 2_000, now - 1_000),
        );
        c.shared.handle_datagram(&reply, addr("192.0.2.10:5000"));
        c.shared.handle_datagram(&reply, addr("192.0.2.11:5001"));

        let peer = c.peer(&a).unwrap();
        assert!(peer.uses_v4());
        assert!(!peer.uses_v6());
        assert_eq!(peer.contact(Family::V4), Some(addr("192.0.2.10:5000")));
        assert!(peer.latency(Family::V4) < Duration::from_secs(1));
        assert_eq!(peer.candidates().len(), 2);

        // wrong length never counts
        let short = proto::encode(&a, ControlType::HeartbeatReply.code(), &[0; 8]);
        let b = MeshId::random();
        from_server(&c, ControlType::Membership, &payload::membership([&a, &b]));
        c.shared.handle_datagram(&short, addr("192.0.2.12:5002"));
        assert_eq!(c.peer(&a).unwrap().candidates().len(), 2);
    }

    #[test]
    fn test_relayed_message_dispatch() {
        let c = client();
        let a = MeshId::random();
        let got: Arc<Mutex<Vec<(MeshId, Vec<u8>, Option<SocketAddr>)>>> = Default::default();
        {
            let got = got.clone();
            c.register_handler(3, move |env, from| {
                got.lock()
                    .unwrap()
                    .push((env.sender, env.payload.to_vec(), from))
            });
        }

        let relay = |inner: Vec<u8>| payload::relay_request(&c.id(), &inner);
        from_server(&c, ControlType::RelayDelivery, &relay(proto::encode(&a, 3, b"hi")));
        from_server(
            &c,
            ControlType::RelayDelivery,
            &relay(proto::encode(&a, ControlType::Membership.code(), &[0; 16])),
        );

        assert_eq!(*got.lock().unwrap(), vec![(a, b"hi".to_vec(), None)]);
    }

    #[test]
    fn test_send_without_any_path() {
        let c = client();
        let a = MeshId::random();
        assert_eq!(
            c.send_message(a, 1, b"x").unwrap_err().kind(),
            ErrorKind::NotFound
        );

        from_server(&c, ControlType::Membership, &payload::membership([&a]));
        // membership arrived over v4 but no server endpoint is configured
        assert_eq!(
            c.send_message(a, 1, b"x").unwrap_err().kind(),
            ErrorKind::NotConnected
        );
    }

    #[test]
    fn test_heartbeat_reply_and_address_hint() {
        let server = listener();
        let remote = listener();
        let config = ClientConfig {
            server_v4: Some(server.local_addr().unwrap()),
            local_addresses: vec!["127.0.0.1".parse().unwrap()],
            ..Default::default()
        };
        let c = Client::new(MeshId::random(), config).unwrap();
        if c.local_addr(Family::V4).is_none() {
            return;
        }

        let a = MeshId::random();
        from_server(&c, ControlType::Membership, &payload::membership([&a]));

        let remote_addr = remote.local_addr().unwrap();
        let sent = unix_micros() - 1_000;
        let heartbeat = proto::encode(&a, ControlType::Heartbeat.code(), &payload::heartbeat(sent));
        c.shared.handle_datagram(&heartbeat, remote_addr);

        let (sender, msg_type, reply) = recv_envelope(&remote).unwrap();
        assert_eq!(sender, c.id());
        assert_eq!(msg_type, ControlType::HeartbeatReply.code());
        assert_eq!(
            payload::read_heartbeat_reply(&reply).map(|(echoed, _)| echoed),
            Some(sent)
        );

        let (sender, msg_type, hint) = recv_envelope(&server).unwrap();
        assert_eq!(sender, c.id());
        assert_eq!(msg_type, ControlType::ObservedAddress.code());
        assert_eq!(payload::read_observed_address(&hint), Some((a, remote_addr)));

        // the path gets confirmed, the server hears nothing more
        let now = unix_micros();
        let confirm = proto::encode(
            &a,
            ControlType::HeartbeatReply.code(),
            &payload::heartbeat_reply(now - 1_000, now),
        );
        c.shared.handle_datagram(&confirm, remote_addr);
        assert!(c.peer(&a).unwrap().uses_v4());

        c.shared.handle_datagram(&heartbeat, remote_addr);
        assert_eq!(
            recv_envelope(&remote).map(|(_, msg_type, _)| msg_type),
            Some(ControlType::HeartbeatReply.code())
        );
        assert!(recv_envelope(&server).is_none());
    }

    #[test]
    fn test_stun_refresh_and_external_candidate() {
        let stun_server = listener();
        let config = ClientConfig {
            local_addresses: vec!["127.0.0.1".parse().unwrap()],
            stun_servers: vec![stun_server.local_addr().unwrap()],
            ..Default::default()
        };
        let c = Client::new(MeshId::random(), config).unwrap();
        let Some(local) = c.local_addr(Family::V4) else {
            return;
        };
        assert!(c.last_stun().is_none());

        let mut buf = [0u8; 64];
        c.shared.refresh_stun();
        let (n, from) = stun_server.recv_from(&mut buf).unwrap();
        assert_eq!(n, 28);
        assert_eq!(buf[..2], [0u8, 1]);
        assert_eq!(from.port(), local.port());

        // unanswered, so the next round asks again
        c.shared.refresh_stun();
        let (n, _) = stun_server.recv_from(&mut buf).unwrap();
        assert_eq!(n, 28);
        let transaction = TransactionId(buf[4..20].try_into().unwrap());

        let mapped: SocketAddrV4 = "198.51.100.7:40000".parse().unwrap();
        let response = binding_response(&transaction, mapped);
        c.shared
            .handle_datagram(&response, stun_server.local_addr().unwrap());
        assert!(c.last_stun().is_some());
        assert!(c.candidates().contains(&SocketAddr::V4(mapped)));

        // fresh answer, nothing more until stun_refresh has passed
        c.shared.refresh_stun();
        assert!(stun_server.recv_from(&mut buf).is_err());
    }

    #[test]
    fn test_panicking_handler_keeps_engine_running() {
        let mut c = client();
        let Some(local) = c.local_addr(Family::V4) else {
            return;
        };
        let (tx, rx) = channel();
        let tx = Mutex::new(tx);
        c.register_handler(5, move |env, _| {
            assert_ne!(env.payload, b"boom");
            let _ = tx.lock().unwrap().send(env.payload.to_vec());
        });
        c.start().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        let target = SocketAddr::new("127.0.0.1".parse().unwrap(), local.port());
        let a = MeshId::random();
        sender.send_to(&proto::encode(&a, 5, b"boom"), target).unwrap();
        sender.send_to(&proto::encode(&a, 5, b"ok"), target).unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), b"ok");
        assert!(!c.is_errored());
    }

    #[test]
    #[should_panic]
    fn test_send_negative_type() {
        let c = client();
        let _ = c.send_message(MeshId::random(), -1, b"");
    }
}
