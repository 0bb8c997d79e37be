use crate::peer::Peer;
use crate::proto::{
    self, canonical, payload, AppType, ControlType, Envelope, Family, Handlers, MeshId,
    MessageKind,
};
use std::collections::HashMap;
use std::io::{Error, ErrorKind, Result};
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering::Relaxed},
    Arc, Mutex,
};
use std::thread::{spawn, JoinHandle};
use std::time::{Duration, Instant};

use super::socket::DualSocket;

/// Default rendezvous port.
pub const DEFAULT_PORT: u16 = 6702;

/// Server engine settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// bound on both families, 0 picks ephemeral ports
    pub port: u16,
    /// membership broadcast period
    pub broadcast_interval: Duration,
    /// peers silent for longer are evicted
    pub peer_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            broadcast_interval: Duration::from_secs(10),
            peer_timeout: Duration::from_secs(60),
        }
    }
}

/// Mesh rendezvous server
///
/// keep traces of all peers, broadcast membership and endpoints, relay traffic between peers
/// without a direct path.
pub struct Server {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<Result<()>>>,
}

struct Shared {
    id: MeshId,
    config: ServerConfig,
    sockets: DualSocket,
    registry: Mutex<Registry>,
    handlers: Handlers,
    exit: AtomicBool,
    errored: AtomicBool,
}

/// Registered peers plus the cached membership payload.
#[derive(Default)]
struct Registry {
    peers: HashMap<MeshId, Peer>,
    membership: Option<Vec<u8>>,
}

impl Registry {
    /// Record a registration from `source`. Returns true for a new peer.
    fn register(
        &mut self,
        id: MeshId,
        source: SocketAddr,
        endpoints: &[SocketAddr],
        now: Instant,
    ) -> bool {
        let mut new = false;
        let peer = self.peers.entry(id).or_insert_with(|| {
            new = true;
            Peer::new(id)
        });

        peer.set_contact(source);
        peer.add_candidate(source);
        for endpoint in endpoints {
            peer.add_candidate(*endpoint);
        }
        peer.touch(now);

        if new {
            self.membership = None;
        }
        new
    }

    fn evict_stale(&mut self, now: Instant, timeout: Duration) -> Vec<MeshId> {
        let mut evicted = Vec::new();
        self.peers.retain(|id, peer| {
            let stale = peer.is_stale(now, timeout);
            if stale {
                evicted.push(*id);
            }
            !stale
        });

        if !evicted.is_empty() {
            self.membership = None;
        }
        evicted
    }

    fn membership(&mut self) -> &[u8] {
        let peers = &self.peers;
        self.membership
            .get_or_insert_with(|| payload::membership(peers.keys()))
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Server {
    /// Bind the v4 and v6 sockets on the configured port.
    pub fn new(id: MeshId, config: ServerConfig) -> Result<Self> {
        let sockets = DualSocket::bind(config.port, false)?;
        for family in [Family::V4, Family::V6] {
            if let Some(local) = sockets.local_addr(family) {
                log::info!("listening on {} {}", family, local);
            }
        }

        Ok(Self {
            shared: Arc::new(Shared {
                id,
                config,
                sockets,
                registry: Default::default(),
                handlers: Default::default(),
                exit: Default::default(),
                errored: Default::default(),
            }),
            thread: None,
        })
    }

    pub fn id(&self) -> MeshId {
        self.shared.id
    }

    /// Run the server on the calling thread until shut down from elsewhere or a fatal error.
    pub fn run(&self) -> Result<()> {
        self.shared.run()
    }

    /// Run the server on a background thread.
    pub fn start(&mut self) -> Result<()> {
        if self.thread.is_some() {
            return Err(Error::new(ErrorKind::Other, "server already started"));
        }

        let shared = self.shared.clone();
        self.thread = Some(spawn(move || shared.run()));
        Ok(())
    }

    pub fn shutdown(&mut self) {
        self.shared.exit.store(true, Relaxed);
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }

    pub fn is_errored(&self) -> bool {
        self.shared.errored.load(Relaxed)
    }

    pub fn local_addr(&self, family: Family) -> Option<SocketAddr> {
        self.shared.sockets.local_addr(family)
    }

    /// # Panics
    ///
    /// Panics if `msg_type` is negative.
    pub fn register_handler<F>(&self, msg_type: i32, handler: F)
    where
        F: Fn(&Envelope<'_>, Option<SocketAddr>) + Send + Sync + 'static,
    {
        self.shared.handlers.register(msg_type, handler);
    }

    /// Snapshot of registered peers.
    pub fn peers(&self) -> Vec<Peer> {
        let registry = self.shared.registry.lock().unwrap();
        registry.peers.values().cloned().collect()
    }

    /// Send an application message straight to a registered peer, IPv6 first.
    ///
    /// # Panics
    ///
    /// Panics if `msg_type` is negative.
    pub fn send_message(&self, dest: MeshId, msg_type: i32, data: &[u8]) -> Result<()> {
        let msg_type = AppType::new(msg_type);
        let contact = self
            .shared
            .contact(&dest)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, "peer not registered"))?;

        let msg = proto::encode(&self.shared.id, msg_type.code(), data);
        self.shared.sockets.send_to(&msg, contact);
        Ok(())
    }
}

impl Shared {
    fn run(&self) -> Result<()> {
        let res = self.sockets.run(
            &self.exit,
            &self.errored,
            self.config.broadcast_interval,
            |buf, from| self.handle_datagram(buf, from),
            || self.broadcast(),
        );

        if let Err(e) = &res {
            log::error!("server receive loop failed: {}", e);
        }
        res
    }

    /// Confirmed endpoint of a live peer, IPv6 preferred.
    fn contact(&self, id: &MeshId) -> Option<SocketAddr> {
        let registry = self.registry.lock().unwrap();
        let peer = registry.peers.get(id)?;
        [Family::V6, Family::V4]
            .into_iter()
            .filter(|f| self.sockets.has(*f))
            .find_map(|f| peer.contact(f))
    }

    fn broadcast(&self) {
        let mut registry = self.registry.lock().unwrap();

        for id in registry.evict_stale(Instant::now(), self.config.peer_timeout) {
            log::info!("peer {} timed out", id);
        }

        let membership = proto::encode(
            &self.id,
            ControlType::Membership.code(),
            registry.membership(),
        );
        let endpoints: Vec<Vec<u8>> = registry
            .peers
            .values_mut()
            .map(|peer| {
                let id = peer.id();
                proto::encode(
                    &self.id,
                    ControlType::PeerEndpoints.code(),
                    &payload::peer_endpoints(&id, peer.endpoint_list()),
                )
            })
            .collect();

        for peer in registry.peers.values() {
            let contacts = [peer.contact(Family::V4), peer.contact(Family::V6)];
            for contact in contacts.into_iter().flatten() {
                self.sockets.send_to(&membership, contact);
                for msg in &endpoints {
                    self.sockets.send_to(msg, contact);
                }
            }
        }
    }

    fn handle_datagram(&self, buf: &[u8], from: SocketAddr) {
        let from = canonical(from);
        let Some(env) = proto::decode(buf) else {
            log::trace!("dropping {} bytes from {}", buf.len(), from);
            return;
        };

        match env.kind() {
            MessageKind::Control(ControlType::Register) => self.handle_register(&env, from),
            MessageKind::Control(ControlType::RelayRequest) => self.handle_relay(&env),
            MessageKind::Control(ControlType::ObservedAddress) => self.handle_observed(&env),
            MessageKind::Control(ctl) => {
                log::trace!("ignoring client-bound {:?} from {}", ctl, from)
            }
            MessageKind::App(_) => {
                if let Some(peer) = self.registry.lock().unwrap().peers.get_mut(&env.sender) {
                    peer.touch(Instant::now());
                }
                self.handlers.dispatch(&env, Some(from));
            }
            MessageKind::Reserved(code) => log::trace!("unknown control type {}", code),
        }
    }

    fn handle_register(&self, env: &Envelope<'_>, from: SocketAddr) {
        let Some(endpoints) = payload::read_endpoints(env.payload) else {
            log::trace!("malformed registration from {}", from);
            return;
        };

        let mut registry = self.registry.lock().unwrap();
        if registry.register(env.sender, from, &endpoints, Instant::now()) {
            log::info!("peer {} registered from {}", env.sender, from);
        }
    }

    fn handle_relay(&self, env: &Envelope<'_>) {
        let Some(req) = payload::RelayRequest::parse(env.bytes) else {
            log::trace!("short relay request from {}", env.sender);
            return;
        };

        if !req.is_forwardable() {
            log::debug!(
                "refusing to relay control type {} from {}",
                req.inner_type,
                env.sender
            );
            return;
        }

        let Some(contact) = self.contact(&req.destination) else {
            log::trace!("relay target {} not connected", req.destination);
            return;
        };

        let mut delivery = Vec::with_capacity(env.bytes.len());
        proto::write_header(&mut delivery, &self.id, ControlType::RelayDelivery.code());
        delivery.extend_from_slice(&env.bytes[proto::HEADER_LEN..]);

        log::debug!("relay {} -> {}", env.sender, req.destination);
        self.sockets.send_to(&delivery, contact);
    }

    fn handle_observed(&self, env: &Envelope<'_>) {
        let Some((id, observed)) = payload::read_observed_address(env.payload) else {
            log::trace!("malformed address hint from {}", env.sender);
            return;
        };

        let mut registry = self.registry.lock().unwrap();
        if let Some(peer) = registry.peers.get_mut(&id) {
            if peer.add_candidate(observed) {
                log::debug!("{} saw {} at {}", env.sender, id, observed);
            }
        }
    }
}
