//! UDP mesh engines.
//!
//! use `Client` to join a mesh and exchange messages with other peers.
//!
//! use `Server` to run the rendezvous point.

mod socket;

#[cfg(feature = "client")]
mod client;
#[cfg(feature = "client")]
pub use client::{Client, ClientConfig};

#[cfg(feature = "server")]
mod server;
#[cfg(feature = "server")]
pub use server::{Server, ServerConfig, DEFAULT_PORT};

#[cfg(all(test, feature = "client", feature = "server"))]
mod tests {
    use super::*;
    use crate::proto::{Family, MeshId};
    use std::net::SocketAddr;
    use std::sync::mpsc::channel;
    use std::sync::Mutex;
    use std::thread::sleep;
    use std::time::{Duration, Instant};

    const INTERVAL: Duration = Duration::from_millis(100);

    fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            sleep(Duration::from_millis(20));
        }
    }

    fn start_client(server_addr: SocketAddr, heartbeat_interval: Duration) -> Client {
        let config = ClientConfig {
            server_v4: Some(server_addr),
            local_addresses: vec!["127.0.0.1".parse().unwrap()],
            heartbeat_interval,
            ..Default::default()
        };
        let mut c = Client::new(MeshId::random(), config).unwrap();
        c.start().unwrap();
        c
    }

    #[test]
    fn test_mesh() {
        let mut server = Server::new(
            MeshId::random(),
            ServerConfig {
                port: 0,
                broadcast_interval: INTERVAL,
                ..Default::default()
            },
        )
        .unwrap();
        let Some(local) = server.local_addr(Family::V4) else {
            return;
        };
        server.start().unwrap();
        let server_addr: SocketAddr = ([127, 0, 0, 1], local.port()).into();

        let c1 = start_client(server_addr, INTERVAL);
        let c2 = start_client(server_addr, INTERVAL);

        wait_for("both clients registered", || server.peers().len() == 2);
        wait_for("membership and endpoints", || {
            [(&c1, &c2), (&c2, &c1)].iter().all(|(me, other)| {
                me.peer(&other.id())
                    .is_some_and(|p| !p.candidates().is_empty())
            })
        });
        assert!(c1.connected_v4());

        wait_for("direct v4 path", || {
            [(&c1, &c2), (&c2, &c1)].iter().all(|(me, other)| {
                me.peer(&other.id()).is_some_and(|p| {
                    p.uses_v4() && p.latency(Family::V4) < Duration::from_secs(1)
                })
            })
        });

        let (tx, rx) = channel();
        let tx = Mutex::new(tx);
        c2.register_handler(7, move |env, from| {
            let _ = tx
                .lock()
                .unwrap()
                .send((env.sender, env.payload.to_vec(), from));
        });

        c1.send_message(c2.id(), 7, b"hello").unwrap();
        let (sender, data, from) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(sender, c1.id());
        assert_eq!(data, b"hello");
        assert_eq!(from.map(|a| a.port()), c1.local_addr(Family::V4).map(|a| a.port()));

        assert!(!c1.is_errored() && !c2.is_errored() && !server.is_errored());
    }

    #[test]
    fn test_relay_fallback() {
        let mut server = Server::new(
            MeshId::random(),
            ServerConfig {
                port: 0,
                broadcast_interval: INTERVAL,
                ..Default::default()
            },
        )
        .unwrap();
        let Some(local) = server.local_addr(Family::V4) else {
            return;
        };
        server.start().unwrap();
        let server_addr: SocketAddr = ([127, 0, 0, 1], local.port()).into();

        // clients register and heartbeat once, on their first tick only, so no
        // direct path ever gets confirmed
        let quiet = Duration::from_secs(600);
        let c1 = start_client(server_addr, quiet);
        let c2 = start_client(server_addr, quiet);

        wait_for("membership", || {
            c1.connected_v4() && c1.peer(&c2.id()).is_some() && c2.peer(&c1.id()).is_some()
        });
        let peer = c1.peer(&c2.id()).unwrap();
        assert_eq!(peer.select_route(true, true), None);

        let (tx, rx) = channel();
        let tx = Mutex::new(tx);
        c2.register_handler(9, move |env, from| {
            let _ = tx
                .lock()
                .unwrap()
                .send((env.sender, env.payload.to_vec(), from));
        });

        c1.send_message(c2.id(), 9, b"via-relay").unwrap();
        let (sender, data, from) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(sender, c1.id());
        assert_eq!(data, b"via-relay");
        assert_eq!(from, None);
    }

    #[test]
    fn test_eviction_drops_from_membership() {
        let mut server = Server::new(
            MeshId::random(),
            ServerConfig {
                port: 0,
                broadcast_interval: INTERVAL,
                peer_timeout: Duration::from_millis(500),
            },
        )
        .unwrap();
        let Some(local) = server.local_addr(Family::V4) else {
            return;
        };
        server.start().unwrap();
        let server_addr: SocketAddr = ([127, 0, 0, 1], local.port()).into();

        let c1 = start_client(server_addr, INTERVAL);
        let mut c2 = start_client(server_addr, INTERVAL);
        wait_for("c1 sees c2", || c1.peer(&c2.id()).is_some());

        let gone = c2.id();
        c2.shutdown();
        wait_for("c2 evicted", || {
            server.peers().iter().all(|p| p.id() != gone) && c1.peer(&gone).is_none()
        });
        assert!(server.peers().iter().any(|p| p.id() == c1.id()));
    }
}
