use std::collections::HashMap;
use std::io::{Error, ErrorKind, Result};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use structopt::StructOpt;
use tokio::net::lookup_host;
use tokio::{select, signal, time};
use udpmesh::interfaces::local_addresses;
use udpmesh::proto::{Family, MeshId};
use udpmesh::stun::{DEFAULT_STUN_SERVERS, STUN_PORT};
use udpmesh::udp::{Client, ClientConfig, Server, ServerConfig};

/// Message type the status loop pings peers with.
const PING_TYPE: i32 = 0;
const LOST_CONTACT: Duration = Duration::from_secs(30);

#[derive(StructOpt, Debug)]
#[structopt(name = "udpmesh")]
enum Opt {
    Client(ClientOpt),
    Server(ServerOpt),
}

#[derive(StructOpt, Debug)]
struct ClientOpt {
    #[structopt(long = "server-host")]
    server_host: String,

    #[structopt(long = "port", default_value = "6702")]
    port: u16,

    #[structopt(long = "bind-port", default_value = "0")]
    bind_port: u16,

    #[structopt(long = "interval-secs", default_value = "10")]
    interval_secs: u64,

    /// STUN host, may be repeated
    #[structopt(long = "stun-server")]
    stun_servers: Vec<String>,

    #[structopt(long = "no-stun")]
    no_stun: bool,
}

#[derive(StructOpt, Debug)]
struct ServerOpt {
    #[structopt(long = "port", default_value = "6702")]
    port: u16,

    #[structopt(long = "interval-secs", default_value = "10")]
    interval_secs: u64,

    #[structopt(long = "timeout-secs", default_value = "60")]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opt: Opt = StructOpt::from_args();

    match opt {
        Opt::Server(opt) => run_server(opt).await,
        Opt::Client(opt) => run_client(opt).await,
    }
}

async fn run_server(opt: ServerOpt) -> Result<()> {
    let config = ServerConfig {
        port: opt.port,
        broadcast_interval: Duration::from_secs(opt.interval_secs),
        peer_timeout: Duration::from_secs(opt.timeout_secs),
    };

    let mut s = Server::new(MeshId::random(), config)?;
    s.start()?;
    log::info!("server {} running", s.id());

    let mut check = time::interval(Duration::from_secs(1));
    loop {
        select! {
            _ = signal::ctrl_c() => break,
            _ = check.tick() => {
                if s.is_errored() {
                    return Err(Error::new(ErrorKind::Other, "server stopped"));
                }
            }
        }
    }

    s.shutdown();
    Ok(())
}

async fn run_client(opt: ClientOpt) -> Result<()> {
    let (server_v4, server_v6) = resolve_split(&opt.server_host, opt.port).await?;
    if server_v4.is_none() && server_v6.is_none() {
        return Err(Error::new(ErrorKind::Other, "no address for rendezvous server"));
    }

    let stun_servers = if opt.no_stun {
        Vec::new()
    } else {
        let hosts: Vec<String> = if opt.stun_servers.is_empty() {
            DEFAULT_STUN_SERVERS.iter().map(|h| h.to_string()).collect()
        } else {
            opt.stun_servers
        };
        resolve_stun(&hosts).await
    };

    let local_addresses = local_addresses()?;
    for ip in &local_addresses {
        println!("IP: {}", ip);
    }

    let config = ClientConfig {
        server_v4,
        server_v6,
        local_addresses,
        stun_servers,
        bind_port: opt.bind_port,
        heartbeat_interval: Duration::from_secs(opt.interval_secs),
        ..Default::default()
    };

    let mut c = Client::new(MeshId::random(), config)?;
    println!("My id: {}", c.id());

    let last_ping: Arc<Mutex<HashMap<MeshId, Instant>>> = Default::default();
    {
        let last_ping = last_ping.clone();
        c.register_handler(PING_TYPE, move |env, _| {
            last_ping.lock().unwrap().insert(env.sender, Instant::now());
        });
    }
    c.start()?;

    let mut status = time::interval(Duration::from_secs(5));
    loop {
        select! {
            _ = signal::ctrl_c() => break,
            _ = status.tick() => {
                if c.is_errored() {
                    return Err(Error::new(ErrorKind::Other, "client stopped"));
                }
                print_status(&c, &last_ping.lock().unwrap());
            }
        }
    }

    c.shutdown();
    Ok(())
}

fn print_status(c: &Client, last_ping: &HashMap<MeshId, Instant>) {
    let mut families = String::new();
    if c.connected_v4() {
        families.push_str("V4 ");
    }
    if c.connected_v6() {
        families.push_str("V6 ");
    }
    println!("Us, {}, Connected: {}", c.id(), families);

    for peer in c.peers() {
        let _ = c.send_message(peer.id(), PING_TYPE, &[]);

        let contact = match last_ping.get(&peer.id()) {
            Some(t) if t.elapsed() > LOST_CONTACT => ", LOST CONTACT",
            Some(_) => "",
            None => ", NO CONTACT",
        };
        println!(
            "{}, {:?}, Latency v4 (ms): {}, Latency v6 (ms): {}, Offset (s): {:.2}{}",
            peer.id(),
            peer.connectivity(),
            latency_ms(peer.latency(Family::V4)),
            latency_ms(peer.latency(Family::V6)),
            peer.clock_offset_micros() as f64 / 1_000_000.0,
            contact
        );
    }
}

fn latency_ms(d: Duration) -> String {
    if d == Duration::MAX {
        "-".to_string()
    } else {
        format!("{:.2}", d.as_secs_f64() * 1000.0)
    }
}

/// First IPv4 and first IPv6 address of a host.
async fn resolve_split(host: &str, port: u16) -> Result<(Option<SocketAddr>, Option<SocketAddr>)> {
    let mut v4 = None;
    let mut v6 = None;
    for addr in lookup_host((host, port)).await? {
        match addr.ip() {
            IpAddr::V4(_) => v4 = v4.or(Some(addr)),
            IpAddr::V6(_) => v6 = v6.or(Some(addr)),
        }
    }

    match v4 {
        Some(a) => log::info!("connecting to {}", a),
        None => log::warn!("unable to lookup {} v4", host),
    }
    match v6 {
        Some(a) => log::info!("connecting to {}", a),
        None => log::warn!("unable to lookup {} v6", host),
    }

    Ok((v4, v6))
}

async fn resolve_stun(hosts: &[String]) -> Vec<SocketAddr> {
    let mut servers = Vec::new();
    for host in hosts {
        match resolve_split(host, STUN_PORT).await {
            Ok((v4, v6)) => servers.extend(v4.into_iter().chain(v6)),
            Err(e) => log::warn!("failed to resolve stun server {}: {}", host, e),
        }
    }
    servers
}
