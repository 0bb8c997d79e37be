use std::error::Error;
use std::net::SocketAddr;
use std::sync::mpsc::channel;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};
use udpmesh::proto::{Family, MeshId};
use udpmesh::udp::{Client, ClientConfig, Server, ServerConfig};

const HELLO: i32 = 1;

fn client(server_addr: SocketAddr) -> Result<Client, Box<dyn Error>> {
    let config = ClientConfig {
        server_v4: Some(server_addr),
        local_addresses: vec!["127.0.0.1".parse()?],
        heartbeat_interval: Duration::from_millis(200),
        ..Default::default()
    };
    let mut c = Client::new(MeshId::random(), config)?;
    c.start()?;
    Ok(c)
}

fn main() -> Result<(), Box<dyn Error>> {
    let mut server = Server::new(
        MeshId::random(),
        ServerConfig {
            port: 0,
            broadcast_interval: Duration::from_millis(200),
            ..Default::default()
        },
    )?;
    server.start()?;
    let port = server.local_addr(Family::V4).ok_or("no v4 socket")?.port();
    let server_addr: SocketAddr = ([127, 0, 0, 1], port).into();

    let c1 = client(server_addr)?;
    let c2 = client(server_addr)?;

    let (tx, rx) = channel();
    let tx = Mutex::new(tx);
    c1.register_handler(HELLO, move |env, from| {
        println!("{} from {:?}: {:?}", env.sender, from, String::from_utf8_lossy(env.payload));
        let _ = tx.lock().unwrap().send(env.payload.to_vec());
    });

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match c2.peer(&c1.id()) {
            Some(p) if p.uses_v4() => {
                c2.send_message(c1.id(), HELLO, b"hello")?;
                break;
            }
            _ if Instant::now() > deadline => return Err("no direct path between clients".into()),
            _ => thread::sleep(Duration::from_millis(200)),
        }
    }

    let data = rx.recv_timeout(Duration::from_secs(5))?;
    assert_eq!(data, b"hello");

    Ok(())
}
