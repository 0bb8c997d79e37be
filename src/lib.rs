//!A UDP peer-to-peer mesh for nodes behind NAT, coordinated by a rendezvous server.
//!
//!Nodes behind a NAT or firewall only accept traffic on ports they recently sent from.
//!To talk directly, two such nodes must learn each other's externally visible addresses and
//!send each other packets first. This applies to ipv4 and ipv6 alike, ipv4 has to deal with
//!NAT, both have to deal with firewalls.
//!
//!## How udpmesh works
//!A publicly reachable server acts as the rendezvous point. Every node has a random 128-bit
//!identity and registers its candidate endpoints with the server: its local interface
//!addresses, plus the external address a STUN server reports for it. The server observes the
//!address each registration arrives from, and periodically tells every node who is in the mesh
//!and every member's candidate endpoints.
//!
//!Nodes then heartbeat each other's candidates from the same sockets they use to talk to the
//!server. The first candidate that answers becomes the confirmed direct endpoint for that
//!address family, and heartbeat replies measure round trip time and clock offset. Application
//!messages go to the lower latency family, or through the server when no direct path exists.
//!
//!When a node receives a heartbeat over a path it has not confirmed yet, it tells the server
//!where it saw the sender. The server adds that address to the sender's candidates, so the
//!rest of the mesh gets to try it too.
//!
//!The protocol is unauthenticated and unencrypted, and delivery is best effort.
//!
//!## Feature flags
//!Both engines are built by default. An embedding that only joins a mesh, or only hosts the
//!rendezvous point, can turn off the defaults and pick the one engine it needs.
//!
//!```text
//!udpmesh = { version = "0.1", default-features=false, features=["client"]}
//!```
//!
//!- `client`: mesh client engine
//!- `server`: rendezvous server engine

pub mod interfaces;
pub mod peer;
pub mod proto;
pub mod stun;
pub mod udp;
