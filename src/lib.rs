//!A udp rendezvous server and hole punching client, to help two peers behind NAT talk directly.
//!
//!A node behind NAT (such as a home gateway) only receives traffic from addresses it sent traffic to first,
//!and it cannot know which public port its gateway picked for it.
//!
//!## How it works
//!Setup a public accessible server as rendezvous point. It observes the public address of every peer and
//!introduces peers to each other, it never relays application data.
//!
//!Each peer registers with a self chosen identity, the server associates the identity with the observed
//!address and tells the peer how it was seen. A peer keeps its registration alive with periodic keepalives.
//!
//!A peer asks the server for a target identity. The server sends each side the address of the other one,
//!and both start sending probes at the same time. Each probe burst sprays the ports right above the
//!observed one, as many NATs allocate the port of a new flow close to the previous one.
//!The first probe that gets through opens the path, its source address becomes the channel for
//!application messages.
//!
//!The essential is, we must use the same socket to talk with the rendezvous server and with peers.
//!
//!## Feature flags
//!For convenient, the crate include both client and server code by default.
//!Mostly you only use client or server code, set features to `client` or `server` instead.
//!
//!```toml
//!udpunch = { version = "0.1", default-features=false, features=["client"]}
//!```
//!
//!- `client`: udp session state machine and client
//!- `server`: rendezvous server
//!- `async`: rendezvous server on tokio, [`udp::AsyncServer`]

pub mod proto;
pub mod udp;
