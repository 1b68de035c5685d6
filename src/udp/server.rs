use std::io::{ErrorKind, Result};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Instant;

use super::directory::PeerDirectory;
use crate::proto::{Message, Transmit, MAX_DATAGRAM, TARGET_NOT_FOUND, UNKNOWN_ID};

/// Request matcher of the rendezvous server.
///
/// Owns the peer directory and turns every received datagram into the
/// replies to send, without doing any io itself.
#[derive(Debug, Default)]
pub struct Rendezvous {
    peers: PeerDirectory,
}

impl Rendezvous {
    pub fn new(peers: PeerDirectory) -> Self {
        Self { peers }
    }

    pub fn peers(&self) -> &PeerDirectory {
        &self.peers
    }

    /// Handle one datagram received from `addr`, then sweep expired peers.
    pub fn handle_datagram(&mut self, buf: &[u8], addr: SocketAddr, now: Instant) -> Vec<Transmit> {
        let replies = match Message::parse(buf) {
            Ok(msg) => self.handle_message(msg, addr, now),
            Err(e) if e.kind() == ErrorKind::Unsupported => {
                log::info!(
                    "unknown message from {}: {}",
                    addr,
                    String::from_utf8_lossy(buf).trim_end()
                );
                vec![]
            }
            Err(e) => {
                log::debug!("drop malformed message from {}: {}", addr, e);
                vec![]
            }
        };

        self.peers.sweep(now);
        replies
    }

    fn handle_message(&mut self, msg: Message, addr: SocketAddr, now: Instant) -> Vec<Transmit> {
        match msg {
            Message::Register { id } => self.handle_register(id, addr, now),
            Message::Request { requester, target } => {
                self.handle_request(requester, target, addr)
            }
            Message::Keepalive { id } => {
                log::trace!("keepalive {}", id);
                self.peers.touch(&id, now);
                vec![]
            }
            Message::Unregister { id } => {
                if self.peers.remove(&id).is_some() {
                    log::info!("unregister {}", id);
                }
                vec![]
            }
            msg => {
                log::info!("unexpected message from {}: {}", addr, msg);
                vec![]
            }
        }
    }

    fn handle_register(&mut self, id: String, addr: SocketAddr, now: Instant) -> Vec<Transmit> {
        if self.peers.register(&id, addr, now).is_none() {
            // no reply, the client just times out
            log::warn!(
                "directory full ({} peers), drop registration of {} from {}",
                self.peers.capacity(),
                id,
                addr
            );
            return vec![];
        }

        log::info!("register {} from {}", id, addr);
        vec![Transmit::new(addr, Message::Registered { id, addr })]
    }

    fn handle_request(
        &mut self,
        requester: Option<String>,
        target: String,
        addr: SocketAddr,
    ) -> Vec<Transmit> {
        let requester = requester.unwrap_or_else(|| {
            self.peers
                .find_by_addr(addr)
                .unwrap_or(UNKNOWN_ID)
                .to_string()
        });
        log::debug!("request {} -> {}", requester, target);

        let target_addr = match self.peers.get(&target) {
            Some(t) => t.addr,
            None => {
                log::info!("request from {}: target {} not found", requester, target);
                return vec![Transmit::new(
                    addr,
                    Message::Error {
                        reason: TARGET_NOT_FOUND.to_string(),
                        detail: target,
                    },
                )];
            }
        };

        log::info!("introduce {} ({}) and {} ({})", requester, addr, target, target_addr);
        vec![
            Transmit::new(
                addr,
                Message::Peer {
                    id: target,
                    addr: target_addr,
                },
            ),
            Transmit::new(
                target_addr,
                Message::Peer {
                    id: requester,
                    addr,
                },
            ),
        ]
    }
}

/// Udp rendezvous server
///
/// keep traces of all peers, and introduce them to each other on request.
pub struct Server {
    socket: UdpSocket,
    rendezvous: Rendezvous,
}

impl Server {
    pub fn new<A: ToSocketAddrs>(listen_addr: A) -> Result<Self> {
        Self::with_directory(listen_addr, PeerDirectory::default())
    }

    pub fn with_directory<A: ToSocketAddrs>(listen_addr: A, peers: PeerDirectory) -> Result<Self> {
        let socket = UdpSocket::bind(listen_addr)?;

        Ok(Self {
            socket,
            rendezvous: Rendezvous::new(peers),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn run(mut self) -> Result<()> {
        let mut buf = [0; MAX_DATAGRAM];
        log::info!("rendezvous server listening on {}", self.local_addr()?);

        loop {
            let (size, addr) = match self.socket.recv_from(&mut buf) {
                Ok(r) => r,
                Err(e) => {
                    log::debug!("recv error {}", e);
                    continue;
                }
            };

            let replies = self
                .rendezvous
                .handle_datagram(&buf[..size], addr, Instant::now());
            for t in replies {
                if let Err(e) = self.socket.send_to(&t.msg.to_bytes(), t.dst) {
                    log::debug!("send to {} failed: {}", t.dst, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::udp::directory::{DEFAULT_CAPACITY, DEFAULT_TTL};
    use std::time::Duration;

    fn addr(port: u16) -> SocketAddr {
        ([198, 51, 100, 1], port).into()
    }

    fn handle(r: &mut Rendezvous, s: &str, from: SocketAddr, now: Instant) -> Vec<Transmit> {
        r.handle_datagram(s.as_bytes(), from, now)
    }

    #[test]
    fn test_register_replies_observed_address() {
        let now = Instant::now();
        let mut r = Rendezvous::default();

        let replies = handle(&mut r, "REGISTER alice", addr(4000), now);
        assert_eq!(
            replies,
            vec![Transmit::new(
                addr(4000),
                Message::Registered {
                    id: "alice".into(),
                    addr: addr(4000)
                }
            )]
        );

        // re-registration from a remapped port moves the record
        handle(&mut r, "REGISTER alice", addr(4001), now);
        assert_eq!(r.peers().len(), 1);
        assert_eq!(r.peers().get("alice").unwrap().addr, addr(4001));
    }

    #[test]
    fn test_register_when_full_is_silent() {
        let now = Instant::now();
        let mut r = Rendezvous::default();
        for i in 0..DEFAULT_CAPACITY {
            let replies = handle(&mut r, &format!("REGISTER p{}", i), addr(i as u16), now);
            assert_eq!(replies.len(), 1);
        }

        assert!(handle(&mut r, "REGISTER late", addr(9000), now).is_empty());
        assert!(r.peers().get("late").is_none());
    }

    #[test]
    fn test_request_unknown_target() {
        let now = Instant::now();
        let mut r = Rendezvous::default();
        handle(&mut r, "REGISTER alice", addr(4000), now);

        let replies = handle(&mut r, "REQUEST alice carol", addr(4000), now);
        assert_eq!(
            replies,
            vec![Transmit::new(
                addr(4000),
                Message::Error {
                    reason: TARGET_NOT_FOUND.into(),
                    detail: "carol".into()
                }
            )]
        );
    }

    #[test]
    fn test_request_introduces_both_sides() {
        let now = Instant::now();
        let mut r = Rendezvous::default();
        handle(&mut r, "REGISTER alice", addr(4000), now);
        handle(&mut r, "REGISTER bob", addr(5000), now);

        let replies = handle(&mut r, "REQUEST alice bob", addr(4000), now);
        assert_eq!(
            replies,
            vec![
                Transmit::new(
                    addr(4000),
                    Message::Peer {
                        id: "bob".into(),
                        addr: addr(5000)
                    }
                ),
                Transmit::new(
                    addr(5000),
                    Message::Peer {
                        id: "alice".into(),
                        addr: addr(4000)
                    }
                ),
            ]
        );
    }

    #[test]
    fn test_request_without_requester_id() {
        let now = Instant::now();
        let mut r = Rendezvous::default();
        handle(&mut r, "REGISTER alice", addr(4000), now);
        handle(&mut r, "REGISTER bob", addr(5000), now);

        let replies = handle(&mut r, "REQUEST bob", addr(4000), now);
        assert_eq!(
            replies[1].msg,
            Message::Peer {
                id: "alice".into(),
                addr: addr(4000)
            }
        );

        // unregistered source falls back to a placeholder id
        let replies = handle(&mut r, "REQUEST bob", addr(6000), now);
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].dst, addr(6000));
        assert_eq!(
            replies[1],
            Transmit::new(
                addr(5000),
                Message::Peer {
                    id: UNKNOWN_ID.into(),
                    addr: addr(6000)
                }
            )
        );
    }

    #[test]
    fn test_keepalive_and_unregister_are_silent() {
        let now = Instant::now();
        let mut r = Rendezvous::default();
        handle(&mut r, "REGISTER alice", addr(4000), now);

        let later = now + Duration::from_secs(100);
        assert!(handle(&mut r, "KEEPALIVE alice", addr(4999), later).is_empty());
        let p = r.peers().get("alice").unwrap();
        assert_eq!(p.last_activity, later);
        assert_eq!(p.addr, addr(4000));

        assert!(handle(&mut r, "KEEPALIVE nobody", addr(4000), later).is_empty());
        assert!(handle(&mut r, "UNREGISTER nobody", addr(4000), later).is_empty());
        assert!(handle(&mut r, "UNREGISTER alice", addr(4000), later).is_empty());
        assert!(r.peers().is_empty());
    }

    #[test]
    fn test_malformed_and_unknown_are_dropped() {
        let now = Instant::now();
        let mut r = Rendezvous::default();

        assert!(handle(&mut r, "REGISTER", addr(4000), now).is_empty());
        assert!(handle(&mut r, "REQUEST", addr(4000), now).is_empty());
        assert!(handle(&mut r, "HELLO server", addr(4000), now).is_empty());
        assert!(handle(&mut r, "PUNCH bob seq=1", addr(4000), now).is_empty());
        assert!(r.peers().is_empty());
    }

    #[test]
    fn test_sweep_after_every_datagram() {
        let now = Instant::now();
        let mut r = Rendezvous::default();
        handle(&mut r, "REGISTER alice", addr(4000), now);
        handle(&mut r, "REGISTER bob", addr(5000), now + Duration::from_secs(60));

        // even garbage triggers the sweep
        let later = now + DEFAULT_TTL + Duration::from_secs(1);
        handle(&mut r, "garbage", addr(7000), later);
        assert!(r.peers().get("alice").is_none());
        assert!(r.peers().get("bob").is_some());

        let replies = handle(&mut r, "REQUEST bob alice", addr(5000), later);
        assert_eq!(replies.len(), 1);
        assert!(matches!(replies[0].msg, Message::Error { .. }));
    }

    #[test]
    fn test_server_over_loopback() {
        let s = Server::new("127.0.0.1:0").unwrap();
        let server_addr = s.local_addr().unwrap();
        std::thread::spawn(move || s.run());

        let c = UdpSocket::bind("127.0.0.1:0").unwrap();
        c.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        c.send_to(b"REGISTER alice", server_addr).unwrap();

        let mut buf = [0; MAX_DATAGRAM];
        let (n, from) = c.recv_from(&mut buf).unwrap();
        assert_eq!(from, server_addr);
        assert_eq!(
            Message::parse(&buf[..n]).unwrap(),
            Message::Registered {
                id: "alice".into(),
                addr: c.local_addr().unwrap()
            }
        );
    }
}
