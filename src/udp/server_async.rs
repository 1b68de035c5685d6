use std::io::Result;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::net::{ToSocketAddrs, UdpSocket};

use super::directory::PeerDirectory;
use super::server::Rendezvous;
use crate::proto::MAX_DATAGRAM;

/// Udp rendezvous server running on tokio.
///
/// Same behavior as [`super::Server`], for embedding in an async application.
pub struct Server {
    socket: UdpSocket,
    rendezvous: Rendezvous,
}

impl Server {
    pub async fn new<A: ToSocketAddrs>(listen_addr: A) -> Result<Self> {
        Self::with_directory(listen_addr, PeerDirectory::default()).await
    }

    pub async fn with_directory<A: ToSocketAddrs>(
        listen_addr: A,
        peers: PeerDirectory,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(listen_addr).await?;

        Ok(Self {
            socket,
            rendezvous: Rendezvous::new(peers),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn run(mut self) -> Result<()> {
        let mut buf = [0; MAX_DATAGRAM];
        log::info!("rendezvous server listening on {}", self.local_addr()?);

        loop {
            let (size, addr) = match self.socket.recv_from(&mut buf).await {
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
                if let Err(e) = self.socket.send_to(&t.msg.to_bytes(), t.dst).await {
                    log::debug!("send to {} failed: {}", t.dst, e);
                }
            }
        }
    }
}
