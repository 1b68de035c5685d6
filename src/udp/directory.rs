use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Maximum number of peers tracked at once.
pub const DEFAULT_CAPACITY: usize = 128;

/// Inactivity after which a peer is evicted.
pub const DEFAULT_TTL: Duration = Duration::from_secs(120);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Source address of the last registration, as seen by the server.
    pub addr: SocketAddr,
    pub last_activity: Instant,
}

/// Bounded registry of peers keyed by their self-asserted id.
#[derive(Debug)]
pub struct PeerDirectory {
    peers: HashMap<String, PeerRecord>,
    capacity: usize,
    ttl: Duration,
}

impl Default for PeerDirectory {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

impl PeerDirectory {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            peers: HashMap::with_capacity(capacity),
            capacity,
            ttl,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Create or refresh the record of `id`.
    ///
    /// Returns `None` when the directory is full and `id` is new, in which
    /// case nothing is recorded.
    pub fn register(&mut self, id: &str, addr: SocketAddr, now: Instant) -> Option<PeerRecord> {
        if let Some(p) = self.peers.get_mut(id) {
            p.addr = addr;
            p.last_activity = now;
            return Some(*p);
        }

        if self.peers.len() >= self.capacity {
            return None;
        }

        let p = PeerRecord {
            addr,
            last_activity: now,
        };
        self.peers.insert(id.to_string(), p);
        Some(p)
    }

    /// Refresh the activity timestamp, the stored address is left alone.
    pub fn touch(&mut self, id: &str, now: Instant) -> bool {
        match self.peers.get_mut(id) {
            Some(p) => {
                p.last_activity = now;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<PeerRecord> {
        self.peers.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&PeerRecord> {
        self.peers.get(id)
    }

    /// Find the id last seen at `addr`.
    ///
    /// Several ids may share a source address while a NAT remaps, the most
    /// recently active one wins.
    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<&str> {
        self.peers
            .iter()
            .filter(|(_, p)| p.addr == addr)
            .max_by_key(|(_, p)| p.last_activity)
            .map(|(id, _)| id.as_str())
    }

    /// Evict every peer idle for longer than the ttl, returning their ids.
    pub fn sweep(&mut self, now: Instant) -> Vec<String> {
        let ttl = self.ttl;
        let mut expired = vec![];
        self.peers.retain(|id, p| {
            let alive = now.saturating_duration_since(p.last_activity) <= ttl;
            if !alive {
                log::debug!("expired {}", id);
                expired.push(id.clone());
            }
            alive
        });

        expired
    }
}
