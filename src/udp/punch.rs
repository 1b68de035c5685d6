use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Probes sent per round, to consecutive ports starting at the base port.
pub const PROBES_PER_ROUND: u16 = 16;

/// Rounds before backing off.
pub const MAX_ROUNDS: u32 = 40;

/// Gap between two probes of the same round.
pub const PROBE_SPACING: Duration = Duration::from_millis(10);

/// Pause after each round.
pub const ROUND_PAUSE: Duration = Duration::from_millis(200);

/// Pause after `MAX_ROUNDS` rounds, before starting over.
pub const EXHAUSTED_PAUSE: Duration = Duration::from_secs(1);

pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Probe {
    pub dst: SocketAddr,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Round {
    Burst(Vec<Probe>),
    /// `MAX_ROUNDS` went by without success, punching resumes after `EXHAUSTED_PAUSE`.
    Exhausted,
}

/// Port prediction hole puncher.
///
/// NATs tend to map a new outbound flow to a port near the one the server
/// observed, so every round sprays the ports right above it.
#[derive(Debug, Default)]
pub struct PunchEngine {
    base: Option<SocketAddr>,
    rounds: u32,
    seq: u64,
    next_round: Option<Instant>,
}

impl PunchEngine {
    /// Aim at `base`, the first round is due right away.
    pub fn start(&mut self, base: SocketAddr, now: Instant) {
        self.base = Some(base);
        self.rounds = 0;
        self.next_round = Some(now);
    }

    pub fn stop(&mut self) {
        self.base = None;
        self.next_round = None;
    }

    pub fn is_active(&self) -> bool {
        self.base.is_some()
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.next_round
    }

    /// Next round if one is due at `now`.
    pub fn poll(&mut self, now: Instant) -> Option<Round> {
        let base = self.base?;
        if now < self.next_round? {
            return None;
        }

        if self.rounds >= MAX_ROUNDS {
            self.rounds = 0;
            self.next_round = Some(now + EXHAUSTED_PAUSE);
            return Some(Round::Exhausted);
        }

        let probes = (0..PROBES_PER_ROUND)
            .filter_map(|i| base.port().checked_add(i))
            .map(|port| {
                self.seq += 1;
                Probe {
                    dst: SocketAddr::new(base.ip(), port),
                    seq: self.seq,
                }
            })
            .collect();

        self.rounds += 1;
        self.next_round = Some(now + ROUND_PAUSE);
        Some(Round::Burst(probes))
    }
}

/// Fixed cadence timer for server keepalives.
#[derive(Debug, Copy, Clone)]
pub struct Keepalive {
    interval: Duration,
    next: Instant,
}

impl Keepalive {
    /// First keepalive is due one interval after `now`.
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            next: now + interval,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.next
    }

    /// True when a keepalive is due, the timer is then rearmed.
    pub fn poll(&mut self, now: Instant) -> bool {
        if now < self.next {
            return false;
        }

        self.next = now + self.interval;
        true
    }
}
