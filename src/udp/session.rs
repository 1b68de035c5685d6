//! Client side connection state machine.
//!
//! [`Session`] does no io: it is fed received datagrams, local input and the
//! current time, and answers with [`Action`]s for the caller to carry out.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use super::punch::{Keepalive, PunchEngine, Round, KEEPALIVE_INTERVAL, MAX_ROUNDS};
use crate::proto::{Message, Transmit};

/// Interval between two registration attempts.
pub const REGISTER_RETRY: Duration = Duration::from_secs(1);

/// Give up waiting for the registration confirmation after this long.
pub const REGISTER_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum State {
    Unregistered,
    Registering,
    Registered,
    AwaitingPeer,
    Punching,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: String,
    /// Address the server observed for the peer, its port is the punching base port.
    pub addr: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The server confirmed the registration and told us our public address.
    Registered(SocketAddr),
    RegistrationTimedOut,
    Peer(PeerInfo),
    /// A probe came through, `remote` is where it came from.
    Connected { remote: SocketAddr },
    Message {
        from: SocketAddr,
        sender: String,
        text: String,
    },
    ServerError { reason: String, detail: String },
    PunchExhausted,
    /// Local text was dropped because no peer is connected.
    NotConnected,
    Unrecognized { from: SocketAddr, data: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Send(Transmit),
    Notify(Event),
}

pub struct Session {
    id: String,
    target: Option<String>,
    server_addr: SocketAddr,
    state: State,
    register_started: Option<Instant>,
    next_register: Option<Instant>,
    observed: Option<SocketAddr>,
    peer: Option<PeerInfo>,
    remote: Option<SocketAddr>,
    punch: PunchEngine,
    keepalive: Option<Keepalive>,
}

impl Session {
    pub fn new<A: AsRef<str>>(id: A, target: Option<A>, server_addr: SocketAddr) -> Self {
        Self {
            id: id.as_ref().into(),
            target: target.map(|t| t.as_ref().into()),
            server_addr,
            state: State::Unregistered,
            register_started: None,
            next_register: None,
            observed: None,
            peer: None,
            remote: None,
            punch: Default::default(),
            keepalive: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == State::Connected
    }

    /// Our public address as reported by the server.
    pub fn observed_addr(&self) -> Option<SocketAddr> {
        self.observed
    }

    pub fn peer(&self) -> Option<&PeerInfo> {
        self.peer.as_ref()
    }

    /// Address application messages go to once connected.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    pub fn punch_rounds(&self) -> u32 {
        self.punch.rounds()
    }

    fn to_server(&self, msg: Message) -> Action {
        Action::Send(Transmit::new(self.server_addr, msg))
    }

    fn register_msg(&self) -> Action {
        self.to_server(Message::Register {
            id: self.id.clone(),
        })
    }

    /// Send the first registration and start the keepalive timer.
    pub fn start(&mut self, now: Instant) -> Vec<Action> {
        if self.state != State::Unregistered {
            return vec![];
        }

        log::info!("registering {} with {}", self.id, self.server_addr);
        self.state = State::Registering;
        self.register_started = Some(now);
        self.next_register = Some(now + REGISTER_RETRY);
        self.keepalive = Some(Keepalive::new(KEEPALIVE_INTERVAL, now));

        vec![self.register_msg()]
    }

    /// Leave the registration phase, confirmed or not.
    fn finish_registration(&mut self, actions: &mut Vec<Action>) {
        self.register_started = None;
        self.next_register = None;

        match self.target.clone() {
            Some(target) => {
                log::info!("requesting connection to {}", target);
                actions.push(self.to_server(Message::Request {
                    requester: Some(self.id.clone()),
                    target,
                }));
                self.state = State::AwaitingPeer;
            }
            None => self.state = State::Registered,
        }
    }

    pub fn handle_datagram(&mut self, buf: &[u8], from: SocketAddr, now: Instant) -> Vec<Action> {
        let mut actions = vec![];

        let msg = match Message::parse(buf) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("unrecognized datagram from {}: {}", from, e);
                actions.push(Action::Notify(Event::Unrecognized {
                    from,
                    data: String::from_utf8_lossy(buf).trim_end().to_string(),
                }));
                return actions;
            }
        };

        match (self.state, msg) {
            (State::Unregistered, msg) => {
                log::debug!("not started, ignore {} from {}", msg, from);
            }
            (State::Registering, Message::Registered { addr, .. }) => {
                log::info!("server observed us as {}", addr);
                self.observed = Some(addr);
                actions.push(Action::Notify(Event::Registered(addr)));
                self.finish_registration(&mut actions);
            }
            (State::Registering, msg) => {
                log::info!("server reply while registering: {}", msg);
            }
            (_, Message::Registered { addr, .. }) => {
                log::info!("late registration confirmation, observed as {}", addr);
                self.observed = Some(addr);
                actions.push(Action::Notify(Event::Registered(addr)));
            }
            (_, Message::Peer { id, addr }) => {
                log::info!("peer {} at {}, start punching", id, addr);
                let peer = PeerInfo { id, addr };
                self.peer = Some(peer.clone());
                self.remote = None;
                self.state = State::Punching;
                self.punch.start(addr, now);
                actions.push(Action::Notify(Event::Peer(peer)));
                self.punch_round(now, &mut actions);
            }
            (_, Message::Punch { sender, .. }) if sender == self.id => {
                log::trace!("own probe looped back from {}", from);
            }
            (_, Message::Punch { sender, seq }) => {
                if self.state != State::Connected {
                    log::info!("punched through: {} {:?} from {}", sender, seq, from);
                    self.state = State::Connected;
                    self.remote = Some(from);
                    self.punch.stop();
                    actions.push(Action::Notify(Event::Connected { remote: from }));
                } else {
                    log::trace!("extra probe {} {:?} from {}", sender, seq, from);
                }

                actions.push(Action::Send(Transmit::new(
                    from,
                    Message::Chat {
                        sender: self.id.clone(),
                        text: format!("ACK from {}", self.id),
                    },
                )));
            }
            (_, Message::Chat { sender, text }) => {
                actions.push(Action::Notify(Event::Message { from, sender, text }));
            }
            (_, Message::Error { reason, detail }) => {
                log::warn!("server error: {} {}", reason, detail);
                actions.push(Action::Notify(Event::ServerError { reason, detail }));
            }
            (_, msg) => {
                log::debug!("unexpected {} from {}", msg, from);
                actions.push(Action::Notify(Event::Unrecognized {
                    from,
                    data: msg.to_string(),
                }));
            }
        }

        actions
    }

    /// Run whatever timer expired by `now`.
    pub fn handle_timeout(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = vec![];

        if self.state == State::Registering {
            let timed_out = self
                .register_started
                .map_or(false, |t| now.saturating_duration_since(t) >= REGISTER_TIMEOUT);

            if timed_out {
                log::warn!("failed to register with server {}", self.server_addr);
                actions.push(Action::Notify(Event::RegistrationTimedOut));
                self.finish_registration(&mut actions);
            } else if self.next_register.map_or(false, |t| now >= t) {
                log::debug!("registration unconfirmed, retry");
                self.next_register = Some(now + REGISTER_RETRY);
                actions.push(self.register_msg());
            }
        }

        if self.state == State::Punching {
            self.punch_round(now, &mut actions);
        }

        if let Some(k) = self.keepalive.as_mut() {
            if k.poll(now) {
                log::trace!("keepalive {}", self.id);
                let msg = Message::Keepalive {
                    id: self.id.clone(),
                };
                actions.push(self.to_server(msg));
            }
        }

        actions
    }

    fn punch_round(&mut self, now: Instant, actions: &mut Vec<Action>) {
        match self.punch.poll(now) {
            Some(Round::Burst(probes)) => {
                log::trace!("punch round {}", self.punch.rounds());
                for p in probes {
                    actions.push(Action::Send(Transmit::new(
                        p.dst,
                        Message::Punch {
                            sender: self.id.clone(),
                            seq: Some(p.seq),
                        },
                    )));
                }
            }
            Some(Round::Exhausted) => {
                log::warn!(
                    "punching attempts exhausted ({} rounds), still not connected",
                    MAX_ROUNDS
                );
                actions.push(Action::Notify(Event::PunchExhausted));
            }
            None => {}
        }
    }

    /// Earliest instant [`Session::handle_timeout`] has work to do.
    pub fn poll_timeout(&self) -> Option<Instant> {
        let register = match self.state {
            State::Registering => match (self.next_register, self.register_started) {
                (Some(retry), Some(start)) => Some(retry.min(start + REGISTER_TIMEOUT)),
                _ => None,
            },
            _ => None,
        };

        let punch = match self.state {
            State::Punching => self.punch.deadline(),
            _ => None,
        };

        [register, punch, self.keepalive.map(|k| k.deadline())]
            .into_iter()
            .flatten()
            .min()
    }

    /// Wrap a line of local input for the connected peer.
    pub fn send_text(&mut self, text: &str) -> Vec<Action> {
        match (self.state, self.remote) {
            (State::Connected, Some(remote)) => vec![Action::Send(Transmit::new(
                remote,
                Message::Chat {
                    sender: self.id.clone(),
                    text: text.to_string(),
                },
            ))],
            _ => vec![Action::Notify(Event::NotConnected)],
        }
    }

    /// Farewell for the server, so our slot is freed before it expires.
    pub fn unregister(&mut self) -> Option<Transmit> {
        if self.state == State::Unregistered {
            return None;
        }

        self.state = State::Unregistered;
        self.punch.stop();
        self.keepalive = None;
        Some(Transmit::new(
            self.server_addr,
            Message::Unregister {
                id: self.id.clone(),
            },
        ))
    }
}
