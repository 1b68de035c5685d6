use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{Error, ErrorKind, Result, Stdin, Write};
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::os::fd::AsFd;
use std::thread::sleep;
use std::time::{Duration, Instant};

use super::input::LineReader;
use super::punch::PROBE_SPACING;
use super::session::{Action, Event, Session, State};
use crate::proto::{Transmit, MAX_DATAGRAM};

/// Longest wait for readiness once registered.
pub const STEADY_WAIT: Duration = Duration::from_millis(200);

/// Longest wait for readiness while the registration is unconfirmed.
pub const REGISTER_WAIT: Duration = Duration::from_secs(1);

/// Udp hole punching client
///
/// Owns the socket and drives a [`Session`] from a single thread, waiting on
/// the socket and, when interactive, on standard input.
///
/// # example
/// ```no_run
/// use udpunch::udp::Client;
///
/// let mut c = Client::new("rendezvous.example.com:5000", "alice", Some("bob"), None).unwrap();
/// c.register().unwrap();
/// loop {
///     for event in c.poll(std::time::Duration::from_millis(200)).unwrap() {
///         println!("{:?}", event);
///     }
/// }
/// ```
pub struct Client {
    socket: UdpSocket,
    session: Session,
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(t) = self.session.unregister() {
            self.send(&t);
        }
    }
}

impl Client {
    /// set rendezvous server, peer identity, optional target peer and local bind address.
    /// if no local address set, choose according server address type(ipv4 or ipv6).
    pub fn new(
        server_addr: &str,
        id: &str,
        target: Option<&str>,
        local_addr: Option<SocketAddr>,
    ) -> Result<Self> {
        let server_addr = server_addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::new(ErrorKind::Other, "no addr"))?;

        let local_addr = match local_addr {
            Some(addr) => addr,
            None => match server_addr {
                SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
                SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
            },
        };

        let socket = Self::create_socket(local_addr)?;

        Ok(Self {
            socket,
            session: Session::new(id, target, server_addr),
        })
    }

    fn create_socket(local_addr: SocketAddr) -> Result<UdpSocket> {
        let socket = Socket::new(
            Domain::for_address(local_addr),
            Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        socket.set_reuse_address(true)?;
        socket.bind(&local_addr.into())?;
        socket.set_nonblocking(true)?;

        Ok(socket.into())
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Register with the server, returning once confirmed or timed out.
    pub fn register(&mut self) -> Result<Vec<Event>> {
        let mut events = vec![];
        let actions = self.session.start(Instant::now());
        self.apply(actions, &mut events);

        while self.session.state() == State::Registering {
            self.turn(None, REGISTER_WAIT, &mut events)?;
        }

        Ok(events)
    }

    /// Run one iteration of the event loop without local input, waiting at most `wait`.
    pub fn poll(&mut self, wait: Duration) -> Result<Vec<Event>> {
        let mut events = vec![];
        self.turn(None, wait, &mut events)?;
        Ok(events)
    }

    /// Send a line of text to the connected peer.
    pub fn send_text(&mut self, text: &str) -> Vec<Event> {
        let mut events = vec![];
        let actions = self.session.send_text(text);
        self.apply(actions, &mut events);
        events
    }

    /// Interactive loop: register, then chat over standard input until killed.
    pub fn run(mut self) -> Result<()> {
        for e in self.register()? {
            Self::show(&e);
        }

        let mut input = LineReader::new(std::io::stdin())?;
        let mut events = vec![];
        loop {
            let wait = match self.session.state() {
                State::Registering => REGISTER_WAIT,
                _ => STEADY_WAIT,
            };
            self.turn(Some(&mut input), wait, &mut events)?;

            for e in events.drain(..) {
                Self::show(&e);
            }
        }
    }

    fn turn(
        &mut self,
        input: Option<&mut LineReader<Stdin>>,
        wait: Duration,
        events: &mut Vec<Event>,
    ) -> Result<()> {
        let now = Instant::now();
        let wait = self
            .session
            .poll_timeout()
            .map_or(wait, |t| t.saturating_duration_since(now).min(wait));

        let (readable, input_ready) = self.wait_ready(input.as_deref(), wait)?;
        if readable {
            self.recv_all(events);
        }
        if let (true, Some(input)) = (input_ready, input) {
            for line in input.read_lines() {
                let actions = self.session.send_text(&line);
                self.apply(actions, events);
            }
        }

        let actions = self.session.handle_timeout(Instant::now());
        self.apply(actions, events);

        Ok(())
    }

    fn wait_ready(
        &self,
        input: Option<&LineReader<Stdin>>,
        wait: Duration,
    ) -> Result<(bool, bool)> {
        let mut fds = vec![PollFd::new(self.socket.as_fd(), PollFlags::POLLIN)];
        if let Some(input) = input.filter(|i| i.is_open()) {
            fds.push(PollFd::new(input.as_fd(), PollFlags::POLLIN));
        }

        let ms = u16::try_from(wait.as_millis()).unwrap_or(u16::MAX);
        match poll(&mut fds, PollTimeout::from(ms)) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok((false, false)),
            Err(e) => return Err(e.into()),
        }

        let ready = |fd: &PollFd<'_>| {
            fd.revents().map_or(false, |r| {
                r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
            })
        };

        Ok((ready(&fds[0]), fds.get(1).map_or(false, ready)))
    }

    fn recv_all(&mut self, events: &mut Vec<Event>) {
        let mut buf = [0; MAX_DATAGRAM];

        loop {
            let (n, from) = match self.socket.recv_from(&mut buf) {
                Ok(r) => r,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::debug!("recv error {}", e);
                    break;
                }
            };

            let actions = self
                .session
                .handle_datagram(&buf[..n], from, Instant::now());
            self.apply(actions, events);
        }
    }

    fn apply(&mut self, actions: Vec<Action>, events: &mut Vec<Event>) {
        for a in actions {
            match a {
                Action::Send(t) => {
                    self.send(&t);
                    if t.msg.is_punch() {
                        sleep(PROBE_SPACING);
                    }
                }
                Action::Notify(e) => events.push(e),
            }
        }
    }

    fn send(&self, t: &Transmit) {
        if let Err(e) = self.socket.send_to(&t.msg.to_bytes(), t.dst) {
            log::debug!("send to {} failed: {}", t.dst, e);
        }
    }

    fn show(event: &Event) {
        let line = match event {
            Event::Registered(addr) => format!("Server observed us as: {}", addr),
            Event::RegistrationTimedOut => "Failed to register with server".to_string(),
            Event::Peer(p) => format!("Received peer info: {} {}", p.id, p.addr),
            Event::Connected { remote } => format!("Connected to peer at {}", remote),
            Event::Message { from, sender, text } => {
                format!("[Message from {}] {}: {}", from, sender, text)
            }
            Event::ServerError { reason, detail } => format!("Server error: {} {}", reason, detail),
            Event::NotConnected => {
                "Not yet connected to peer, message dropped. Waiting for punching.".to_string()
            }
            Event::Unrecognized { from, data } => format!("[UDP {}] {}", from, data),
            Event::PunchExhausted => return,
        };

        // a terminal shares its O_NONBLOCK flag between stdin and stdout
        if let Err(e) = writeln!(std::io::stdout(), "{}", line) {
            log::debug!("write output error {}", e);
        }
    }
}
