//! The `udpunch client` binary driven through a piped stdin against a
//! scripted rendezvous server.

#![cfg(all(
    feature = "client",
    feature = "server",
    feature = "env_logger",
    feature = "structopt"
))]

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, UdpSocket};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{channel, Receiver};
use std::thread;
use std::time::{Duration, Instant};

struct Interactive {
    child: Child,
    stdin: ChildStdin,
    lines: Receiver<String>,
    server: UdpSocket,
    peer: SocketAddr,
}

impl Drop for Interactive {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Interactive {
    /// Start a client and answer its registration.
    fn start(id: &str) -> Self {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        let port = server.local_addr().unwrap().port().to_string();

        let mut child = Command::new(env!("CARGO_BIN_EXE_udpunch"))
            .args(["client", "127.0.0.1", &port, id])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();

        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();
        let (tx, lines) = channel();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        let mut buf = [0; 512];
        let deadline = Instant::now() + Duration::from_secs(5);
        let peer = loop {
            assert!(Instant::now() < deadline, "client never registered");
            let Ok((n, from)) = server.recv_from(&mut buf) else {
                continue;
            };
            if buf[..n].starts_with(b"REGISTER ") {
                break from;
            }
        };

        let reply = format!("REGISTERED {} {} {}", id, peer.ip(), peer.port());
        server.send_to(reply.as_bytes(), peer).unwrap();

        Self {
            child,
            stdin,
            lines,
            server,
            peer,
        }
    }

    fn write(&mut self, data: &[u8]) {
        self.stdin.write_all(data).unwrap();
        self.stdin.flush().unwrap();
    }

    fn count_datagrams(&self, prefix: &[u8], window: Duration) -> usize {
        let mut buf = [0; 512];
        let mut count = 0;
        let deadline = Instant::now() + window;
        while Instant::now() < deadline {
            if let Ok((n, from)) = self.server.recv_from(&mut buf) {
                if from == self.peer && buf[..n].starts_with(prefix) {
                    count += 1;
                }
            }
        }
        count
    }

    fn count_lines(&self, needle: &str, want: usize, window: Duration) -> usize {
        let mut count = 0;
        let deadline = Instant::now() + window;
        while count < want {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.lines.recv_timeout(left) {
                Ok(line) if line.contains(needle) => count += 1,
                Ok(_) => {}
                Err(_) => break,
            }
        }
        count
    }
}

#[test]
fn partial_input_line_keeps_keepalives_flowing() {
    let mut c = Interactive::start("alice");

    // no newline, pipe stays open
    c.write(b"partial");

    let keepalives = c.count_datagrams(b"KEEPALIVE alice", Duration::from_secs(12));
    assert!(keepalives >= 2, "keepalives seen: {}", keepalives);
}

#[test]
fn every_piped_line_is_handled() {
    let mut c = Interactive::start("alice");
    assert_eq!(
        c.count_lines("Server observed us as", 1, Duration::from_secs(3)),
        1
    );

    c.write(b"one\ntwo\nthree\n");

    let dropped = c.count_lines("Not yet connected", 3, Duration::from_secs(3));
    assert_eq!(dropped, 3);
}
