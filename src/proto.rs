//! Text wire protocol shared by the rendezvous server and its clients.
//!
//! Every message is a single udp datagram made of whitespace separated
//! tokens, the first one being the command keyword.
//!
//! ```text
//! REGISTER <id>                  client -> server
//! REGISTERED <id> <ip> <port>    server -> client
//! REQUEST [<requester>] <target> client -> server
//! PEER <id> <ip> <port>          server -> client
//! ERROR <reason> <detail>        server -> client
//! KEEPALIVE <id>                 client -> server
//! UNREGISTER <id>                client -> server
//! PUNCH <sender> seq=<n>         peer -> peer
//! Message <sender>: <text>       peer -> peer
//! ```

use std::fmt;
use std::io::{Error, ErrorKind, Result};
use std::net::{IpAddr, SocketAddr};

/// Longest identifier kept, longer ones are truncated.
pub const MAX_ID_LEN: usize = 63;

/// Receive buffer size, longer datagrams are truncated.
pub const MAX_DATAGRAM: usize = 512;

/// Reason sent with `ERROR` when a requested peer is not registered.
pub const TARGET_NOT_FOUND: &str = "target_not_found";

/// Requester id used when a `REQUEST` carries no id and its source address is unknown.
pub const UNKNOWN_ID: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Register {
        id: String,
    },
    Registered {
        id: String,
        addr: SocketAddr,
    },
    Request {
        requester: Option<String>,
        target: String,
    },
    Peer {
        id: String,
        addr: SocketAddr,
    },
    Error {
        reason: String,
        detail: String,
    },
    Keepalive {
        id: String,
    },
    Unregister {
        id: String,
    },
    /// Hole punching probe. Anything starting with the `PUNCH` keyword is a
    /// probe, sender and sequence number are informational.
    Punch {
        sender: String,
        seq: Option<u64>,
    },
    /// Application payload exchanged directly between peers.
    Chat {
        sender: String,
        text: String,
    },
}

/// A message and the address it should be sent to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub dst: SocketAddr,
    pub msg: Message,
}

impl Transmit {
    pub fn new(dst: SocketAddr, msg: Message) -> Self {
        Self { dst, msg }
    }
}

fn malformed(what: &str) -> Error {
    Error::new(ErrorKind::InvalidData, what.to_string())
}

fn ident(token: Option<&str>) -> Result<String> {
    let token = token.ok_or_else(|| malformed("missing id"))?;
    if token.len() <= MAX_ID_LEN {
        return Ok(token.to_string());
    }

    let mut end = MAX_ID_LEN;
    while !token.is_char_boundary(end) {
        end -= 1;
    }
    Ok(token[..end].to_string())
}

fn endpoint(ip: Option<&str>, port: Option<&str>) -> Result<SocketAddr> {
    let ip: IpAddr = ip
        .ok_or_else(|| malformed("missing ip"))?
        .parse()
        .map_err(|_| malformed("invalid ip"))?;
    let port: u16 = port
        .ok_or_else(|| malformed("missing port"))?
        .parse()
        .map_err(|_| malformed("invalid port"))?;

    Ok(SocketAddr::new(ip, port))
}

impl Message {
    /// Decode a datagram.
    ///
    /// Unknown keywords fail with [`ErrorKind::Unsupported`], a known keyword
    /// with missing or invalid fields fails with [`ErrorKind::InvalidData`].
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(buf);
        let text = text.trim_end_matches(['\0', '\r', '\n']);

        if let Some(rest) = text.strip_prefix("Message ") {
            // ids may contain ':', the sender ends at the first ": "
            let (sender, body) = rest
                .split_once(": ")
                .or_else(|| rest.split_once(':'))
                .ok_or_else(|| malformed("message without sender"))?;
            let mut sender = sender.split_whitespace();
            return Ok(Message::Chat {
                sender: ident(sender.next())?,
                text: body.to_string(),
            });
        }

        let mut tokens = text.split_whitespace();
        let keyword = tokens.next().unwrap_or_default();

        let msg = match keyword {
            "REGISTER" => Message::Register {
                id: ident(tokens.next())?,
            },
            "REGISTERED" => Message::Registered {
                id: ident(tokens.next())?,
                addr: endpoint(tokens.next(), tokens.next())?,
            },
            "REQUEST" => {
                let first = ident(tokens.next())?;
                match tokens.next() {
                    Some(target) => Message::Request {
                        requester: Some(first),
                        target: ident(Some(target))?,
                    },
                    None => Message::Request {
                        requester: None,
                        target: first,
                    },
                }
            }
            "PEER" => Message::Peer {
                id: ident(tokens.next())?,
                addr: endpoint(tokens.next(), tokens.next())?,
            },
            "ERROR" => Message::Error {
                reason: tokens
                    .next()
                    .ok_or_else(|| malformed("missing reason"))?
                    .to_string(),
                detail: tokens.collect::<Vec<_>>().join(" "),
            },
            "KEEPALIVE" => Message::Keepalive {
                id: ident(tokens.next())?,
            },
            "UNREGISTER" => Message::Unregister {
                id: ident(tokens.next())?,
            },
            "PUNCH" => {
                let sender = tokens.next().map(|t| ident(Some(t))).transpose()?;
                let seq = tokens
                    .next()
                    .and_then(|t| t.strip_prefix("seq="))
                    .and_then(|n| n.parse().ok());
                Message::Punch {
                    sender: sender.unwrap_or_default(),
                    seq,
                }
            }
            _ => {
                return Err(Error::new(
                    ErrorKind::Unsupported,
                    format!("unknown command {:?}", keyword),
                ))
            }
        };

        Ok(msg)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    pub fn is_punch(&self) -> bool {
        matches!(self, Message::Punch { .. })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Register { id } => write!(f, "REGISTER {}", id),
            Message::Registered { id, addr } => {
                write!(f, "REGISTERED {} {} {}", id, addr.ip(), addr.port())
            }
            Message::Request {
                requester: Some(requester),
                target,
            } => write!(f, "REQUEST {} {}", requester, target),
            Message::Request {
                requester: None,
                target,
            } => write!(f, "REQUEST {}", target),
            Message::Peer { id, addr } => write!(f, "PEER {} {} {}", id, addr.ip(), addr.port()),
            Message::Error { reason, detail } => write!(f, "ERROR {} {}", reason, detail),
            Message::Keepalive { id } => write!(f, "KEEPALIVE {}", id),
            Message::Unregister { id } => write!(f, "UNREGISTER {}", id),
            Message::Punch { sender, seq } => {
                write!(f, "PUNCH {}", sender)?;
                if let Some(seq) = seq {
                    write!(f, " seq={}", seq)?;
                }
                Ok(())
            }
            Message::Chat { sender, text } => write!(f, "Message {}: {}", sender, text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(s: &str) -> Message {
        Message::parse(s.as_bytes()).unwrap()
    }

    #[test]
    fn test_register() {
        assert_eq!(
            parse("REGISTER alice"),
            Message::Register {
                id: "alice".into()
            }
        );
        assert_eq!(
            parse("REGISTER alice trailing\n"),
            Message::Register {
                id: "alice".into()
            }
        );
    }

    #[test]
    fn test_long_id_truncated() {
        let long = "x".repeat(100);
        match parse(&format!("KEEPALIVE {}", long)) {
            Message::Keepalive { id } => assert_eq!(id.len(), MAX_ID_LEN),
            m => panic!("unexpected {:?}", m),
        }

        // never split a multi-byte char
        let long = "é".repeat(40);
        match parse(&format!("REGISTER {}", long)) {
            Message::Register { id } => {
                assert_eq!(id.len(), 62);
                assert!(id.chars().all(|c| c == 'é'));
            }
            m => panic!("unexpected {:?}", m),
        }
    }

    #[test]
    fn test_request_forms() {
        assert_eq!(
            parse("REQUEST alice bob"),
            Message::Request {
                requester: Some("alice".into()),
                target: "bob".into()
            }
        );
        assert_eq!(
            parse("REQUEST bob"),
            Message::Request {
                requester: None,
                target: "bob".into()
            }
        );
        assert_eq!(parse("REQUEST bob").to_string(), "REQUEST bob");
    }

    #[test]
    fn test_descriptors() {
        let addr: SocketAddr = "203.0.113.7:40001".parse().unwrap();
        assert_eq!(
            parse("PEER bob 203.0.113.7 40001"),
            Message::Peer {
                id: "bob".into(),
                addr
            }
        );
        assert_eq!(
            Message::Registered {
                id: "alice".into(),
                addr
            }
            .to_string(),
            "REGISTERED alice 203.0.113.7 40001"
        );

        let err = Message::parse(b"PEER bob 203.0.113.7 notaport").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        let err = Message::parse(b"PEER bob").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_error() {
        assert_eq!(
            parse("ERROR target_not_found carol"),
            Message::Error {
                reason: TARGET_NOT_FOUND.into(),
                detail: "carol".into()
            }
        );
    }

    #[test]
    fn test_punch() {
        assert_eq!(
            parse("PUNCH bob seq=17"),
            Message::Punch {
                sender: "bob".into(),
                seq: Some(17)
            }
        );
        assert!(parse("PUNCH").is_punch());
        assert!(parse("PUNCH bob garbage").is_punch());
        assert_eq!(
            Message::Punch {
                sender: "bob".into(),
                seq: Some(3)
            }
            .to_string(),
            "PUNCH bob seq=3"
        );
    }

    #[test]
    fn test_chat() {
        assert_eq!(
            parse("Message alice: hello: world"),
            Message::Chat {
                sender: "alice".into(),
                text: "hello: world".into()
            }
        );

        assert_eq!(
            parse("Message a:b: hi"),
            Message::Chat {
                sender: "a:b".into(),
                text: "hi".into()
            }
        );
        assert_eq!(
            parse("Message bob:hi"),
            Message::Chat {
                sender: "bob".into(),
                text: "hi".into()
            }
        );

        // a chat line mentioning a probe is still a chat line
        assert!(!parse("Message alice: PUNCH it").is_punch());

        let err = Message::parse(b"Message no separator").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_unknown_and_malformed() {
        let err = Message::parse(b"HELLO there").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        let err = Message::parse(b"").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        let err = Message::parse(b"REGISTER ").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }
}
