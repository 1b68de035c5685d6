//! UDP rendezvous and hole punching.
//!
//! use `Client` to register, get introduced to a peer and punch through to it.
//!
//! use `Server` (or `AsyncServer`) to run the rendezvous point.

#[cfg(feature = "client")]
mod client;
#[cfg(feature = "client")]
mod input;
#[cfg(feature = "client")]
pub mod punch;
#[cfg(feature = "client")]
pub mod session;
#[cfg(feature = "client")]
pub use client::Client;
#[cfg(feature = "client")]
pub use session::{Event, Session, State};

#[cfg(feature = "server")]
pub mod directory;
#[cfg(feature = "server")]
mod server;
#[cfg(feature = "server")]
pub use directory::PeerDirectory;
#[cfg(feature = "server")]
pub use server::{Rendezvous, Server};

#[cfg(feature = "async")]
mod server_async;
#[cfg(feature = "async")]
pub use server_async::Server as AsyncServer;
