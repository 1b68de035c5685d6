use std::io::Result;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use structopt::StructOpt;

use udpunch::udp::{Client, PeerDirectory, Server};

#[derive(StructOpt, Debug)]
#[structopt(name = "udpunch")]
enum Opt {
    /// Connect to a rendezvous server and chat with a peer over stdin
    Client(ClientOpt),
    /// Run the rendezvous server
    Server(ServerOpt),
}

#[derive(StructOpt, Debug)]
struct ClientOpt {
    server_ip: IpAddr,

    server_port: u16,

    id: String,

    /// peer to connect to, otherwise wait for one
    target: Option<String>,

    #[structopt(long = "local-addr")]
    local_addr: Option<SocketAddr>,
}

#[derive(StructOpt, Debug)]
struct ServerOpt {
    #[structopt(default_value = "5000")]
    port: u16,

    /// evict peers silent for longer than this
    #[structopt(long = "ttl-secs", default_value = "120")]
    ttl_secs: u64,

    /// maximum number of registered peers
    #[structopt(long = "capacity", default_value = "128")]
    capacity: usize,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opt: Opt = StructOpt::from_args();

    match opt {
        Opt::Server(opt) => run_server(opt),
        Opt::Client(opt) => run_client(opt),
    }
}

fn run_server(opt: ServerOpt) -> Result<()> {
    let peers = PeerDirectory::new(opt.capacity, Duration::from_secs(opt.ttl_secs));
    let s = Server::with_directory(("0.0.0.0", opt.port), peers)?;
    s.run()
}

fn run_client(opt: ClientOpt) -> Result<()> {
    let server_addr = SocketAddr::new(opt.server_ip, opt.server_port);
    let c = Client::new(
        &server_addr.to_string(),
        &opt.id,
        opt.target.as_deref(),
        opt.local_addr,
    )?;

    c.run()
}
