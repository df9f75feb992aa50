use holepunch::config::{ClientConfig, DEFAULT_PORT};
use holepunch::udp::{Client, Incoming, Server};
use holepunch::Result;
use std::net::SocketAddr;
use std::process;
use std::time::Duration;
use structopt::StructOpt;
use tokio::io::BufReader;
use tokio::runtime::Runtime;
use tokio::sync::mpsc::channel;

#[derive(StructOpt, Debug)]
#[structopt(name = "holepunch")]
enum Opt {
    /// Run the rendezvous server
    Server(ServerOpt),
    /// Get paired through a rendezvous server and chat with the peer
    Client(ClientOpt),
}

#[derive(StructOpt, Debug)]
struct ClientOpt {
    #[structopt(long = "server-addr")]
    server_addr: String,

    /// Registration id, defaults to the address the server sees
    #[structopt(long = "id")]
    id: Option<String>,

    #[structopt(long = "local-addr")]
    local_addr: Option<SocketAddr>,

    /// Seconds to wait for the server to pair us
    #[structopt(long = "peer-timeout", default_value = "30")]
    peer_timeout: u64,

    /// Seconds to wait for the first packet from the peer
    #[structopt(long = "confirm-timeout", default_value = "5")]
    confirm_timeout: u64,
}

#[derive(StructOpt, Debug)]
struct ServerOpt {
    #[structopt(long = "listen-addr")]
    listen_addr: Option<SocketAddr>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let opt: Opt = StructOpt::from_args();

    let r = match opt {
        Opt::Server(opt) => run_server(opt),
        Opt::Client(opt) => run_client(opt),
    };

    if let Err(e) = r {
        if e.is_fatal() {
            log::error!("{}", e);
        } else {
            log::error!("{}, this may pass if you try again", e);
        }
        process::exit(1);
    }
}

fn run_server(opt: ServerOpt) -> Result<()> {
    let listen_addr = opt
        .listen_addr
        .unwrap_or_else(|| ([0, 0, 0, 0], DEFAULT_PORT).into());

    Server::new(listen_addr)?.run()
}

fn run_client(opt: ClientOpt) -> Result<()> {
    let config = ClientConfig {
        peer_timeout: Duration::from_secs(opt.peer_timeout),
        confirm_timeout: Duration::from_secs(opt.confirm_timeout),
        ..Default::default()
    };

    let mut c =
        Client::new(&opt.server_addr, opt.id.as_deref(), opt.local_addr)?.with_config(config);
    let session = c.connect()?;

    println!("connected to {}, type to chat, QUIT to leave", session.peer_addr());

    let rt = Runtime::new()?;
    let end = rt.block_on(async move {
        let (tx, mut rx) = channel(16);

        let printer = tokio::spawn(async move {
            while let Some(incoming) = rx.recv().await {
                match incoming {
                    Incoming::Message(m) => println!("peer says: {}", m),
                    Incoming::Raw(r) => println!("peer sent: {}", r),
                }
            }
        });

        let end = session.run(BufReader::new(tokio::io::stdin()), tx).await;
        let _ = printer.await;
        end
    });
    let end = release(rt, end)?;

    log::info!("session ended: {:?}", end);
    Ok(())
}

/// Drop the runtime without waiting on blocking tasks, then pass `r` through.
fn release<T>(rt: Runtime, r: Result<T>) -> Result<T> {
    // stdin is read on a blocking thread that may still be parked in read()
    rt.shutdown_background();
    r
}
