use super::{bind_socket, poll_recv, Session};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::proto::{self, Command, Message, MAX_DATAGRAM};
use std::fmt;
use std::io::{self, ErrorKind::NotConnected};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::thread::sleep;
use std::time::Instant;

/// Where a client is in the traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Unregistered,
    AwaitingPeer,
    Punching { peer: SocketAddr },
    Confirming { peer: SocketAddr },
    Communicating { peer: SocketAddr },
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Unregistered => write!(f, "unregistered"),
            State::AwaitingPeer => write!(f, "awaiting peer"),
            State::Punching { peer } => write!(f, "punching {}", peer),
            State::Confirming { peer } => write!(f, "confirming {}", peer),
            State::Communicating { peer } => write!(f, "communicating with {}", peer),
        }
    }
}

/// Udp hole punching client
///
/// registers with a rendezvous server, waits to be paired, then punches through
/// to the peer the server names.
///
/// # example
/// ```no_run
/// use holepunch::udp::Client;
///
/// let mut c = Client::new("rendezvous.example.com:8080", None, None).unwrap();
/// let session = c.connect().unwrap();
/// println!("talking to {}", session.peer_addr());
/// ```
pub struct Client {
    svr_sk: Option<UdpSocket>,
    server_addr: SocketAddr,
    id: Option<String>,
    local_addr: SocketAddr,
    state: State,
    config: ClientConfig,
}

impl Client {
    /// set rendezvous server, optional peer identity, local bind address.
    /// if no local address set, choose according server address type(ipv4 or ipv6).
    pub fn new(server_addr: &str, id: Option<&str>, local_addr: Option<SocketAddr>) -> Result<Self> {
        let resolved = server_addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Resolve(server_addr.to_string()))?;

        let local_addr = local_addr.unwrap_or_else(|| match resolved {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        });

        let svr_sk = bind_socket(local_addr)?;
        svr_sk.set_nonblocking(true)?;
        let local_addr = svr_sk.local_addr()?;

        log::info!("bound {}, rendezvous server {}", local_addr, resolved);

        Ok(Self {
            svr_sk: Some(svr_sk),
            server_addr: resolved,
            id: id.map(Into::into),
            local_addr,
            state: State::Unregistered,
            config: ClientConfig::default(),
        })
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// local address of the rendezvous socket
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the whole traversal and hand back a session with the peer.
    pub fn connect(&mut self) -> Result<Session> {
        let peer = match self.register()? {
            Some(peer) => peer,
            None => self.wait_peer()?,
        };

        let socket = self.punch(peer)?;

        if !self.confirm(&socket, peer) {
            log::warn!(
                "nothing from {} within {:?}, continuing anyway",
                peer,
                self.config.confirm_timeout
            );
        }

        self.set_state(State::Communicating { peer });
        Ok(Session::new(socket, peer))
    }

    /// Send a single REGISTER and wait for the server to confirm it.
    ///
    /// Returns the peer address if a PEER_INFO overtook the confirmation.
    pub fn register(&mut self) -> Result<Option<SocketAddr>> {
        let frame = proto::encode(Command::Register, self.id.as_deref().unwrap_or(""));
        if let Err(e) = self.server_sk()?.send_to(frame.as_bytes(), self.server_addr) {
            log::warn!("send {} failed: {}", frame, e);
        }
        log::info!("sent {} to {}", frame, self.server_addr);

        let deadline = Instant::now() + self.config.register_timeout;
        let mut early = None;

        loop {
            let msg = match self.recv_server(deadline)? {
                Some(msg) => msg,
                None if early.is_some() => {
                    log::warn!("no registration reply, going ahead with the peer info we have");
                    break;
                }
                None => {
                    return Err(Error::RegisterTimeout {
                        server: self.server_addr,
                        after: self.config.register_timeout,
                    })
                }
            };

            match msg.command() {
                Command::Register => {
                    log::info!("registration confirmed: {}", msg.payload());
                    break;
                }
                Command::PeerInfo => {
                    let peer = proto::decode_peer_info(msg.payload())?;
                    log::info!("peer info {} arrived before registration reply", peer);
                    early = Some(peer);
                }
                _ => log::warn!("unexpected reply from rendezvous: {}", msg.encode()),
            }
        }

        self.set_state(State::AwaitingPeer);
        Ok(early)
    }

    /// Wait for the server to pair us. Fails once the peer timeout runs out.
    pub fn wait_peer(&mut self) -> Result<SocketAddr> {
        log::info!("waiting for peer info");
        let deadline = Instant::now() + self.config.peer_timeout;

        while let Some(msg) = self.recv_server(deadline)? {
            if msg.command() == Command::PeerInfo {
                let peer = proto::decode_peer_info(msg.payload())?;
                log::info!("received peer info {}", peer);
                return Ok(peer);
            }
            log::debug!("ignoring {} while awaiting peer", msg.encode());
        }

        Err(Error::PeerTimeout(self.config.peer_timeout))
    }

    /// Bind the peer socket and fire hole punches at `peer`.
    ///
    /// The rendezvous socket is released first and its port taken over, so the
    /// peer aims at the NAT mapping the server observed.
    pub fn punch(&mut self, peer: SocketAddr) -> Result<UdpSocket> {
        self.set_state(State::Punching { peer });
        self.svr_sk = None;

        let socket = match bind_socket(self.local_addr) {
            Ok(socket) => socket,
            Err(e) => {
                log::warn!("{}, falling back to an ephemeral port", e);
                bind_socket(SocketAddr::new(self.local_addr.ip(), 0))?
            }
        };
        socket.set_nonblocking(true)?;
        log::info!("hole punching {} from {}", peer, socket.local_addr()?);

        self.send_punches(&socket, peer);
        sleep(self.config.settle_delay);

        Ok(socket)
    }

    fn send_punches(&self, socket: &UdpSocket, peer: SocketAddr) {
        let punch = proto::encode(Command::HolePunch, "");
        let count = self.config.punch_count;

        for i in 1..=count {
            match socket.send_to(punch.as_bytes(), peer) {
                Ok(_) => log::debug!("sent hole punch {}/{}", i, count),
                Err(e) => log::warn!("hole punch {}/{} failed: {}", i, count, e),
            }
            sleep(self.config.punch_interval);
        }
    }

    /// Wait for anything from `peer` on the punched socket. False on timeout.
    pub fn confirm(&mut self, socket: &UdpSocket, peer: SocketAddr) -> bool {
        self.set_state(State::Confirming { peer });
        let deadline = Instant::now() + self.config.confirm_timeout;
        let mut buf = [0u8; MAX_DATAGRAM];

        while Instant::now() < deadline {
            match poll_recv(socket, &mut buf, self.config.poll_interval) {
                Ok(Some((n, addr))) if addr == peer => {
                    let msg = Message::from_datagram(&buf[..n]);
                    log::info!("connection established, peer sent {}", msg.encode());
                    return true;
                }
                Ok(Some((_, addr))) => log::debug!("ignoring datagram from {}", addr),
                Ok(None) => {}
                Err(e) => {
                    log::warn!("recv failed: {}", e);
                    sleep(self.config.poll_interval);
                }
            }
        }

        false
    }

    fn set_state(&mut self, state: State) {
        log::info!("{} -> {}", self.state, state);
        self.state = state;
    }

    fn server_sk(&self) -> Result<&UdpSocket> {
        self.svr_sk
            .as_ref()
            .ok_or_else(|| io::Error::new(NotConnected, "rendezvous socket released").into())
    }

    /// Next frame from the rendezvous server, or `None` once `deadline` passes.
    fn recv_server(&self, deadline: Instant) -> Result<Option<Message>> {
        let svr_sk = self.server_sk()?;
        let mut buf = [0u8; MAX_DATAGRAM];

        while Instant::now() < deadline {
            match poll_recv(svr_sk, &mut buf, self.config.poll_interval) {
                Ok(Some((n, addr))) if addr == self.server_addr => {
                    let msg = Message::from_datagram(&buf[..n]);
                    log::debug!("recv {} from rendezvous", msg.encode());
                    return Ok(Some(msg));
                }
                Ok(Some((_, addr))) => log::debug!("ignoring datagram from {}", addr),
                Ok(None) => {}
                Err(e) => {
                    log::warn!("recv failed: {}", e);
                    sleep(self.config.poll_interval);
                }
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::spawn;
    use std::time::Duration;

    fn fast() -> ClientConfig {
        ClientConfig {
            register_timeout: Duration::from_millis(500),
            peer_timeout: Duration::from_millis(300),
            settle_delay: Duration::from_millis(0),
            confirm_timeout: Duration::from_millis(300),
            ..Default::default()
        }
    }

    /// A stand-in rendezvous server and a client pointed at it.
    fn setup() -> (UdpSocket, Client) {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let c = Client::new(
            &server.local_addr().unwrap().to_string(),
            Some("alice"),
            Some("127.0.0.1:0".parse().unwrap()),
        )
        .unwrap()
        .with_config(fast());
        (server, c)
    }

    /// Answer the client's REGISTER with `replies`.
    fn reply(server: UdpSocket, replies: &'static [&'static str]) -> std::thread::JoinHandle<String> {
        spawn(move || {
            let mut buf = [0; MAX_DATAGRAM];
            let (n, addr) = server.recv_from(&mut buf).unwrap();
            for r in replies {
                server.send_to(r.as_bytes(), addr).unwrap();
            }
            String::from_utf8_lossy(&buf[..n]).into_owned()
        })
    }

    #[test]
    fn register_sends_id_and_waits_for_confirmation() {
        let (server, mut c) = setup();
        let h = reply(server, &["ERROR:nope", "REGISTER:OK"]);

        assert_eq!(c.register().unwrap(), None);
        assert_eq!(h.join().unwrap(), "REGISTER:alice");
        assert_eq!(c.state(), State::AwaitingPeer);
    }

    #[test]
    fn register_keeps_early_peer_info() {
        let (server, mut c) = setup();
        let _h = reply(server, &["PEER_INFO:10.0.0.5:4000", "REGISTER:OK"]);

        assert_eq!(
            c.register().unwrap(),
            Some("10.0.0.5:4000".parse().unwrap())
        );
    }

    #[test]
    fn early_peer_info_survives_lost_reply() {
        let (server, mut c) = setup();
        let _h = reply(server, &["PEER_INFO:10.0.0.5:4000"]);

        assert_eq!(
            c.register().unwrap(),
            Some("10.0.0.5:4000".parse().unwrap())
        );
        assert_eq!(c.state(), State::AwaitingPeer);
    }

    #[test]
    fn register_times_out() {
        let (server, mut c) = setup();
        let _h = reply(server, &[]);

        assert!(matches!(c.register(), Err(Error::RegisterTimeout { .. })));
        assert_eq!(c.state(), State::Unregistered);
    }

    #[test]
    fn peer_wait_times_out() {
        let (server, mut c) = setup();
        let _h = reply(server, &["REGISTER:OK"]);

        let start = Instant::now();
        let err = c.connect().err().unwrap();
        assert!(matches!(err, Error::PeerTimeout(_)));
        assert!(err.is_fatal());
        assert!(start.elapsed() >= Duration::from_millis(250));
        assert_eq!(c.state(), State::AwaitingPeer);
    }

    #[test]
    fn malformed_peer_info_is_fatal() {
        let (server, mut c) = setup();
        let _h = reply(server, &["REGISTER:OK", "PEER_INFO:10.0.0.1"]);

        assert!(matches!(c.connect(), Err(Error::PeerInfo(_))));
    }

    #[test]
    fn punch_sends_ten_spaced_datagrams() {
        let (_server, mut c) = setup();
        let target = UdpSocket::bind("127.0.0.1:0").unwrap();
        target
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let target_addr = target.local_addr().unwrap();
        let rendezvous_port = c.local_addr().port();

        let h = spawn(move || c.punch(target_addr).map(|_| c.state()));

        let mut buf = [0; MAX_DATAGRAM];
        let mut arrivals = Vec::new();
        for _ in 0..10 {
            let (n, from) = target.recv_from(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"HOLE_PUNCH");
            assert_eq!(from.port(), rendezvous_port);
            arrivals.push(Instant::now());
        }

        assert_eq!(
            h.join().unwrap().unwrap(),
            State::Punching { peer: target_addr }
        );

        target
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        assert!(target.recv_from(&mut buf).is_err());

        let span = arrivals[9] - arrivals[0];
        assert!(span >= Duration::from_millis(350), "{:?}", span);
        assert!(span <= Duration::from_millis(1500), "{:?}", span);
    }

    #[test]
    fn confirm_only_accepts_the_peer() {
        let (_server, mut c) = setup();
        let socket = bind_socket("127.0.0.1:0".parse().unwrap()).unwrap();
        socket.set_nonblocking(true).unwrap();
        let addr = socket.local_addr().unwrap();

        let stranger = UdpSocket::bind("127.0.0.1:0").unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let peer_addr = peer.local_addr().unwrap();

        stranger.send_to(b"HOLE_PUNCH", addr).unwrap();
        assert!(!c.confirm(&socket, peer_addr));

        stranger.send_to(b"HOLE_PUNCH", addr).unwrap();
        peer.send_to(b"HOLE_PUNCH", addr).unwrap();
        assert!(c.confirm(&socket, peer_addr));
        assert_eq!(c.state(), State::Confirming { peer: peer_addr });
    }
}
