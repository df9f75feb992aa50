use crate::error::{Error, Result};
use crate::proto::{self, Command, Message, MAX_DATAGRAM, REGISTER_OK};
use log;
use std::collections::BTreeMap;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::thread::sleep;
use std::time::Duration;

/// A peer waiting to be paired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub id: String,
    pub addr: SocketAddr,
}

/// Two registrations picked for each other, `first.id < second.id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pairing {
    pub first: Registration,
    pub second: Registration,
}

impl Pairing {
    /// PEER_INFO frames to send, each addressed to one side and naming the other.
    pub fn notices(&self) -> [(SocketAddr, String); 2] {
        [
            (self.first.addr, Self::peer_info(&self.second)),
            (self.second.addr, Self::peer_info(&self.first)),
        ]
    }

    fn peer_info(other: &Registration) -> String {
        proto::encode(Command::PeerInfo, &proto::encode_peer_info(other.addr))
    }
}

/// Pending registrations ordered by id.
#[derive(Debug, Default)]
pub struct Registry {
    peers: BTreeMap<String, Registration>,
}

impl Registry {
    /// Insert or overwrite. Returns true when an entry with this id was replaced.
    pub fn register(&mut self, id: String, addr: SocketAddr) -> bool {
        self.peers
            .insert(id.clone(), Registration { id, addr })
            .is_some()
    }

    pub fn get(&self, id: &str) -> Option<&Registration> {
        self.peers.get(id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear()
    }

    /// The two smallest ids, if at least two peers are waiting. Does not consume
    /// anything.
    pub fn try_match(&self) -> Option<Pairing> {
        let mut it = self.peers.values();
        match (it.next(), it.next()) {
            (Some(first), Some(second)) => Some(Pairing {
                first: first.clone(),
                second: second.clone(),
            }),
            _ => None,
        }
    }
}

/// Udp rendezvous server
///
/// keeps peers that registered, and introduces the first two of them to each other.
pub struct Server {
    socket: UdpSocket,
    registry: Registry,
}

impl Server {
    pub fn new<A: ToSocketAddrs>(listen_addr: A) -> Result<Self> {
        let listen_addr = listen_addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::Resolve("listen address".into()))?;

        let socket = UdpSocket::bind(listen_addr).map_err(|source| Error::Bind {
            addr: listen_addr,
            source,
        })?;

        log::info!("rendezvous server listening on {}", listen_addr);

        Ok(Self {
            socket,
            registry: Default::default(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn run(mut self) -> Result<()> {
        let mut buf = [0; MAX_DATAGRAM];

        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((size, addr)) => self.handle_datagram(&buf[..size], addr),
                Err(e) => {
                    log::error!("recv failed: {}", e);
                    sleep(Duration::from_millis(100));
                }
            }
        }
    }

    /// Dispatch one datagram, reply to its sender, and pair peers if a
    /// registration made that possible.
    pub fn handle_datagram(&mut self, buf: &[u8], addr: SocketAddr) {
        let msg = Message::from_datagram(buf);
        log::debug!("recv {} from {}", msg.encode(), addr);

        let resp = match msg.command() {
            Command::Register => self.on_register(addr, msg.payload()),
            Command::Ping => self.on_ping(),
            _ => self.on_unknown(addr),
        };
        self.send(&resp, addr);

        if msg.command() == Command::Register && self.registry.len() >= 2 {
            self.try_match();
        }
    }

    fn on_register(&mut self, addr: SocketAddr, payload: &str) -> String {
        let id = if payload.is_empty() {
            proto::encode_peer_info(addr)
        } else {
            payload.to_string()
        };

        if self.registry.register(id.clone(), addr) {
            log::info!("re-registered {} at {}", id, addr);
        } else {
            log::info!("registered {} at {}", id, addr);
        }

        proto::encode(Command::Register, REGISTER_OK)
    }

    fn on_ping(&self) -> String {
        proto::encode(Command::Pong, "")
    }

    fn on_unknown(&self, addr: SocketAddr) -> String {
        log::warn!("unknown command from {}", addr);
        proto::encode(Command::Error, "Unknown command")
    }

    /// Pair the two smallest ids and forget everyone who was waiting.
    fn try_match(&mut self) -> Option<Pairing> {
        let pairing = self.registry.try_match()?;
        log::info!("matching {} <-> {}", pairing.first.id, pairing.second.id);

        let dropped = self.registry.len() - 2;
        if dropped > 0 {
            log::warn!("dropping {} unmatched registrations", dropped);
        }
        self.registry.clear();

        for (addr, info) in pairing.notices() {
            self.send(&info, addr);
        }

        Some(pairing)
    }

    fn send(&self, frame: &str, addr: SocketAddr) {
        match self.socket.send_to(frame.as_bytes(), addr) {
            Ok(_) => log::debug!("sent {} to {}", frame, addr),
            Err(e) => log::error!("send {} to {} failed: {}", frame, addr, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn peer() -> UdpSocket {
        let s = UdpSocket::bind("127.0.0.1:0").unwrap();
        s.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        s
    }

    fn recv(s: &UdpSocket) -> Message {
        let mut buf = [0; MAX_DATAGRAM];
        let (n, _) = s.recv_from(&mut buf).unwrap();
        Message::from_datagram(&buf[..n])
    }

    #[test]
    fn registry_pairs_smallest_ids() {
        let mut r = Registry::default();
        r.register("b".into(), addr("10.0.0.2:2000"));
        r.register("a".into(), addr("10.0.0.1:1000"));
        r.register("c".into(), addr("10.0.0.3:3000"));

        let p = r.try_match().unwrap();
        assert_eq!(p.first.id, "a");
        assert_eq!(p.second.id, "b");
        assert_eq!(r.len(), 3);

        let notices = p.notices();
        assert_eq!(
            notices[0],
            (addr("10.0.0.1:1000"), "PEER_INFO:10.0.0.2:2000".to_string())
        );
        assert_eq!(
            notices[1],
            (addr("10.0.0.2:2000"), "PEER_INFO:10.0.0.1:1000".to_string())
        );
    }

    #[test]
    fn registry_needs_two() {
        let mut r = Registry::default();
        assert!(r.try_match().is_none());
        r.register("a".into(), addr("10.0.0.1:1000"));
        assert!(r.try_match().is_none());
    }

    #[test]
    fn reregister_overwrites() {
        let mut r = Registry::default();
        assert!(!r.register("a".into(), addr("10.0.0.1:1000")));
        assert!(r.register("a".into(), addr("10.0.0.9:9000")));
        assert_eq!(r.len(), 1);
        assert_eq!(r.get("a").unwrap().addr, addr("10.0.0.9:9000"));
        assert!(r.try_match().is_none());
    }

    #[test]
    fn two_registrations_are_paired() {
        let mut s = Server::new("127.0.0.1:0").unwrap();
        let (p1, p2) = (peer(), peer());
        let (a1, a2) = (p1.local_addr().unwrap(), p2.local_addr().unwrap());

        s.handle_datagram(b"REGISTER", a1);
        assert_eq!(recv(&p1).encode(), "REGISTER:OK");
        assert_eq!(s.registry().len(), 1);
        assert!(s.registry().get(&a1.to_string()).is_some());

        s.handle_datagram(b"REGISTER", a2);
        assert_eq!(recv(&p2).encode(), "REGISTER:OK");
        assert!(s.registry().is_empty());

        let m1 = recv(&p1);
        assert_eq!(m1.command(), Command::PeerInfo);
        assert_eq!(proto::decode_peer_info(m1.payload()).unwrap(), a2);

        let m2 = recv(&p2);
        assert_eq!(m2.command(), Command::PeerInfo);
        assert_eq!(proto::decode_peer_info(m2.payload()).unwrap(), a1);
    }

    #[test]
    fn lexicographic_pairing_ignores_arrival_order() {
        let mut s = Server::new("127.0.0.1:0").unwrap();
        let (pb, pa, pc) = (peer(), peer(), peer());

        s.handle_datagram(b"REGISTER:b", pb.local_addr().unwrap());
        s.handle_datagram(b"REGISTER:a", pa.local_addr().unwrap());
        assert!(s.registry().is_empty());
        s.handle_datagram(b"REGISTER:c", pc.local_addr().unwrap());

        assert_eq!(recv(&pb).encode(), "REGISTER:OK");
        assert_eq!(recv(&pa).encode(), "REGISTER:OK");

        let to_a = recv(&pa);
        let to_b = recv(&pb);
        assert_eq!(
            proto::decode_peer_info(to_a.payload()).unwrap(),
            pb.local_addr().unwrap()
        );
        assert_eq!(
            proto::decode_peer_info(to_b.payload()).unwrap(),
            pa.local_addr().unwrap()
        );

        assert_eq!(recv(&pc).encode(), "REGISTER:OK");
        assert_eq!(s.registry().len(), 1);
        assert!(s.registry().get("c").is_some());
    }

    #[test]
    fn extra_waiters_are_discarded() {
        let mut s = Server::new("127.0.0.1:0").unwrap();
        s.registry.register("c".into(), addr("127.0.0.1:9"));
        s.registry.register("b".into(), addr("127.0.0.1:9"));
        s.registry.register("a".into(), addr("127.0.0.1:9"));

        let p = s.try_match().unwrap();
        assert_eq!((p.first.id.as_str(), p.second.id.as_str()), ("a", "b"));
        assert!(s.registry().is_empty());
    }

    #[test]
    fn ping_and_unknown() {
        let mut s = Server::new("127.0.0.1:0").unwrap();
        let p = peer();
        let a = p.local_addr().unwrap();

        s.handle_datagram(b"PING", a);
        assert_eq!(recv(&p).command(), Command::Pong);

        s.handle_datagram(b"FOOBAR", a);
        let m = recv(&p);
        assert_eq!(m.command(), Command::Error);
        assert_eq!(m.payload(), "Unknown command");

        s.handle_datagram(b"MESSAGE:hi", a);
        assert_eq!(recv(&p).command(), Command::Error);
        assert!(s.registry().is_empty());
    }
}
