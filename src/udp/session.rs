use crate::error::Result;
use crate::proto::{self, Command, Message, MAX_DATAGRAM};
use std::io;
use std::net::{self, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt},
    net::UdpSocket,
    select,
    sync::{mpsc::Sender, watch},
    time::sleep,
};

/// Something the peer sent that the user should see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// Payload of a MESSAGE frame.
    Message(String),
    /// Any other frame, as received.
    Raw(String),
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    LocalQuit,
    PeerQuit,
    InputClosed,
}

/// What a line of user input turns into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Skip,
    Quit,
    Frame(String),
}

pub fn classify_line(line: &str) -> Input {
    match line {
        "" => Input::Skip,
        "QUIT" => Input::Quit,
        "PING" => Input::Frame(proto::encode(Command::Ping, "")),
        // anything with a colon is already a frame: `FOO:bar` goes out as-is, not as a MESSAGE
        l if l.contains(':') => Input::Frame(l.to_string()),
        l => Input::Frame(proto::encode(Command::Message, l)),
    }
}

/// Direct channel with a peer once traversal is done.
pub struct Session {
    socket: net::UdpSocket,
    peer: SocketAddr,
}

impl Session {
    pub fn new(socket: net::UdpSocket, peer: SocketAddr) -> Self {
        Self { socket, peer }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Exchange frames with the peer until either side quits.
    ///
    /// Lines from `input` are sent to the peer, frames from the peer are delivered
    /// on `output`. Incoming PINGs are answered here. The receive task is always
    /// joined before this returns.
    pub async fn run<R>(self, input: R, output: Sender<Incoming>) -> Result<Termination>
    where
        R: AsyncBufRead + Unpin,
    {
        let peer = self.peer;
        self.socket.set_nonblocking(true)?;
        let socket = Arc::new(UdpSocket::from_std(self.socket)?);

        let (cancel, _) = watch::channel(false);
        let cancel = Arc::new(cancel);
        let recv_stop = cancel.subscribe();
        let send_stop = cancel.subscribe();

        log::info!("p2p session with {} started", peer);

        let receiver = tokio::spawn(Self::recv_loop(
            socket.clone(),
            peer,
            output,
            cancel.clone(),
            recv_stop,
        ));

        let sent = Self::send_loop(&socket, peer, input, send_stop).await;

        cancel.send_replace(true);
        let received = receiver.await.map_err(io::Error::from)?;

        let end = sent.or(received).unwrap_or(Termination::PeerQuit);
        log::info!("p2p session with {} ended: {:?}", peer, end);
        Ok(end)
    }

    async fn recv_loop(
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
        output: Sender<Incoming>,
        cancel: Arc<watch::Sender<bool>>,
        mut stop: watch::Receiver<bool>,
    ) -> Option<Termination> {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            let (n, addr) = select! {
                biased;
                _ = cancelled(&mut stop) => return None,
                r = socket.recv_from(&mut buf) => match r {
                    Ok(r) => r,
                    Err(e) => {
                        log::warn!("recv failed: {}", e);
                        sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };

            if addr != peer {
                log::trace!("ignoring datagram from {}", addr);
                continue;
            }

            let msg = Message::from_datagram(&buf[..n]);
            match msg.command() {
                Command::Message => {
                    let incoming = Incoming::Message(msg.payload().into());
                    if !deliver(&output, incoming, &mut stop).await {
                        return None;
                    }
                }
                Command::Ping => {
                    send_frame(&socket, peer, &proto::encode(Command::Pong, "")).await;
                }
                Command::Pong => log::debug!("pong from {}", peer),
                Command::Quit => {
                    log::info!("peer disconnected");
                    cancel.send_replace(true);
                    return Some(Termination::PeerQuit);
                }
                _ => {
                    if !deliver(&output, Incoming::Raw(msg.encode()), &mut stop).await {
                        return None;
                    }
                }
            }
        }
    }

    async fn send_loop<R>(
        socket: &UdpSocket,
        peer: SocketAddr,
        input: R,
        mut stop: watch::Receiver<bool>,
    ) -> Option<Termination>
    where
        R: AsyncBufRead + Unpin,
    {
        let quit = proto::encode(Command::Quit, "");
        let mut lines = input.lines();

        loop {
            let line = select! {
                biased;
                _ = cancelled(&mut stop) => return None,
                line = lines.next_line() => line,
            };

            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => {
                    log::info!("input closed");
                    send_frame(socket, peer, &quit).await;
                    return Some(Termination::InputClosed);
                }
                Err(e) => {
                    log::error!("read input failed: {}", e);
                    send_frame(socket, peer, &quit).await;
                    return Some(Termination::InputClosed);
                }
            };

            match classify_line(&line) {
                Input::Skip => {}
                Input::Quit => {
                    send_frame(socket, peer, &quit).await;
                    return Some(Termination::LocalQuit);
                }
                Input::Frame(frame) => send_frame(socket, peer, &frame).await,
            }
        }
    }
}

/// Resolves once the session has been told to stop.
async fn cancelled(stop: &mut watch::Receiver<bool>) {
    // a closed channel also means stop
    let _ = stop.wait_for(|stop| *stop).await;
}

/// Hand `incoming` to the reader unless the session stops first. False when stopped.
async fn deliver(
    output: &Sender<Incoming>,
    incoming: Incoming,
    stop: &mut watch::Receiver<bool>,
) -> bool {
    select! {
        biased;
        _ = cancelled(stop) => false,
        r = output.send(incoming) => {
            if r.is_err() {
                log::debug!("output closed, dropping frame");
            }
            true
        }
    }
}

async fn send_frame(socket: &UdpSocket, peer: SocketAddr, frame: &str) {
    match socket.send_to(frame.as_bytes(), peer).await {
        Ok(_) => log::debug!("sent {} to {}", frame, peer),
        Err(e) => log::error!("send {} to {} failed: {}", frame, peer, e),
    }
}
