//! Text wire format.
//!
//! Every datagram carries one frame, either `COMMAND` or `COMMAND:PAYLOAD`.
//! Only the first colon separates the command from the payload, so payloads
//! may contain further colons and are never escaped.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

/// Receive buffer size. A frame must fit in a single datagram of this size.
pub const MAX_DATAGRAM: usize = 4096;

/// Payload the coordinator sends back for a successful registration.
pub const REGISTER_OK: &str = "OK";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Register,
    PeerInfo,
    HolePunch,
    Message,
    Echo,
    Ping,
    Pong,
    Quit,
    Error,
    /// Anything that did not parse. Never produced by an encoder.
    Unknown,
}

impl Command {
    /// Commands that have a wire name.
    pub const KNOWN: [Command; 9] = [
        Command::Register,
        Command::PeerInfo,
        Command::HolePunch,
        Command::Message,
        Command::Echo,
        Command::Ping,
        Command::Pong,
        Command::Quit,
        Command::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Register => "REGISTER",
            Command::PeerInfo => "PEER_INFO",
            Command::HolePunch => "HOLE_PUNCH",
            Command::Message => "MESSAGE",
            Command::Echo => "ECHO",
            Command::Ping => "PING",
            Command::Pong => "PONG",
            Command::Quit => "QUIT",
            Command::Error => "ERROR",
            Command::Unknown => "UNKNOWN",
        }
    }

    /// Look up a command by its exact wire name. Matching is case sensitive.
    pub fn from_name(name: &str) -> Command {
        Self::KNOWN
            .iter()
            .copied()
            .find(|cmd| cmd.as_str() == name)
            .unwrap_or(Command::Unknown)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    command: Command,
    payload: String,
}

impl Message {
    pub fn new<P: Into<String>>(command: Command, payload: P) -> Self {
        Self {
            command,
            payload: payload.into(),
        }
    }

    pub fn command(&self) -> Command {
        self.command
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Decode a received datagram. Invalid UTF-8 is replaced rather than rejected,
    /// the resulting text then decodes like any other.
    pub fn from_datagram(buf: &[u8]) -> Self {
        decode(&String::from_utf8_lossy(buf))
    }

    /// Wire text for this frame. An unknown frame re-encodes to the raw text it
    /// was decoded from.
    pub fn encode(&self) -> String {
        match self.command {
            Command::Unknown => self.payload.clone(),
            cmd => encode(cmd, &self.payload),
        }
    }
}

pub fn encode(command: Command, payload: &str) -> String {
    if payload.is_empty() {
        command.as_str().to_string()
    } else {
        format!("{}:{}", command, payload)
    }
}

/// Split on the first colon and look the left side up. Unrecognised input comes
/// back as [`Command::Unknown`] carrying the whole raw text.
pub fn decode(raw: &str) -> Message {
    let (name, payload) = raw.split_once(':').unwrap_or((raw, ""));

    match Command::from_name(name) {
        Command::Unknown => Message::new(Command::Unknown, raw),
        cmd => Message::new(cmd, payload),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormatError {
    #[error("peer info {0:?} has no port separator")]
    MissingSeparator(String),
    #[error("peer info {0:?} has an invalid port")]
    InvalidPort(String),
    #[error("peer info {0:?} has an invalid address")]
    InvalidAddress(String),
}

/// `ip:port` payload of a PEER_INFO frame.
pub fn encode_peer_info(addr: SocketAddr) -> String {
    format!("{}:{}", addr.ip(), addr.port())
}

pub fn decode_peer_info(payload: &str) -> Result<SocketAddr, FormatError> {
    // last colon, so an unbracketed ipv6 address keeps its own colons
    let (ip, port) = payload
        .rsplit_once(':')
        .ok_or_else(|| FormatError::MissingSeparator(payload.to_string()))?;

    let port: u16 = port
        .parse()
        .map_err(|_| FormatError::InvalidPort(payload.to_string()))?;
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| FormatError::InvalidAddress(payload.to_string()))?;

    Ok(SocketAddr::new(ip, port))
}
