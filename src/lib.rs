//!A rendezvous coordinator and client for UDP hole punching between two peers behind NAT.
//!
//!A peer behind a NAT (such as a home gateway) only accepts traffic from addresses it has sent to first.
//!Two such peers can still talk directly if both send to each other's public address at about the same time,
//!each outgoing packet opening the mapping the other side's packets need.
//!
//!## How it works
//!Setup a public accessable server as rendezvous point. Each peer registers with it, and the server observes
//!the public address the registration came from.
//!
//!As soon as two peers are registered, the server sends each one the other's address and forgets both.
//!Only one pairing is handled at a time: the two registrations whose ids sort first are paired,
//!and anyone else waiting has to register again.
//!
//!Each peer then sends a burst of hole punch packets to the other, waits for anything to come back,
//!and hands the socket to a [`udp::Session`] for plain text messaging with ping/pong and quit.
//!
//!The peer socket reuses the port the rendezvous socket registered from, so the peer aims at the
//!NAT mapping the server observed.
//!
//!## Wire format
//!One text frame per datagram, `COMMAND` or `COMMAND:PAYLOAD`, see [`proto`].
//!
//!## Feature flags
//!For convenient, the crate include both client and server code by default.
//!Mostly you only use client or server code, set features to `client` or `server` instead.
//!
//!```toml
//!holepunch = { version = "0.1", default-features=false, features=["client"]}
//!```
//!
//!- `client`: traversal client and session, needs tokio
//!- `server`: rendezvous server

pub mod config;
pub mod error;
pub mod proto;
pub mod udp;

pub use error::{Error, Result};
