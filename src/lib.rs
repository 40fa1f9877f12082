//! Low-level protocol logic for SCTP associations (RFC 4960)
//!
//! sctp-engine contains a fully deterministic implementation of the SCTP association
//! lifecycle: the INIT/COOKIE handshake, congestion-controlled and optionally partially
//! reliable data transfer, multi-homed path management and graceful shutdown. It contains
//! no networking code and does not get any relevant timestamps from the operating system.
//!
//! Neither does it encode chunks. Packets come in and go out as [`Packet`] values holding
//! typed [`chunk::Chunk`]s; a bundling layer outside this crate owns the wire format.
//!
//! The most important types are `Endpoint`, which conceptually represents the protocol state for
//! a single socket and mostly manages configuration and dispatches incoming packets to the
//! related `Association`. `Association` types contain the bulk of the protocol logic related to
//! managing a single association and all the related state (such as paths and timers).

#![warn(rust_2018_idioms)]
#![allow(clippy::too_many_arguments)]

use std::time::Instant;
use std::{fmt, net::SocketAddr, ops};

mod association;
pub use crate::association::{
    AssociationState, AssociationStats, Association, CommunicationLostReason, Event, QueueKind,
    SendFailureReason, SendOptions,
};

pub mod chunk;

mod config;
pub use crate::config::{ClientConfig, EndpointConfig, ServerConfig, TransportConfig};

mod cookie;

mod endpoint;
pub use crate::endpoint::{AssociationHandle, ConnectError, DatagramEvent, Endpoint};

mod error;
pub use crate::error::{Error, Result};

pub mod error_cause;

mod packet;
pub use crate::packet::Packet;

mod path;
pub use crate::path::{PathId, PathState};

pub(crate) mod queue;

mod shared;
pub use crate::shared::{AssociationEvent, AssociationId, EndpointEvent};

mod util;
pub use crate::util::{AssociationIdGenerator, RandomAssociationIdGenerator};

/// Whether an endpoint was the initiator of an association
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub enum Side {
    /// The initiator of an association
    #[default]
    Client = 0,
    /// The acceptor of an association
    Server = 1,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Side::Client => "Client",
            Side::Server => "Server",
        };
        write!(f, "{}", s)
    }
}

impl Side {
    #[inline]
    /// Shorthand for `self == Side::Client`
    pub fn is_client(self) -> bool {
        self == Side::Client
    }

    #[inline]
    /// Shorthand for `self == Side::Server`
    pub fn is_server(self) -> bool {
        self == Side::Server
    }
}

impl ops::Not for Side {
    type Output = Side;
    fn not(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

/// Incoming/outgoing Transmit
#[derive(Debug)]
pub struct Transmit {
    /// Received/Sent time
    pub now: Instant,
    /// The transport address this packet comes from or goes to
    pub remote: SocketAddr,
    /// The packet, chunks already decoded or not yet encoded
    pub payload: Packet,
}
