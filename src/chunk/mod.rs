//! Decoded SCTP chunks exchanged with the bundling layer
//!
//! The engine never touches chunk bytes. Inbound packets arrive already split into
//! `Chunk` values, outbound packets leave as `Chunk` values grouped per destination,
//! and the bundling collaborator owns the RFC 4960 wire layout. Lengths are still
//! computed here so that packets can be kept within the path MTU.

pub mod chunk_abort;
pub mod chunk_cookie_echo;
pub mod chunk_forward_tsn;
pub mod chunk_heartbeat;
pub mod chunk_init;
pub mod chunk_payload_data;
pub mod chunk_selective_ack;
pub mod chunk_shutdown;
pub mod chunk_type;

use chunk_abort::{ChunkAbort, ChunkError};
use chunk_cookie_echo::ChunkCookieEcho;
use chunk_forward_tsn::ChunkForwardTsn;
use chunk_heartbeat::ChunkHeartbeat;
use chunk_init::ChunkInit;
use chunk_payload_data::ChunkPayloadData;
use chunk_selective_ack::ChunkSelectiveAck;
use chunk_shutdown::{ChunkShutdown, ChunkShutdownComplete, CUMULATIVE_TSN_ACK_LENGTH};
use chunk_type::*;

use std::fmt;

pub(crate) const CHUNK_HEADER_SIZE: usize = 4;

/// A single decoded chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    PayloadData(ChunkPayloadData),
    Init(ChunkInit),
    InitAck(ChunkInit),
    SelectiveAck(ChunkSelectiveAck),
    Heartbeat(ChunkHeartbeat),
    HeartbeatAck(ChunkHeartbeat),
    Abort(ChunkAbort),
    Shutdown(ChunkShutdown),
    ShutdownAck,
    Error(ChunkError),
    CookieEcho(ChunkCookieEcho),
    CookieAck,
    ShutdownComplete(ChunkShutdownComplete),
    ForwardTsn(ChunkForwardTsn),
    /// A chunk type the bundling layer could not decode; only its header survives
    Unknown { typ: ChunkType, flags: u8 },
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chunk::PayloadData(c) => write!(f, "{c}"),
            Chunk::Init(c) => write!(f, "INIT\n{c}"),
            Chunk::InitAck(c) => write!(f, "INIT-ACK\n{c}"),
            Chunk::SelectiveAck(c) => write!(f, "{c}"),
            Chunk::Heartbeat(c) => write!(f, "{c}"),
            Chunk::HeartbeatAck(c) => write!(f, "ACK {c}"),
            Chunk::Abort(c) => write!(f, "{c}"),
            Chunk::Shutdown(c) => write!(f, "{c}"),
            Chunk::Error(c) => write!(f, "{c}"),
            Chunk::CookieEcho(c) => write!(f, "{c}"),
            Chunk::ShutdownComplete(c) => write!(f, "{c}"),
            Chunk::ForwardTsn(c) => write!(f, "{c}"),
            Chunk::ShutdownAck | Chunk::CookieAck | Chunk::Unknown { .. } => {
                write!(f, "{}", self.chunk_type())
            }
        }
    }
}

impl Chunk {
    pub fn chunk_type(&self) -> ChunkType {
        match self {
            Chunk::PayloadData(_) => CT_PAYLOAD_DATA,
            Chunk::Init(_) => CT_INIT,
            Chunk::InitAck(_) => CT_INIT_ACK,
            Chunk::SelectiveAck(_) => CT_SACK,
            Chunk::Heartbeat(_) => CT_HEARTBEAT,
            Chunk::HeartbeatAck(_) => CT_HEARTBEAT_ACK,
            Chunk::Abort(_) => CT_ABORT,
            Chunk::Shutdown(_) => CT_SHUTDOWN,
            Chunk::ShutdownAck => CT_SHUTDOWN_ACK,
            Chunk::Error(_) => CT_ERROR,
            Chunk::CookieEcho(_) => CT_COOKIE_ECHO,
            Chunk::CookieAck => CT_COOKIE_ACK,
            Chunk::ShutdownComplete(_) => CT_SHUTDOWN_COMPLETE,
            Chunk::ForwardTsn(_) => CT_FORWARD_TSN,
            Chunk::Unknown { typ, .. } => *typ,
        }
    }

    pub(crate) fn value_length(&self) -> usize {
        match self {
            Chunk::PayloadData(c) => c.value_length(),
            Chunk::Init(c) | Chunk::InitAck(c) => c.value_length(),
            Chunk::SelectiveAck(c) => c.value_length(),
            Chunk::Heartbeat(c) | Chunk::HeartbeatAck(c) => c.value_length(),
            Chunk::Abort(c) => c.value_length(),
            Chunk::Shutdown(_) => CUMULATIVE_TSN_ACK_LENGTH,
            Chunk::Error(c) => c.value_length(),
            Chunk::CookieEcho(c) => c.cookie.len(),
            Chunk::ForwardTsn(c) => c.value_length(),
            Chunk::ShutdownAck
            | Chunk::CookieAck
            | Chunk::ShutdownComplete(_)
            | Chunk::Unknown { .. } => 0,
        }
    }

    /// Length on the wire including the chunk header and padding
    pub fn length(&self) -> usize {
        let l = CHUNK_HEADER_SIZE + self.value_length();
        l + (4 - l % 4) % 4
    }

    /// INIT, INIT ACK and SHUTDOWN COMPLETE must be the only chunk of their packet
    pub(crate) fn must_be_alone(&self) -> bool {
        matches!(
            self,
            Chunk::Init(_) | Chunk::InitAck(_) | Chunk::ShutdownComplete(_)
        )
    }
}
