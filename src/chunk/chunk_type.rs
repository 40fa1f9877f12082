use std::fmt;

// chunkType is an enum for SCTP Chunk Type field
// This field identifies the type of information contained in the
// Chunk Value field.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct ChunkType(pub u8);

pub const CT_PAYLOAD_DATA: ChunkType = ChunkType(0);
pub const CT_INIT: ChunkType = ChunkType(1);
pub const CT_INIT_ACK: ChunkType = ChunkType(2);
pub const CT_SACK: ChunkType = ChunkType(3);
pub const CT_HEARTBEAT: ChunkType = ChunkType(4);
pub const CT_HEARTBEAT_ACK: ChunkType = ChunkType(5);
pub const CT_ABORT: ChunkType = ChunkType(6);
pub const CT_SHUTDOWN: ChunkType = ChunkType(7);
pub const CT_SHUTDOWN_ACK: ChunkType = ChunkType(8);
pub const CT_ERROR: ChunkType = ChunkType(9);
pub const CT_COOKIE_ECHO: ChunkType = ChunkType(10);
pub const CT_COOKIE_ACK: ChunkType = ChunkType(11);
pub const CT_SHUTDOWN_COMPLETE: ChunkType = ChunkType(14);
pub const CT_FORWARD_TSN: ChunkType = ChunkType(192);

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let others = format!("Unknown ChunkType: {}", self.0);
        let s = match *self {
            CT_PAYLOAD_DATA => "DATA",
            CT_INIT => "INIT",
            CT_INIT_ACK => "INIT-ACK",
            CT_SACK => "SACK",
            CT_HEARTBEAT => "HEARTBEAT",
            CT_HEARTBEAT_ACK => "HEARTBEAT-ACK",
            CT_ABORT => "ABORT",
            CT_SHUTDOWN => "SHUTDOWN",
            CT_SHUTDOWN_ACK => "SHUTDOWN-ACK",
            CT_ERROR => "ERROR",
            CT_COOKIE_ECHO => "COOKIE-ECHO",
            CT_COOKIE_ACK => "COOKIE-ACK",
            CT_SHUTDOWN_COMPLETE => "SHUTDOWN-COMPLETE",
            CT_FORWARD_TSN => "FORWARD-TSN",
            _ => others.as_str(),
        };
        write!(f, "{s}")
    }
}

/// What a receiver does with a chunk type it does not recognize, encoded in the
/// highest-order two bits of the type (RFC 4960 sec 3.2).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum UnrecognizedAction {
    /// 00: stop processing this packet and discard it
    Stop,
    /// 01: stop processing, discard, and report in an ERROR chunk
    StopAndReport,
    /// 10: skip this chunk and continue processing
    Skip,
    /// 11: skip this chunk, continue processing, and report in an ERROR chunk
    SkipAndReport,
}

impl ChunkType {
    pub(crate) fn unrecognized_action(&self) -> UnrecognizedAction {
        match self.0 >> 6 {
            0 => UnrecognizedAction::Stop,
            1 => UnrecognizedAction::StopAndReport,
            2 => UnrecognizedAction::Skip,
            _ => UnrecognizedAction::SkipAndReport,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_chunk_type_string() {
        let tests = vec![
            (CT_PAYLOAD_DATA, "DATA"),
            (CT_INIT, "INIT"),
            (CT_INIT_ACK, "INIT-ACK"),
            (CT_SACK, "SACK"),
            (CT_HEARTBEAT, "HEARTBEAT"),
            (CT_HEARTBEAT_ACK, "HEARTBEAT-ACK"),
            (CT_ABORT, "ABORT"),
            (CT_SHUTDOWN, "SHUTDOWN"),
            (CT_SHUTDOWN_ACK, "SHUTDOWN-ACK"),
            (CT_ERROR, "ERROR"),
            (CT_COOKIE_ECHO, "COOKIE-ECHO"),
            (CT_COOKIE_ACK, "COOKIE-ACK"),
            (CT_SHUTDOWN_COMPLETE, "SHUTDOWN-COMPLETE"),
            (CT_FORWARD_TSN, "FORWARD-TSN"),
            (ChunkType(255), "Unknown ChunkType: 255"),
        ];

        for (ct, expected) in tests {
            assert_eq!(
                ct.to_string(),
                expected,
                "failed to stringify chunkType {ct}, expected {expected}"
            );
        }
    }

    #[test]
    fn test_unrecognized_action() {
        assert_eq!(ChunkType(0x3f).unrecognized_action(), UnrecognizedAction::Stop);
        assert_eq!(
            ChunkType(0x40).unrecognized_action(),
            UnrecognizedAction::StopAndReport
        );
        assert_eq!(ChunkType(0x80).unrecognized_action(), UnrecognizedAction::Skip);
        assert_eq!(
            ChunkType(0xc1).unrecognized_action(),
            UnrecognizedAction::SkipAndReport
        );
    }
}
