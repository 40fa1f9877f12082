use crate::chunk::Chunk;
use crate::config::COMMON_HEADER_SIZE;
use crate::error::{Error, Result};

use std::fmt;

///Packet represents an SCTP packet as exchanged with the bundling layer: the
///Verification Tag of the common header plus the decoded chunks. Ports and the
///checksum belong to the wire layout and are handled by the bundling layer.
///
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|     Source Port Number        |     Destination Port Number   |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                      Verification Tag                         |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                           Checksum                            |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                           Chunk #1                            |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                             ...                               |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                           Chunk #n                            |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub verification_tag: u32,
    pub chunks: Vec<Chunk>,
}

/// makes packet printable
impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut res = format!("Packet:\n\tverificationTag: {}\n", self.verification_tag);
        for chunk in &self.chunks {
            res += format!("Chunk: {chunk}\n").as_str();
        }
        write!(f, "{res}")
    }
}

impl Packet {
    /// Size of the packet on the wire
    pub fn length(&self) -> usize {
        COMMON_HEADER_SIZE as usize + self.chunks.iter().map(|c| c.length()).sum::<usize>()
    }

    pub(crate) fn check_packet(&self) -> Result<()> {
        if self.chunks.is_empty() {
            return Err(Error::ErrPacketNoChunks);
        }

        // Check values on the packet that are specific to a particular chunk type
        for c in &self.chunks {
            if let Chunk::Init(_) = c {
                // An INIT or INIT ACK chunk MUST NOT be bundled with any other chunk.
                // They MUST be the only chunks present in the SCTP packets that carry
                // them.
                if self.chunks.len() != 1 {
                    return Err(Error::ErrInitChunkBundled);
                }

                // A packet containing an INIT chunk MUST have a zero Verification
                // Tag.
                if self.verification_tag != 0 {
                    return Err(Error::ErrInitChunkVerifyTagNotZero);
                }
            }
        }

        Ok(())
    }

    pub(crate) fn first_chunk(&self) -> Option<&Chunk> {
        self.chunks.first()
    }
}
