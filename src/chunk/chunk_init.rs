use crate::error::{Error, Result};

use bytes::Bytes;
use std::fmt;
use std::net::IpAddr;

///chunkInitCommon represents an SCTP Chunk body of type INIT and INIT ACK
///
/// 0                   1                   2                   3
/// 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|   Type = 1    |  Chunk Flags  |      Chunk Length             |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                         Initiate Tag                          |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|           Advertised Receiver Window Credit (a_rwnd)          |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|  Number of Outbound Streams   |  Number of Inbound Streams    |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                          Initial TSN                          |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///|                                                               |
///|              Optional/Variable-Length Parameters              |
///|                                                               |
///+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
///
///The variable parameters understood by the engine are the IPv4/IPv6
///addresses (5, 6), the Cookie Preservative (9) of an INIT, the State
///Cookie (7) of an INIT ACK, and Forward-TSN-Supported (49152, RFC 3758).
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct ChunkInit {
    pub initiate_tag: u32,
    pub advertised_receiver_window_credit: u32,
    pub num_outbound_streams: u16,
    pub num_inbound_streams: u16,
    pub initial_tsn: u32,
    /// Additional transport addresses of the sender; the source address of the
    /// packet is always part of the association.
    pub addresses: Vec<IpAddr>,
    /// Suggested cookie life-span increment in milliseconds
    pub cookie_preservative: Option<u32>,
    /// Mandatory for INIT ACK
    pub state_cookie: Option<Bytes>,
    pub forward_tsn_supported: bool,
}

pub(crate) const INIT_CHUNK_MIN_LENGTH: usize = 16;
const IPV4_ADDRESS_PARAM_LENGTH: usize = 8;
const IPV6_ADDRESS_PARAM_LENGTH: usize = 20;
const COOKIE_PRESERVATIVE_PARAM_LENGTH: usize = 8;
const FORWARD_TSN_SUPPORTED_PARAM_LENGTH: usize = 4;
const PARAM_HEADER_LENGTH: usize = 4;

/// makes chunkInit printable
impl fmt::Display for ChunkInit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut res = format!(
            "initiateTag: {}\nadvertisedReceiverWindowCredit: {}\nnumOutboundStreams: {}\nnumInboundStreams: {}\ninitialTsn: {}",
            self.initiate_tag,
            self.advertised_receiver_window_credit,
            self.num_outbound_streams,
            self.num_inbound_streams,
            self.initial_tsn,
        );

        for (i, addr) in self.addresses.iter().enumerate() {
            res += format!("\nAddress {i}: {addr}").as_str();
        }
        if let Some(cookie) = &self.state_cookie {
            res += format!("\nState Cookie: {} bytes", cookie.len()).as_str();
        }
        if self.forward_tsn_supported {
            res += "\nForward TSN Supported";
        }

        write!(f, "{res}")
    }
}

impl ChunkInit {
    pub(crate) fn check(&self) -> Result<()> {
        // The receiver of the INIT (the responding end) records the value of
        // the Initiate Tag parameter.  This value MUST be placed into the
        // Verification Tag field of every SCTP packet that the receiver of
        // the INIT transmits within this association.
        //
        // If the value of the Initiate Tag in a received INIT chunk is found
        // to be 0, the receiver MUST treat it as an error and close the
        // association by transmitting an ABORT.
        if self.initiate_tag == 0 {
            return Err(Error::ErrChunkTypeInitInitateTagZero);
        }

        // Note: A receiver of an INIT with the MIS value of 0 SHOULD abort
        // the association.
        if self.num_inbound_streams == 0 {
            return Err(Error::ErrInitInboundStreamRequestZero);
        }

        // Note: A receiver of an INIT with the OS value set to 0 SHOULD
        // abort the association.
        if self.num_outbound_streams == 0 {
            return Err(Error::ErrInitOutboundStreamRequestZero);
        }

        // An SCTP receiver MUST be able to receive a minimum of 1500 bytes in
        // one SCTP packet.  This means that an SCTP endpoint MUST NOT indicate
        // less than 1500 bytes in its initial a_rwnd sent in the INIT or INIT
        // ACK.
        if self.advertised_receiver_window_credit < 1500 {
            return Err(Error::ErrInitAdvertisedReceiver1500);
        }

        Ok(())
    }

    pub(crate) fn value_length(&self) -> usize {
        let mut l = INIT_CHUNK_MIN_LENGTH;
        for addr in &self.addresses {
            l += match addr {
                IpAddr::V4(_) => IPV4_ADDRESS_PARAM_LENGTH,
                IpAddr::V6(_) => IPV6_ADDRESS_PARAM_LENGTH,
            };
        }
        if self.cookie_preservative.is_some() {
            l += COOKIE_PRESERVATIVE_PARAM_LENGTH;
        }
        if let Some(cookie) = &self.state_cookie {
            l += PARAM_HEADER_LENGTH + cookie.len();
            l += (4 - cookie.len() % 4) % 4;
        }
        if self.forward_tsn_supported {
            l += FORWARD_TSN_SUPPORTED_PARAM_LENGTH;
        }
        l
    }
}
