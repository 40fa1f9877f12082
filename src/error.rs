use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[non_exhaustive]
pub enum Error {
    #[error("INIT chunk must not be bundled with any other chunk")]
    ErrInitChunkBundled,
    #[error("INIT chunk expects a verification tag of 0 on the packet when out-of-the-blue")]
    ErrInitChunkVerifyTagNotZero,
    #[error("ChunkType of type INIT InitiateTag must not be 0")]
    ErrChunkTypeInitInitateTagZero,
    #[error("INIT ACK inbound stream request must be > 0")]
    ErrInitInboundStreamRequestZero,
    #[error("INIT ACK outbound stream request must be > 0")]
    ErrInitOutboundStreamRequestZero,
    #[error("INIT ACK Advertised Receiver Window Credit (a_rwnd) must be >= 1500")]
    ErrInitAdvertisedReceiver1500,
    #[error("INIT ACK is missing the State Cookie")]
    ErrInitAckNoCookie,
    #[error("packet carries no chunks")]
    ErrPacketNoChunks,
    #[error("chunk type {0} is not recognized, rest of the packet dropped")]
    ErrChunkTypeUnrecognized(u8),

    #[error("state cookie is too short")]
    ErrCookieTooShort,
    #[error("state cookie signature does not match")]
    ErrCookieSignatureMismatch,
    #[error("state cookie carries an unknown field {typ}")]
    ErrCookieUnknownField { typ: u16 },
    #[error("heartbeat info is malformed or was not issued by this association")]
    ErrHeartbeatInfoInvalid,

    #[error("association closed")]
    ErrAssociationClosed,
    #[error("association is not established")]
    ErrAssociationNotEstablished,
    #[error("association is shutting down, new data is refused")]
    ErrShutdownInProgress,
    #[error("destination {0} is already a path of this association")]
    ErrDuplicateDestination(std::net::SocketAddr),
    #[error("unknown path {0}")]
    ErrUnknownPath(usize),
    #[error("path {0} is not active")]
    ErrPathNotActive(usize),
    #[error("primary path cannot be removed")]
    ErrRemovePrimaryPath,

    #[error("stream identifier {0} is out of range")]
    ErrInvalidStreamIdentifier(u16),
    #[error("user data must not be empty")]
    ErrNoUserData,
    #[error("user data of {size} bytes exceeds the maximum of {max}")]
    ErrPayloadTooLarge { size: usize, max: usize },
    #[error("send queue is full")]
    ErrSendQueueFull,
}
