use crate::util::{AssociationIdGenerator, RandomAssociationIdGenerator};

use ring::hmac;
use std::fmt;
use std::sync::Arc;

/// initial MTU for outgoing packets
pub(crate) const INITIAL_MTU: u32 = 1228;
pub(crate) const INITIAL_RECV_BUF_SIZE: u32 = 1024 * 1024;
pub(crate) const COMMON_HEADER_SIZE: u32 = 12;
pub(crate) const DATA_CHUNK_HEADER_SIZE: u32 = 16;

// RFC 4960 sec 15. Suggested SCTP Protocol Parameter Values
pub(crate) const RTO_INITIAL: u64 = 3000; // msec
pub(crate) const RTO_MIN: u64 = 1000; // msec
pub(crate) const RTO_MAX: u64 = 60000; // msec
pub(crate) const MAX_ASSOCIATION_RETRANS: usize = 10;
pub(crate) const MAX_INIT_RETRANS: usize = 8;
pub(crate) const MAX_PATH_RETRANS: usize = 5;
pub(crate) const VALID_COOKIE_LIFE: u64 = 60000; // msec
pub(crate) const HEARTBEAT_INTERVAL: u64 = 30000; // msec
pub(crate) const ACK_INTERVAL: u64 = 200; // msec
pub(crate) const DEFAULT_MAX_SEND_QUEUE_LEN: usize = 1024;

/// Config collects the arguments of a single association into a single structure
#[derive(Debug)]
pub struct TransportConfig {
    max_receive_buffer_size: u32,
    max_num_outbound_streams: u16,
    max_num_inbound_streams: u16,
    mtu: u32,
    rto_initial: u64,
    rto_min: u64,
    rto_max: u64,
    max_association_retransmissions: usize,
    max_init_retransmissions: usize,
    max_path_retransmissions: usize,
    valid_cookie_life: u64,
    heartbeat_interval: u64,
    ack_interval: u64,
    max_send_queue_len: usize,
    forward_tsn_supported: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            max_receive_buffer_size: INITIAL_RECV_BUF_SIZE,
            max_num_outbound_streams: u16::MAX,
            max_num_inbound_streams: u16::MAX,
            mtu: INITIAL_MTU,
            rto_initial: RTO_INITIAL,
            rto_min: RTO_MIN,
            rto_max: RTO_MAX,
            max_association_retransmissions: MAX_ASSOCIATION_RETRANS,
            max_init_retransmissions: MAX_INIT_RETRANS,
            max_path_retransmissions: MAX_PATH_RETRANS,
            valid_cookie_life: VALID_COOKIE_LIFE,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            ack_interval: ACK_INTERVAL,
            max_send_queue_len: DEFAULT_MAX_SEND_QUEUE_LEN,
            forward_tsn_supported: true,
        }
    }
}

impl TransportConfig {
    /// Advertised receiver window, in bytes
    pub fn with_max_receive_buffer_size(mut self, value: u32) -> Self {
        self.max_receive_buffer_size = value;
        self
    }

    pub fn with_max_num_outbound_streams(mut self, value: u16) -> Self {
        self.max_num_outbound_streams = value;
        self
    }

    pub fn with_max_num_inbound_streams(mut self, value: u16) -> Self {
        self.max_num_inbound_streams = value;
        self
    }

    /// Path MTU used for every destination of the association
    pub fn with_mtu(mut self, value: u32) -> Self {
        self.mtu = value;
        self
    }

    /// RTO.Initial, RTO.Min and RTO.Max in milliseconds
    pub fn with_rto(mut self, initial: u64, min: u64, max: u64) -> Self {
        self.rto_initial = initial;
        self.rto_min = min;
        self.rto_max = max;
        self
    }

    /// Association.Max.Retrans
    pub fn with_max_association_retransmissions(mut self, value: usize) -> Self {
        self.max_association_retransmissions = value;
        self
    }

    /// Max.Init.Retransmits
    pub fn with_max_init_retransmissions(mut self, value: usize) -> Self {
        self.max_init_retransmissions = value;
        self
    }

    /// Path.Max.Retrans
    pub fn with_max_path_retransmissions(mut self, value: usize) -> Self {
        self.max_path_retransmissions = value;
        self
    }

    /// Valid.Cookie.Life in milliseconds
    pub fn with_valid_cookie_life(mut self, value: u64) -> Self {
        self.valid_cookie_life = value;
        self
    }

    /// HB.interval in milliseconds
    pub fn with_heartbeat_interval(mut self, value: u64) -> Self {
        self.heartbeat_interval = value;
        self
    }

    /// Delay of the delayed SACK timer in milliseconds
    pub fn with_ack_interval(mut self, value: u64) -> Self {
        self.ack_interval = value;
        self
    }

    /// Send queue length above which a queue status change is notified and `send` is refused
    pub fn with_max_send_queue_len(mut self, value: usize) -> Self {
        self.max_send_queue_len = value;
        self
    }

    /// Offer partial reliability (FORWARD-TSN, RFC 3758) during the handshake
    pub fn with_forward_tsn_supported(mut self, value: bool) -> Self {
        self.forward_tsn_supported = value;
        self
    }

    pub(crate) fn max_receive_buffer_size(&self) -> u32 {
        self.max_receive_buffer_size
    }

    pub(crate) fn max_num_outbound_streams(&self) -> u16 {
        self.max_num_outbound_streams
    }

    pub(crate) fn max_num_inbound_streams(&self) -> u16 {
        self.max_num_inbound_streams
    }

    pub(crate) fn mtu(&self) -> u32 {
        self.mtu
    }

    pub(crate) fn rto_initial(&self) -> u64 {
        self.rto_initial
    }

    pub(crate) fn rto_min(&self) -> u64 {
        self.rto_min
    }

    pub(crate) fn rto_max(&self) -> u64 {
        self.rto_max
    }

    pub(crate) fn max_association_retransmissions(&self) -> usize {
        self.max_association_retransmissions
    }

    pub(crate) fn max_init_retransmissions(&self) -> usize {
        self.max_init_retransmissions
    }

    pub(crate) fn max_path_retransmissions(&self) -> usize {
        self.max_path_retransmissions
    }

    pub(crate) fn valid_cookie_life(&self) -> u64 {
        self.valid_cookie_life
    }

    pub(crate) fn heartbeat_interval(&self) -> u64 {
        self.heartbeat_interval
    }

    pub(crate) fn ack_interval(&self) -> u64 {
        self.ack_interval
    }

    pub(crate) fn max_send_queue_len(&self) -> usize {
        self.max_send_queue_len
    }

    pub(crate) fn forward_tsn_supported(&self) -> bool {
        self.forward_tsn_supported
    }

    /// Largest user message that fits a single DATA chunk on one path
    pub(crate) fn max_payload_size(&self) -> usize {
        self.mtu.saturating_sub(COMMON_HEADER_SIZE + DATA_CHUNK_HEADER_SIZE) as usize
    }
}

/// Global configuration for the endpoint, affecting all associations
///
/// Default values should be suitable for most internet applications.
#[derive(Clone)]
pub struct EndpointConfig {
    /// Secret used to sign state cookies and heartbeat info
    pub(crate) secret_key: hmac::Key,

    /// AID generator factory
    ///
    /// Create a aid generator for local verification tags in Endpoint struct
    pub(crate) aid_generator_factory:
        Arc<dyn Fn() -> Box<dyn AssociationIdGenerator> + Send + Sync>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointConfig {
    /// Create a default config with a random secret key
    pub fn new() -> Self {
        let aid_factory: fn() -> Box<dyn AssociationIdGenerator> =
            || Box::new(RandomAssociationIdGenerator::default());
        let secret: [u8; 32] = rand::random();
        Self {
            secret_key: hmac::Key::new(hmac::HMAC_SHA256, &secret),
            aid_generator_factory: Arc::new(aid_factory),
        }
    }

    /// Supply a custom Association ID generator factory
    ///
    /// Called once by each `Endpoint` constructed from this configuration to obtain the
    /// generator of the local verification tags, which double as association identifiers.
    pub fn aid_generator<F: Fn() -> Box<dyn AssociationIdGenerator> + Send + Sync + 'static>(
        &mut self,
        factory: F,
    ) -> &mut Self {
        self.aid_generator_factory = Arc::new(factory);
        self
    }

    /// Replace the secret used to sign state cookies
    ///
    /// Endpoints sharing a secret accept each other's cookies.
    pub fn secret(&mut self, value: &[u8]) -> &mut Self {
        self.secret_key = hmac::Key::new(hmac::HMAC_SHA256, value);
        self
    }
}

impl fmt::Debug for EndpointConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("EndpointConfig")
            .field("secret_key", &"[ elided ]")
            .field("aid_generator_factory", &"[ elided ]")
            .finish()
    }
}

/// Parameters governing incoming associations
///
/// Default values should be suitable for most internet applications.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Transport configuration to use for incoming associations
    pub transport: Arc<TransportConfig>,

    /// Maximum number of concurrent associations
    pub(crate) concurrent_associations: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            transport: Arc::new(TransportConfig::default()),
            concurrent_associations: 100_000,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        ServerConfig::default()
    }

    pub fn with_concurrent_associations(mut self, value: u32) -> Self {
        self.concurrent_associations = value;
        self
    }
}

/// Configuration for outgoing associations
///
/// Default values should be suitable for most internet applications.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Transport configuration to use
    pub transport: Arc<TransportConfig>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            transport: Arc::new(TransportConfig::default()),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        ClientConfig::default()
    }
}
