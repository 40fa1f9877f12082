
use std::{
    collections::VecDeque,
    fmt,
    net::SocketAddr,
    sync::Arc,
    time::Instant,
};

use crate::association::{build_init_ack, Association};
use crate::chunk::chunk_abort::{ChunkAbort, ChunkError};
use crate::chunk::chunk_cookie_echo::ChunkCookieEcho;
use crate::chunk::chunk_init::ChunkInit;
use crate::chunk::chunk_shutdown::ChunkShutdownComplete;
use crate::chunk::Chunk;
use crate::config::{ClientConfig, EndpointConfig, ServerConfig};
use crate::cookie::Authenticator;
use crate::error_cause::*;
use crate::packet::Packet;
use crate::shared::{
    AssociationEvent, AssociationEventInner, AssociationId, EndpointEvent, EndpointEventInner,
};
use crate::util::AssociationIdGenerator;
use crate::{Side, Transmit};

use fxhash::FxHashMap;
use log::{debug, trace};
use rand::{rngs::StdRng, Rng, SeedableRng};
use slab::Slab;
use thiserror::Error;

/// The main entry point to the library
///
/// This object performs no I/O whatsoever. Instead, it generates a stream of packets to send via
/// `poll_transmit`, and consumes incoming packets and association-generated events via `handle` and
/// `handle_event`.
pub struct Endpoint {
    rng: StdRng,
    transmits: VecDeque<Transmit>,
    /// Identifies associations based on the local verification tag
    ///
    /// Uses a cheaper hash function since keys are locally created
    association_ids: FxHashMap<AssociationId, AssociationHandle>,
    /// Identifies associations based on the peer's transport addresses, for packets that do not
    /// carry our tag: INIT, COOKIE ECHO of a restart and T-bit chunks
    association_addrs: FxHashMap<SocketAddr, AssociationHandle>,

    associations: Slab<AssociationMeta>,
    local_aid_generator: Box<dyn AssociationIdGenerator>,
    authenticator: Authenticator,
    config: Arc<EndpointConfig>,
    server_config: Option<Arc<ServerConfig>>,
    /// Whether incoming associations should be unconditionally rejected by a server
    reject_new_associations: bool,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Endpoint")
            .field("rng", &self.rng)
            .field("transmits", &self.transmits)
            .field("association_ids", &self.association_ids)
            .field("association_addrs", &self.association_addrs)
            .field("associations", &self.associations)
            .field("config", &self.config)
            .field("server_config", &self.server_config)
            .field("reject_new_associations", &self.reject_new_associations)
            .finish()
    }
}

impl Endpoint {
    /// Create a new endpoint
    ///
    /// An endpoint without a `ServerConfig` only opens associations itself.
    pub fn new(config: Arc<EndpointConfig>, server_config: Option<Arc<ServerConfig>>) -> Self {
        Self {
            rng: StdRng::from_entropy(),
            transmits: VecDeque::new(),
            association_ids: FxHashMap::default(),
            association_addrs: FxHashMap::default(),
            associations: Slab::new(),
            local_aid_generator: (config.aid_generator_factory.as_ref())(),
            authenticator: Authenticator::new(config.secret_key.clone(), Instant::now()),
            reject_new_associations: false,
            config,
            server_config,
        }
    }

    /// Get the next packet to transmit
    #[must_use]
    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    /// Replace the server configuration, affecting new incoming associations only
    pub fn set_server_config(&mut self, server_config: Option<Arc<ServerConfig>>) {
        self.server_config = server_config;
    }

    /// Process `EndpointEvent`s emitted from related `Association`s
    ///
    /// In turn, processing this event may return a `AssociationEvent` for the same `Association`.
    pub fn handle_event(
        &mut self,
        ch: AssociationHandle,
        event: EndpointEvent,
    ) -> Option<AssociationEvent> {
        match event.0 {
            EndpointEventInner::Drained => {
                if self.associations.contains(ch.0) {
                    let meta = self.associations.remove(ch.0);
                    self.association_ids.remove(&meta.local_tag);
                    for addr in &meta.remotes {
                        if self.association_addrs.get(addr) == Some(&ch) {
                            self.association_addrs.remove(addr);
                        }
                    }
                    trace!("association {:?} drained", ch);
                }
            }
            EndpointEventInner::LocalTagChanged(tag) => {
                if let Some(meta) = self.associations.get_mut(ch.0) {
                    self.association_ids.remove(&meta.local_tag);
                    meta.local_tag = tag;
                    self.association_ids.insert(tag, ch);
                }
            }
            EndpointEventInner::PathAdded(addr) => {
                if let Some(meta) = self.associations.get_mut(ch.0) {
                    meta.remotes.push(addr);
                    self.association_addrs.insert(addr, ch);
                }
            }
            EndpointEventInner::PathRemoved(addr) => {
                if let Some(meta) = self.associations.get_mut(ch.0) {
                    meta.remotes.retain(|a| *a != addr);
                    if self.association_addrs.get(&addr) == Some(&ch) {
                        self.association_addrs.remove(&addr);
                    }
                }
            }
        }
        None
    }

    /// Process an incoming packet
    pub fn handle(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        packet: Packet,
    ) -> Option<(AssociationHandle, DatagramEvent)> {
        if let Err(err) = packet.check_packet() {
            trace!("malformed packet from {}: {}", remote, err);
            return None;
        }

        //
        // Handle packet on existing association, if any
        //
        if let Some(ch) = self.lookup(remote, &packet) {
            return Some((ch, Self::datagram(now, remote, packet)));
        }

        //
        // Potentially create a new association
        //
        match packet.first_chunk() {
            Some(Chunk::Init(init)) => {
                let init = init.clone();
                self.handle_init(now, remote, &init);
                None
            }
            Some(Chunk::CookieEcho(c)) => {
                let c = c.clone();
                self.handle_cookie_echo(now, remote, &c, packet)
            }
            _ => {
                self.handle_out_of_the_blue(now, remote, &packet);
                None
            }
        }
    }

    fn datagram(now: Instant, remote: SocketAddr, payload: Packet) -> DatagramEvent {
        DatagramEvent::AssociationEvent(AssociationEvent(AssociationEventInner::Datagram(
            Transmit {
                now,
                remote,
                payload,
            },
        )))
    }

    fn lookup(&self, remote: SocketAddr, packet: &Packet) -> Option<AssociationHandle> {
        let vtag = packet.verification_tag;
        if vtag != 0 {
            if let Some(ch) = self.association_ids.get(&vtag) {
                return Some(*ch);
            }
        }
        match packet.first_chunk() {
            Some(Chunk::Init(_)) | Some(Chunk::ShutdownAck) => {
                self.association_addrs.get(&remote).copied()
            }
            Some(Chunk::Abort(c)) if c.tag_reflected => self.association_addrs.get(&remote).copied(),
            Some(Chunk::ShutdownComplete(c)) if c.tag_reflected => {
                self.association_addrs.get(&remote).copied()
            }
            _ => None,
        }
    }

    /// Answers an INIT without keeping any state (RFC 4960 sec 5.1.3)
    fn handle_init(&mut self, now: Instant, remote: SocketAddr, init: &ChunkInit) {
        let Some(server_config) = self.server_config.clone() else {
            debug!("refusing INIT from {}: not accepting associations", remote);
            return;
        };

        if let Err(err) = init.check() {
            debug!("invalid INIT from {}: {}", remote, err);
            self.send(
                now,
                remote,
                init.initiate_tag,
                Chunk::Abort(ChunkAbort {
                    tag_reflected: false,
                    error_causes: vec![ErrorCause::new(INVALID_MANDATORY_PARAMETER)],
                }),
            );
            return;
        }

        if self.refuses_associations(&server_config) {
            debug!("refusing association from {}", remote);
            self.send(
                now,
                remote,
                init.initiate_tag,
                Chunk::Abort(ChunkAbort {
                    tag_reflected: false,
                    error_causes: vec![ErrorCause::new(OUT_OF_RESOURCE)],
                }),
            );
            return;
        }

        let local_tag = self.new_aid();
        let local_initial_tsn = self.rng.gen::<u32>();
        let init_ack = build_init_ack(
            &server_config.transport,
            &self.authenticator,
            init,
            local_tag,
            local_initial_tsn,
            (0, 0),
            now,
        );
        trace!("INIT-ACK to {} with tag {:08x}", remote, local_tag);
        self.send(now, remote, init.initiate_tag, Chunk::InitAck(init_ack));
    }

    fn handle_cookie_echo(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        c: &ChunkCookieEcho,
        packet: Packet,
    ) -> Option<(AssociationHandle, DatagramEvent)> {
        let cookie = match self.authenticator.open(&c.cookie) {
            Ok(cookie) => cookie,
            Err(err) => {
                debug!("COOKIE-ECHO from {} discarded: {}", remote, err);
                return None;
            }
        };
        if cookie.local_tag != packet.verification_tag {
            debug!("COOKIE-ECHO from {} with foreign verification tag", remote);
            return None;
        }

        // a peer restarting or colliding with an existing association
        if let Some(&ch) = self.association_addrs.get(&remote) {
            return Some((ch, Self::datagram(now, remote, packet)));
        }

        if let Some(staleness) = cookie.staleness(self.authenticator.now_ms(now)) {
            debug!("stale cookie from {} by {:?}", remote, staleness);
            let usec = staleness.as_micros().min(u32::MAX as u128) as u32;
            self.send(
                now,
                remote,
                cookie.peer_tag,
                Chunk::Error(ChunkError {
                    error_causes: vec![ErrorCause::stale_cookie(usec)],
                }),
            );
            return None;
        }

        let server_config = self.server_config.clone()?;
        if self.refuses_associations(&server_config)
            || self.association_ids.contains_key(&cookie.local_tag)
        {
            debug!("refusing association from {}", remote);
            return None;
        }

        let mut assoc = Association::accept(
            server_config.transport.clone(),
            self.authenticator.clone(),
            &cookie,
            remote,
            now,
        );
        let ch = self.add_association(cookie.local_tag, assoc.remote_addrs());
        debug!("accepted association {:?} from {}", ch, remote);

        // DATA bundled after the COOKIE ECHO
        let verification_tag = packet.verification_tag;
        let rest: Vec<Chunk> = packet.chunks.into_iter().skip(1).collect();
        if !rest.is_empty() {
            assoc.handle_event(AssociationEvent(AssociationEventInner::Datagram(
                Transmit {
                    now,
                    remote,
                    payload: Packet {
                        verification_tag,
                        chunks: rest,
                    },
                },
            )));
        }

        Some((ch, DatagramEvent::NewAssociation(assoc)))
    }

    /// Out of the blue packets (RFC 4960 sec 8.4)
    fn handle_out_of_the_blue(&mut self, now: Instant, remote: SocketAddr, packet: &Packet) {
        let vtag = packet.verification_tag;
        for chunk in &packet.chunks {
            match chunk {
                Chunk::Abort(_) | Chunk::ShutdownComplete(_) | Chunk::CookieAck => {
                    trace!("OOTB {} from {} ignored", chunk.chunk_type(), remote);
                    return;
                }
                Chunk::Error(e) if e.error_causes.iter().any(|c| c.code == STALE_COOKIE_ERROR) => {
                    return;
                }
                Chunk::ShutdownAck => {
                    self.send(
                        now,
                        remote,
                        vtag,
                        Chunk::ShutdownComplete(ChunkShutdownComplete {
                            tag_reflected: true,
                        }),
                    );
                    return;
                }
                _ => {}
            }
        }

        trace!("OOTB packet from {}, answering with ABORT", remote);
        self.send(
            now,
            remote,
            vtag,
            Chunk::Abort(ChunkAbort {
                tag_reflected: true,
                error_causes: vec![],
            }),
        );
    }

    fn send(&mut self, now: Instant, remote: SocketAddr, verification_tag: u32, chunk: Chunk) {
        self.transmits.push_back(Transmit {
            now,
            remote,
            payload: Packet {
                verification_tag,
                chunks: vec![chunk],
            },
        });
    }

    /// Initiate an Association
    ///
    /// `destinations` are the transport addresses of the peer; the first one is the
    /// primary path. The returned association has INIT queued for transmission.
    pub fn connect(
        &mut self,
        config: ClientConfig,
        destinations: &[SocketAddr],
        now: Instant,
    ) -> Result<(AssociationHandle, Association), ConnectError> {
        if self.reject_new_associations {
            return Err(ConnectError::EndpointStopping);
        }
        if destinations.is_empty() {
            return Err(ConnectError::NoDestinations);
        }
        for (i, remote) in destinations.iter().enumerate() {
            if remote.port() == 0 || destinations[..i].contains(remote) {
                return Err(ConnectError::InvalidRemoteAddress(*remote));
            }
        }
        if self.is_full() {
            return Err(ConnectError::TooManyAssociations);
        }

        let local_tag = self.new_aid();
        let mut assoc = Association::new(
            Side::Client,
            config.transport,
            self.authenticator.clone(),
            local_tag,
            destinations,
        );
        assoc.associate(now);
        let ch = self.add_association(local_tag, destinations.to_vec());
        Ok((ch, assoc))
    }

    fn new_aid(&mut self) -> AssociationId {
        loop {
            let aid = self.local_aid_generator.generate_aid();
            if aid != 0 && !self.association_ids.contains_key(&aid) {
                break aid;
            }
        }
    }

    fn add_association(
        &mut self,
        local_tag: AssociationId,
        remotes: Vec<SocketAddr>,
    ) -> AssociationHandle {
        let ch = AssociationHandle(self.associations.vacant_key());
        for addr in &remotes {
            self.association_addrs.insert(*addr, ch);
        }
        self.associations.insert(AssociationMeta { local_tag, remotes });
        self.association_ids.insert(local_tag, ch);
        ch
    }

    fn refuses_associations(&self, server_config: &ServerConfig) -> bool {
        self.associations.len() >= server_config.concurrent_associations as usize
            || self.reject_new_associations
            || self.is_full()
    }

    /// Unconditionally reject future incoming associations
    pub fn reject_new_associations(&mut self) {
        self.reject_new_associations = true;
    }

    /// Access the configuration used by this endpoint
    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Number of associations the endpoint currently routes packets to
    pub fn association_count(&self) -> usize {
        self.associations.len()
    }

    /// Whether we've used up 3/4 of the available AID space
    fn is_full(&self) -> bool {
        (((u32::MAX >> 1) + (u32::MAX >> 2)) as usize) < self.association_ids.len()
    }
}

#[derive(Debug)]
pub(crate) struct AssociationMeta {
    local_tag: AssociationId,
    /// Transport addresses of the peer
    remotes: Vec<SocketAddr>,
}

/// Internal identifier for an `Association` currently associated with an endpoint
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct AssociationHandle(pub usize);

impl From<AssociationHandle> for usize {
    fn from(x: AssociationHandle) -> usize {
        x.0
    }
}

/// Event resulting from processing a single packet
#[derive(Debug)]
#[allow(clippy::large_enum_variant)] // Not passed around extensively
pub enum DatagramEvent {
    /// The packet is redirected to its `Association`
    AssociationEvent(AssociationEvent),
    /// The packet has resulted in starting a new `Association`
    NewAssociation(Association),
}

/// Errors in the parameters being used to create a new association
///
/// These arise before any I/O has been performed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// The endpoint can no longer create new associations
    #[error("endpoint stopping")]
    EndpointStopping,
    /// The number of active associations on the local endpoint is at the limit
    #[error("too many associations")]
    TooManyAssociations,
    /// The remote [`SocketAddr`] supplied was malformed or given twice
    #[error("invalid remote address: {0}")]
    InvalidRemoteAddress(SocketAddr),
    /// No destination address was given
    #[error("no destination address")]
    NoDestinations,
}
