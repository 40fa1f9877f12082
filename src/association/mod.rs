//! The association state machine
//!
//! An [`Association`] is driven entirely by its caller: datagrams come in through
//! [`Association::handle_event`], timers through [`Association::handle_timeout`], and
//! everything the association wants done is pulled out with
//! [`Association::poll_transmit`], [`Association::poll`] and
//! [`Association::poll_endpoint_event`].
//!
//! The work is split the way RFC 4960 splits it. `control` runs the handshake,
//! shutdown and abort, `flow_control` decides when and where DATA goes,
//! `reliable_transfer` owns every sent chunk until it is acked, and `receive` keeps
//! the TSNs seen from the peer. Path health lives in [`crate::path`].

mod control;
mod flow_control;
mod receive;
mod reliable_transfer;
pub(crate) mod state;
pub(crate) mod stats;
mod timer;

#[cfg(test)]
mod association_test;

pub(crate) use control::build_init_ack;

use crate::chunk::chunk_abort::{ChunkAbort, ChunkError};
use crate::chunk::chunk_init::ChunkInit;
use crate::chunk::chunk_payload_data::ChunkPayloadData;
use crate::chunk::chunk_selective_ack::ChunkSelectiveAck;
use crate::chunk::chunk_type::CT_FORWARD_TSN;
use crate::chunk::chunk_forward_tsn::ChunkForwardTsn;
use crate::chunk::Chunk;
use crate::config::{TransportConfig, COMMON_HEADER_SIZE};
use crate::cookie::Authenticator;
use crate::error::{Error, Result};
use crate::error_cause::*;
use crate::packet::Packet;
use crate::path::{PathFailure, PathId, PathManager, PathState};
use crate::queue::retransmission_queue::OutboundChunk;
use crate::shared::{AssociationEvent, AssociationEventInner, EndpointEvent, EndpointEventInner};
use crate::{Side, Transmit};
use flow_control::FlowControl;
use receive::{DataOutcome, ReceiveState};
use reliable_transfer::ReliableTransfer;
use state::AckState;
use timer::{Timer, TimerTable};

pub use state::AssociationState;
pub use stats::AssociationStats;

use bytes::Bytes;
use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why an association went down without a graceful shutdown
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CommunicationLostReason {
    /// The peer sent ABORT, or the local user aborted
    Aborted,
    /// Association.Max.Retrans consecutive retransmissions without an answer
    ExceededRetransmissions,
    /// Every destination of the peer is inactive
    EndpointUnreachable,
    /// The peer violated a mandatory parameter rule during setup
    InvalidParameter,
}

impl From<PathFailure> for CommunicationLostReason {
    fn from(failure: PathFailure) -> Self {
        match failure {
            PathFailure::ExceededRetransmissions => {
                CommunicationLostReason::ExceededRetransmissions
            }
            PathFailure::EndpointUnreachable => CommunicationLostReason::EndpointUnreachable,
        }
    }
}

/// Why a message handed to [`Association::send`] never made it to the peer
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SendFailureReason {
    /// Its lifetime expired before it was acknowledged
    Abandoned,
    /// The association went down before it was ever sent
    Unsent,
    /// The association went down while it was in flight
    Unacknowledged,
}

/// Queues the ULP is told about when they fill up or drain
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum QueueKind {
    Send,
}

/// Notifications for the upper layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The association is established
    CommunicationUp {
        paths: usize,
        inbound_streams: u16,
        outbound_streams: u16,
    },
    /// The association is gone; no other event follows. Undelivered messages
    /// are reported with [`Event::SendFailure`] before it.
    CommunicationLost { reason: CommunicationLostReason },
    /// The peer reported a non-fatal error
    CommunicationError { cause: ErrorCause },
    NetworkStatusChange { path: PathId, state: PathState },
    /// The peer restarted; everything queued before was dropped
    Restart,
    /// The peer started a graceful shutdown
    ShutdownReceived,
    ShutdownComplete,
    SendFailure {
        stream_identifier: u16,
        data: Bytes,
        reason: SendFailureReason,
    },
    QueueStatusChange { queue: QueueKind, len: usize },
    DataArrive {
        stream_identifier: u16,
        stream_sequence_number: u16,
        unordered: bool,
        payload_protocol_identifier: u32,
        data: Bytes,
    },
}

/// Per-message parameters of [`Association::send`]
#[derive(Debug, Default, Clone)]
pub struct SendOptions {
    pub payload_protocol_identifier: u32,
    /// The message is abandoned if not acked within this time
    pub lifetime: Option<Duration>,
    pub unordered: bool,
    /// Preferred destination; the primary path when `None`
    pub destination: Option<PathId>,
}

/// A chunk waiting in the outbound queue until the next `poll_transmit`
#[derive(Debug)]
struct Outgoing {
    remote: SocketAddr,
    verification_tag: u32,
    chunk: Chunk,
}

/// One SCTP association
#[derive(Debug)]
pub struct Association {
    side: Side,
    state: AssociationState,
    name: String,
    config: Arc<TransportConfig>,
    authenticator: Authenticator,

    my_verification_tag: u32,
    peer_verification_tag: u32,
    local_tie_tag: u32,
    peer_tie_tag: u32,
    my_initial_tsn: u32,
    num_outbound_streams: u16,
    num_inbound_streams: u16,
    use_forward_tsn: bool,
    /// A shutdown waits for every outstanding chunk to be acked
    shutdown_requested: bool,

    // handshake and shutdown retransmission
    stored_init: Option<ChunkInit>,
    stored_cookie: Option<Bytes>,
    control_rto: u64,
    control_retrans: usize,

    timers: TimerTable,
    paths: PathManager,
    flow: FlowControl,
    reliable: ReliableTransfer,
    receive: ReceiveState,
    stats: AssociationStats,

    outgoing: VecDeque<Outgoing>,
    events: VecDeque<Event>,
    endpoint_events: VecDeque<EndpointEventInner>,
}

impl fmt::Display for Association {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.name, self.state)
    }
}

impl Association {
    pub(crate) fn new(
        side: Side,
        config: Arc<TransportConfig>,
        authenticator: Authenticator,
        my_verification_tag: u32,
        destinations: &[SocketAddr],
    ) -> Self {
        let my_initial_tsn = rand::random::<u32>();
        let paths = PathManager::new(destinations, 0, &config);
        let flow = FlowControl::new(
            paths.len(),
            config.mtu(),
            config.max_receive_buffer_size(),
            my_initial_tsn,
            0,
            config.max_send_queue_len(),
        );
        let control_rto = config.rto_initial();

        Association {
            side,
            state: AssociationState::Closed,
            name: format!("{side}:{my_verification_tag:08x}"),
            authenticator,

            my_verification_tag,
            peer_verification_tag: 0,
            local_tie_tag: 0,
            peer_tie_tag: 0,
            my_initial_tsn,
            num_outbound_streams: 0,
            num_inbound_streams: 0,
            use_forward_tsn: false,
            shutdown_requested: false,

            stored_init: None,
            stored_cookie: None,
            control_rto,
            control_retrans: 0,

            timers: TimerTable::new(),
            paths,
            flow,
            reliable: ReliableTransfer::new(my_initial_tsn, false),
            receive: ReceiveState::new(0, 0, config.max_receive_buffer_size()),
            stats: AssociationStats::default(),

            outgoing: VecDeque::new(),
            events: VecDeque::new(),
            endpoint_events: VecDeque::new(),
            config,
        }
    }

    /// Sets up the data transfer components once the peer parameters are known
    fn init_transfer(
        &mut self,
        peer_initial_tsn: u32,
        peer_rwnd: u32,
        num_outbound_streams: u16,
        num_inbound_streams: u16,
    ) {
        self.num_outbound_streams = num_outbound_streams;
        self.num_inbound_streams = num_inbound_streams;
        self.flow = FlowControl::new(
            self.paths.len(),
            self.config.mtu(),
            peer_rwnd,
            self.my_initial_tsn,
            num_outbound_streams,
            self.config.max_send_queue_len(),
        );
        self.reliable = ReliableTransfer::new(self.my_initial_tsn, self.use_forward_tsn);
        self.receive = ReceiveState::new(
            peer_initial_tsn,
            num_inbound_streams,
            self.config.max_receive_buffer_size(),
        );
    }

    fn set_state(&mut self, new_state: AssociationState) {
        if self.state != new_state {
            debug!(
                "[{}] state change: '{}' => '{}'",
                self.name, self.state, new_state
            );
        }
        self.state = new_state;
    }

    /// Which side opened the association
    pub fn side(&self) -> Side {
        self.side
    }

    pub fn state(&self) -> AssociationState {
        self.state
    }

    pub fn stats(&self) -> AssociationStats {
        self.stats
    }

    /// Local verification tag, carried by every packet the peer sends us
    pub fn my_verification_tag(&self) -> u32 {
        self.my_verification_tag
    }

    pub fn peer_verification_tag(&self) -> u32 {
        self.peer_verification_tag
    }

    pub fn num_outbound_streams(&self) -> u16 {
        self.num_outbound_streams
    }

    pub fn num_inbound_streams(&self) -> u16 {
        self.num_inbound_streams
    }

    pub fn use_forward_tsn(&self) -> bool {
        self.use_forward_tsn
    }

    pub fn primary_path(&self) -> PathId {
        self.paths.primary()
    }

    pub fn num_paths(&self) -> usize {
        self.paths.len()
    }

    pub fn path_addr(&self, path: PathId) -> Option<SocketAddr> {
        self.paths.contains(path).then(|| self.paths.addr(path))
    }

    pub fn path_state(&self, path: PathId) -> Option<PathState> {
        self.paths.contains(path).then(|| self.paths.state(path))
    }

    /// Transport addresses of the peer still in use
    pub fn remote_addrs(&self) -> Vec<SocketAddr> {
        self.paths.addrs().collect()
    }

    pub fn find_path(&self, addr: SocketAddr) -> Option<PathId> {
        self.paths.find(addr)
    }

    /// Current retransmission timeout of a destination in msec
    pub fn rto(&self, path: PathId) -> Option<u64> {
        self.paths.contains(path).then(|| self.paths.rto(path))
    }

    pub fn cwnd(&self, path: PathId) -> Option<u32> {
        self.flow.cparams.get(path.0).map(|cp| cp.cwnd)
    }

    pub fn ssthresh(&self, path: PathId) -> Option<u32> {
        self.flow.cparams.get(path.0).map(|cp| cp.ssthresh)
    }

    /// Receiver window the peer has left for new data
    pub fn peer_rwnd(&self) -> u32 {
        self.flow.peer_rwnd
    }

    /// Bytes queued or in flight, not yet acked
    pub fn buffered_amount(&self) -> usize {
        let queued: usize = self.flow.send_queue.iter().map(|c| c.len()).sum();
        queued + self.reliable.outstanding_bytes() as usize
    }

    /// Number of messages waiting to be sent for the first time
    pub fn send_queue_len(&self) -> usize {
        self.flow.send_queue.len()
    }

    /// The association reached CLOSED and will never produce anything again
    pub fn is_closed(&self) -> bool {
        self.state == AssociationState::Closed
    }

    /// Returns the next ULP notification
    pub fn poll(&mut self) -> Option<Event> {
        while let Some((path, state)) = self.paths.poll_status_change() {
            self.events
                .push_back(Event::NetworkStatusChange { path, state });
        }
        self.events.pop_front()
    }

    /// Returns endpoint-facing events
    pub fn poll_endpoint_event(&mut self) -> Option<EndpointEvent> {
        self.endpoint_events.pop_front().map(EndpointEvent)
    }

    /// Returns the next instant at which `handle_timeout` has work to do
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.timers.next_timeout()
    }

    /// Process AssociationEvents emitted from the associated Endpoint
    pub fn handle_event(&mut self, event: AssociationEvent) {
        match event.0 {
            AssociationEventInner::Datagram(transmit) => {
                self.handle_packet(transmit.now, transmit.remote, transmit.payload);
            }
        }
    }

    /// Process timer expirations
    ///
    /// Executes protocol logic, potentially preparing signals (including application
    /// `Event`s, `EndpointEvent`s and outgoing datagrams) that should be extracted
    /// through the relevant methods.
    pub fn handle_timeout(&mut self, now: Instant) {
        for timer in self.timers.due(now) {
            if self.state == AssociationState::Closed {
                break;
            }
            // an earlier handler may have stopped or restarted it
            if !self.timers.expire(timer, now) {
                continue;
            }
            trace!("[{}] {:?} timeout", self.name, timer);
            match timer {
                Timer::T1Init => self.on_t1_init_timeout(now),
                Timer::T1Cookie => self.on_t1_cookie_timeout(now),
                Timer::T2Shutdown => self.on_t2_shutdown_timeout(now),
                Timer::Ack => {
                    self.stats.inc_ack_timeouts();
                    self.receive.ack_state = AckState::Immediate;
                }
                Timer::T3Rtx(path) => self.on_t3_timeout(path, now),
                Timer::Heartbeat(path) => self.on_heartbeat_timeout(path, now),
            }
        }
    }

    /// Returns the next packet to put on the wire
    ///
    /// Chunks for the same destination are bundled in the order they were generated
    /// as long as the packet stays within the MTU. A pending SACK goes first.
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Transmit> {
        if self.receive.ack_state == AckState::Immediate
            && self.state != AssociationState::Closed
        {
            self.timers.stop(Timer::Ack);
            trace!("[{}] SACK {}", self.name, self.receive.gap_ack_blocks_string());
            let sack = self.receive.create_selective_ack();
            let path = self.sack_destination();
            trace!(
                "[{}] SACK rwnd={} dups={} to path {}",
                self.name,
                sack.advertised_receiver_window_credit,
                sack.duplicate_tsn.len(),
                path
            );
            self.stats.inc_sacks_sent();
            self.outgoing.push_front(Outgoing {
                remote: self.paths.addr(path),
                verification_tag: self.peer_verification_tag,
                chunk: Chunk::SelectiveAck(sack),
            });
        }

        let first = self.outgoing.pop_front()?;
        let remote = first.remote;
        let verification_tag = first.verification_tag;
        let alone = first.chunk.must_be_alone();
        let mut size = COMMON_HEADER_SIZE as usize + first.chunk.length();
        let mut chunks = vec![first.chunk];

        if !alone {
            let mtu = self.config.mtu() as usize;
            let mut i = 0;
            while i < self.outgoing.len() {
                let o = &self.outgoing[i];
                if o.remote != remote || o.verification_tag != verification_tag {
                    i += 1;
                    continue;
                }
                if o.chunk.must_be_alone() || size + o.chunk.length() > mtu {
                    break;
                }
                size += o.chunk.length();
                if let Some(o) = self.outgoing.remove(i) {
                    chunks.push(o.chunk);
                }
            }
        }

        trace!(
            "[{}] sending {} chunks ({} bytes) to {}",
            self.name,
            chunks.len(),
            size,
            remote
        );
        Some(Transmit {
            now,
            remote,
            payload: Packet {
                verification_tag,
                chunks,
            },
        })
    }

    fn sack_destination(&self) -> PathId {
        match self.receive.last_data_path {
            Some(path)
                if self.paths.contains(path) && self.paths.state(path) != PathState::Removed =>
            {
                path
            }
            _ => self.paths.primary(),
        }
    }

    fn queue_chunk(&mut self, path: PathId, chunk: Chunk) {
        let remote = self.paths.addr(path);
        let verification_tag = self.peer_verification_tag;
        self.queue_chunk_to(remote, verification_tag, chunk);
    }

    fn queue_chunk_to(&mut self, remote: SocketAddr, verification_tag: u32, chunk: Chunk) {
        self.outgoing.push_back(Outgoing {
            remote,
            verification_tag,
            chunk,
        });
    }

    /// Sends data on a stream
    ///
    /// Ordered messages get their SSN here; the TSN is assigned when the message is
    /// first put on the wire.
    pub fn send(
        &mut self,
        now: Instant,
        stream_identifier: u16,
        payload: Bytes,
        options: SendOptions,
    ) -> Result<()> {
        match self.state {
            AssociationState::Established => {}
            AssociationState::Closed => return Err(Error::ErrAssociationClosed),
            AssociationState::CookieWait | AssociationState::CookieEchoed => {
                return Err(Error::ErrAssociationNotEstablished)
            }
            _ => return Err(Error::ErrShutdownInProgress),
        }

        if payload.is_empty() {
            return Err(Error::ErrNoUserData);
        }
        let max = self.config.max_payload_size();
        if payload.len() > max {
            return Err(Error::ErrPayloadTooLarge {
                size: payload.len(),
                max,
            });
        }
        if stream_identifier >= self.num_outbound_streams {
            return Err(Error::ErrInvalidStreamIdentifier(stream_identifier));
        }
        if let Some(path) = options.destination {
            if !self.paths.contains(path) || self.paths.state(path) == PathState::Removed {
                return Err(Error::ErrUnknownPath(path.0));
            }
        }
        if self.flow.is_full() {
            return Err(Error::ErrSendQueueFull);
        }

        let stream_sequence_number = if options.unordered {
            0
        } else {
            self.flow.next_ssn(stream_identifier)
        };
        let data = ChunkPayloadData {
            unordered: options.unordered,
            immediate_sack: false,
            tsn: 0,
            stream_identifier,
            stream_sequence_number,
            payload_protocol_identifier: options.payload_protocol_identifier,
            user_data: payload,
        };
        let expiry = options.lifetime.map(|d| now + d);
        trace!(
            "[{}] queued {} bytes on stream {} ssn={}",
            self.name,
            data.user_data.len(),
            stream_identifier,
            stream_sequence_number
        );
        self.enqueue_data(OutboundChunk::new(data, options.destination, expiry), now);
        Ok(())
    }

    /// Starts a graceful shutdown once every queued message is acked
    pub fn shutdown(&mut self, now: Instant) -> Result<()> {
        match self.state {
            AssociationState::Closed => Err(Error::ErrAssociationClosed),
            AssociationState::CookieWait | AssociationState::CookieEchoed => {
                self.abort(Bytes::new())
            }
            AssociationState::Established => {
                self.disable_all_heartbeats();
                if self.flow.is_empty() && self.reliable.queue.is_empty() {
                    self.send_shutdown(now);
                    self.set_state(AssociationState::ShutdownSent);
                } else {
                    self.shutdown_requested = true;
                    self.set_state(AssociationState::ShutdownPending);
                }
                Ok(())
            }
            _ => {
                debug!("[{}] shutdown already in progress", self.name);
                Ok(())
            }
        }
    }

    /// Sends ABORT with a user reason and tears the association down
    pub fn abort(&mut self, reason: Bytes) -> Result<()> {
        if self.state == AssociationState::Closed {
            return Err(Error::ErrAssociationClosed);
        }

        // no DATA may be bundled with the ABORT
        self.outgoing.clear();
        if self.peer_verification_tag != 0 {
            let cause = ErrorCause {
                code: USER_INITIATED_ABORT,
                raw: reason,
            };
            self.queue_chunk(
                self.paths.primary(),
                Chunk::Abort(ChunkAbort {
                    tag_reflected: false,
                    error_causes: vec![cause],
                }),
            );
        }
        self.lost(CommunicationLostReason::Aborted);
        Ok(())
    }

    pub fn set_primary_path(&mut self, path: PathId) -> Result<()> {
        if !self.paths.contains(path) {
            return Err(Error::ErrUnknownPath(path.0));
        }
        if !self.paths.set_primary(path) {
            return Err(Error::ErrPathNotActive(path.0));
        }
        Ok(())
    }

    /// Turns heartbeats on for a destination, optionally changing the interval of
    /// every destination.
    pub fn enable_heartbeat(
        &mut self,
        path: PathId,
        interval: Option<Duration>,
        now: Instant,
    ) -> Result<()> {
        self.check_path(path)?;
        let delay = self
            .paths
            .enable_heartbeat(path, interval.map(|d| d.as_millis() as u64));
        self.timers.start(Timer::Heartbeat(path), now, delay);
        Ok(())
    }

    pub fn disable_heartbeat(&mut self, path: PathId) -> Result<()> {
        self.check_path(path)?;
        self.paths.disable_heartbeat(path);
        self.timers.stop(Timer::Heartbeat(path));
        Ok(())
    }

    fn disable_all_heartbeats(&mut self) {
        self.paths.disable_all_heartbeats();
        for path in self.paths.ids().collect::<Vec<_>>() {
            self.timers.stop(Timer::Heartbeat(path));
        }
    }

    fn check_path(&self, path: PathId) -> Result<()> {
        if !self.paths.contains(path) || self.paths.state(path) == PathState::Removed {
            return Err(Error::ErrUnknownPath(path.0));
        }
        Ok(())
    }

    /// Adds a destination address of the peer. It is probed with a heartbeat
    /// before it carries data.
    pub fn add_path(&mut self, addr: SocketAddr, now: Instant) -> Result<PathId> {
        if self.state == AssociationState::Closed {
            return Err(Error::ErrAssociationClosed);
        }
        if self.paths.find(addr).is_some() {
            return Err(Error::ErrDuplicateDestination(addr));
        }

        let path = self.paths.add(addr, &self.config);
        self.flow.add_path(self.config.mtu());
        self.endpoint_events
            .push_back(EndpointEventInner::PathAdded(addr));
        if !self.state.is_handshaking() {
            self.timers.start(Timer::Heartbeat(path), now, 1);
        }
        debug!("[{}] added path {} {}", self.name, path, addr);
        Ok(path)
    }

    /// Removes a destination. What was in flight towards it is retransmitted elsewhere.
    pub fn remove_path(&mut self, path: PathId, now: Instant) -> Result<()> {
        self.check_path(path)?;
        if path == self.paths.primary() {
            return Err(Error::ErrRemovePrimaryPath);
        }

        let addr = self.paths.addr(path);
        self.paths.remove(path);
        self.timers.stop_path(path);
        self.endpoint_events
            .push_back(EndpointEventInner::PathRemoved(addr));
        debug!("[{}] removed path {} {}", self.name, path, addr);
        self.requeue_path(path, now);
        Ok(())
    }

    fn handle_packet(&mut self, now: Instant, remote: SocketAddr, packet: Packet) {
        if self.state == AssociationState::Closed {
            trace!("[{}] packet from {} after close", self.name, remote);
            return;
        }
        if let Err(err) = packet.check_packet() {
            warn!("[{}] discarding packet from {}: {}", self.name, remote, err);
            return;
        }
        if !self.verification_tag_ok(&packet) {
            debug!(
                "[{}] discarding packet with verification tag {:08x}",
                self.name, packet.verification_tag
            );
            return;
        }

        let path = match self.paths.find(remote) {
            Some(path) => path,
            None => match packet.first_chunk() {
                Some(Chunk::InitAck(_)) if self.state == AssociationState::CookieWait => {
                    self.paths.learn(remote, &self.config)
                }
                _ => {
                    debug!("[{}] packet from unknown address {}", self.name, remote);
                    return;
                }
            },
        };

        let verification_tag = packet.verification_tag;
        self.receive.begin_packet();
        for chunk in packet.chunks {
            if let Err(err) = self.handle_chunk(now, remote, path, verification_tag, chunk) {
                debug!("[{}] rest of packet discarded: {}", self.name, err);
                break;
            }
            if self.state == AssociationState::Closed {
                return;
            }
        }

        match self.receive.end_packet() {
            AckState::Immediate => self.timers.stop(Timer::Ack),
            AckState::Delay => {
                if !self.timers.is_running(Timer::Ack) {
                    self.timers
                        .start(Timer::Ack, now, self.config.ack_interval());
                }
            }
            AckState::Idle => {}
        }
    }

    fn verification_tag_ok(&self, packet: &Packet) -> bool {
        let vtag = packet.verification_tag;
        match packet.first_chunk() {
            // checked against the cookie
            Some(Chunk::Init(_)) | Some(Chunk::CookieEcho(_)) => true,
            Some(Chunk::Abort(c)) if c.tag_reflected => vtag == self.peer_verification_tag,
            Some(Chunk::ShutdownComplete(c)) if c.tag_reflected => {
                vtag == self.peer_verification_tag
            }
            Some(Chunk::ShutdownAck) if self.state.is_handshaking() => true,
            _ => vtag == self.my_verification_tag,
        }
    }

    fn handle_chunk(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        path: PathId,
        verification_tag: u32,
        chunk: Chunk,
    ) -> Result<()> {
        trace!(
            "[{}] received {} in state '{}'",
            self.name,
            chunk.chunk_type(),
            self.state
        );
        match chunk {
            Chunk::Init(c) => self.handle_init(now, remote, c),
            Chunk::InitAck(c) => self.handle_init_ack(now, path, c),
            Chunk::CookieEcho(c) => self.handle_cookie_echo(now, path, c),
            Chunk::CookieAck => self.handle_cookie_ack(now),
            Chunk::PayloadData(c) => self.handle_data(path, c),
            Chunk::SelectiveAck(c) => self.handle_sack(now, path, c),
            Chunk::ForwardTsn(c) => self.handle_forward_tsn(path, c),
            Chunk::Heartbeat(c) => self.handle_heartbeat(path, c),
            Chunk::HeartbeatAck(c) => self.handle_heartbeat_ack(now, c),
            Chunk::Shutdown(c) => self.handle_shutdown(now, path, c.cumulative_tsn_ack),
            Chunk::ShutdownAck => self.handle_shutdown_ack(remote, verification_tag),
            Chunk::ShutdownComplete(_) => self.handle_shutdown_complete(),
            Chunk::Abort(c) => self.handle_abort(c),
            Chunk::Error(c) => self.handle_error(now, c),
            Chunk::Unknown { typ, flags } => self.handle_unrecognized(path, typ, flags),
        }
    }

    fn handle_data(&mut self, path: PathId, d: ChunkPayloadData) -> Result<()> {
        match self.state {
            AssociationState::Established
            | AssociationState::ShutdownPending
            | AssociationState::ShutdownSent => {}
            _ => {
                debug!(
                    "[{}] DATA tsn={} discarded in state '{}'",
                    self.name, d.tsn, self.state
                );
                return Ok(());
            }
        }

        if d.user_data.is_empty() {
            warn!("[{}] DATA tsn={} without user data", self.name, d.tsn);
            self.queue_chunk(
                path,
                Chunk::Abort(ChunkAbort {
                    tag_reflected: false,
                    error_causes: vec![ErrorCause::new(NO_USER_DATA)],
                }),
            );
            self.lost(CommunicationLostReason::InvalidParameter);
            return Ok(());
        }

        self.stats.inc_datas_received();
        let stream_identifier = d.stream_identifier;
        match self.receive.handle_data(d, path) {
            DataOutcome::Accepted(ready) => self.deliver(ready),
            DataOutcome::InvalidStream => {
                debug!(
                    "[{}] DATA for invalid stream {}",
                    self.name, stream_identifier
                );
                self.queue_chunk(
                    path,
                    Chunk::Error(ChunkError {
                        error_causes: vec![ErrorCause::invalid_stream_identifier(
                            stream_identifier,
                        )],
                    }),
                );
            }
            DataOutcome::Duplicate | DataOutcome::Overflow => {}
        }
        Ok(())
    }

    fn deliver(&mut self, ready: Vec<ChunkPayloadData>) {
        for c in ready {
            self.events.push_back(Event::DataArrive {
                stream_identifier: c.stream_identifier,
                stream_sequence_number: c.stream_sequence_number,
                unordered: c.unordered,
                payload_protocol_identifier: c.payload_protocol_identifier,
                data: c.user_data,
            });
        }
    }

    fn handle_sack(&mut self, now: Instant, path: PathId, c: ChunkSelectiveAck) -> Result<()> {
        if self.state.is_handshaking() {
            debug!("[{}] SACK discarded in state '{}'", self.name, self.state);
            return Ok(());
        }
        self.stats.inc_sacks_received();

        let Some(mut outcome) = self.reliable.process_sack(&c, path, now) else {
            return Ok(());
        };
        let rtt = outcome
            .rtt_sent
            .map(|sent| now.saturating_duration_since(sent).as_millis() as u64);
        if outcome.newly_acked_bytes > 0 || rtt.is_some() {
            self.paths.chunks_acked(path, rtt, now);
        }
        self.report_abandoned();

        let arwnd = c.advertised_receiver_window_credit;
        if outcome.retransmit.is_empty() {
            self.sack_info(path, arwnd, &outcome, now);
        } else {
            self.fast_retransmission(path, arwnd, &outcome, now);
        }

        if let Some(fwd) = outcome.forward_tsn.take() {
            self.stats.inc_forward_tsns();
            self.queue_chunk(path, Chunk::ForwardTsn(fwd));
        }

        self.check_all_chunks_acked(now);
        Ok(())
    }

    fn handle_forward_tsn(&mut self, path: PathId, c: ChunkForwardTsn) -> Result<()> {
        if !self.use_forward_tsn {
            return self.handle_unrecognized(path, CT_FORWARD_TSN, 0);
        }
        if self.state.is_handshaking() {
            return Ok(());
        }

        trace!(
            "[{}] FORWARD TSN new cumulative tsn {}",
            self.name,
            c.new_cumulative_tsn
        );
        let ready = self.receive.handle_forward_tsn(&c);
        self.deliver(ready);
        Ok(())
    }

    fn report_abandoned(&mut self) {
        for c in self.reliable.take_abandoned() {
            self.events.push_back(Event::SendFailure {
                stream_identifier: c.data.stream_identifier,
                data: c.data.user_data,
                reason: SendFailureReason::Abandoned,
            });
        }
    }

    /// Drops every queued and in-flight message, reporting each to the ULP
    fn flush_queues(&mut self) {
        let unsent: Vec<OutboundChunk> = self.flow.send_queue.drain(..).collect();
        self.flow.retransmit_queue.clear();
        for c in unsent {
            self.events.push_back(Event::SendFailure {
                stream_identifier: c.data.stream_identifier,
                data: c.data.user_data,
                reason: SendFailureReason::Unsent,
            });
        }
        for c in self.reliable.queue.drain() {
            if c.acked || c.dropped {
                continue;
            }
            self.events.push_back(Event::SendFailure {
                stream_identifier: c.data.stream_identifier,
                data: c.data.user_data,
                reason: SendFailureReason::Unacknowledged,
            });
        }
    }

    /// The association is gone; tell the ULP why
    fn lost(&mut self, reason: CommunicationLostReason) {
        debug!("[{}] communication lost: {:?}", self.name, reason);
        self.teardown();
        self.events
            .push_back(Event::CommunicationLost { reason });
    }

    fn teardown(&mut self) {
        self.timers.stop_all();
        self.flush_queues();
        self.stored_init = None;
        self.stored_cookie = None;
        self.shutdown_requested = false;
        self.set_state(AssociationState::Closed);
        self.endpoint_events.push_back(EndpointEventInner::Drained);
    }
}
