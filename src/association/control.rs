use super::{Association, AssociationState, CommunicationLostReason, Event};
use super::reliable_transfer::SackOutcome;
use super::timer::Timer;
use crate::chunk::chunk_abort::{ChunkAbort, ChunkError};
use crate::chunk::chunk_cookie_echo::ChunkCookieEcho;
use crate::chunk::chunk_heartbeat::ChunkHeartbeat;
use crate::chunk::chunk_init::ChunkInit;
use crate::chunk::chunk_shutdown::{ChunkShutdown, ChunkShutdownComplete};
use crate::chunk::chunk_type::{ChunkType, UnrecognizedAction};
use crate::chunk::Chunk;
use crate::config::TransportConfig;
use crate::cookie::{Authenticator, StateCookie};
use crate::error::{Error, Result};
use crate::error_cause::*;
use crate::path::PathId;
use crate::shared::EndpointEventInner;
use crate::util::generate_verification_tag;
use crate::Side;

use bytes::Bytes;
use log::{debug, trace, warn};
use std::cmp::min;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

/// Builds the INIT ACK answering `init`, with the TCB packed into a signed state
/// cookie (RFC 4960 sec 5.1.3). Used both statelessly by the endpoint and by an
/// association answering a colliding INIT.
pub(crate) fn build_init_ack(
    config: &TransportConfig,
    authenticator: &Authenticator,
    init: &ChunkInit,
    local_tag: u32,
    local_initial_tsn: u32,
    tie_tags: (u32, u32),
    now: Instant,
) -> ChunkInit {
    let num_outbound_streams = min(config.max_num_outbound_streams(), init.num_inbound_streams);
    let num_inbound_streams = min(config.max_num_inbound_streams(), init.num_outbound_streams);
    let forward_tsn = config.forward_tsn_supported() && init.forward_tsn_supported;

    let cookie = StateCookie {
        local_tag,
        peer_tag: init.initiate_tag,
        local_initial_tsn,
        peer_initial_tsn: init.initial_tsn,
        num_outbound_streams,
        num_inbound_streams,
        peer_receiver_window: init.advertised_receiver_window_credit,
        local_tie_tag: tie_tags.0,
        peer_tie_tag: tie_tags.1,
        created: authenticator.now_ms(now),
        lifetime: config.valid_cookie_life() + init.cookie_preservative.unwrap_or(0) as u64,
        forward_tsn,
        peer_addresses: init.addresses.clone(),
    };

    ChunkInit {
        initiate_tag: local_tag,
        advertised_receiver_window_credit: config.max_receive_buffer_size(),
        num_outbound_streams,
        num_inbound_streams,
        initial_tsn: local_initial_tsn,
        addresses: vec![],
        cookie_preservative: None,
        state_cookie: Some(authenticator.seal(&cookie)),
        forward_tsn_supported: config.forward_tsn_supported(),
    }
}

impl Association {
    /// Creates the server side of an association from a valid COOKIE ECHO and
    /// answers it with COOKIE ACK.
    pub(crate) fn accept(
        config: Arc<TransportConfig>,
        authenticator: Authenticator,
        cookie: &StateCookie,
        remote: SocketAddr,
        now: Instant,
    ) -> Self {
        let mut assoc = Association::new(
            Side::Server,
            config,
            authenticator,
            cookie.local_tag,
            &[remote],
        );
        assoc.peer_verification_tag = cookie.peer_tag;
        assoc.my_initial_tsn = cookie.local_initial_tsn;
        assoc.use_forward_tsn = cookie.forward_tsn;
        assoc.learn_addresses(remote, &cookie.peer_addresses);
        assoc.init_transfer(
            cookie.peer_initial_tsn,
            cookie.peer_receiver_window,
            cookie.num_outbound_streams,
            cookie.num_inbound_streams,
        );
        assoc.establish(now);
        assoc.queue_chunk(PathId(0), Chunk::CookieAck);
        assoc
    }

    /// Starts the four-way handshake: sends INIT and starts T1-init
    pub(crate) fn associate(&mut self, now: Instant) {
        self.control_retrans = 0;
        self.control_rto = self.paths.rto(self.paths.primary());
        let init = self.make_init(None);
        self.send_init(init, now);
        self.set_state(AssociationState::CookieWait);
    }

    fn make_init(&self, cookie_preservative: Option<u32>) -> ChunkInit {
        ChunkInit {
            initiate_tag: self.my_verification_tag,
            advertised_receiver_window_credit: self.config.max_receive_buffer_size(),
            num_outbound_streams: self.config.max_num_outbound_streams(),
            num_inbound_streams: self.config.max_num_inbound_streams(),
            initial_tsn: self.my_initial_tsn,
            addresses: vec![],
            cookie_preservative,
            state_cookie: None,
            forward_tsn_supported: self.config.forward_tsn_supported(),
        }
    }

    fn send_init(&mut self, init: ChunkInit, now: Instant) {
        let primary = self.paths.addr(self.paths.primary());
        trace!("[{}] sending INIT to {}", self.name, primary);
        self.queue_chunk_to(primary, 0, Chunk::Init(init.clone()));
        self.stored_init = Some(init);
        self.timers.start(Timer::T1Init, now, self.control_rto);
    }

    fn send_cookie_echo(&mut self, cookie: Bytes, now: Instant) {
        let primary = self.paths.primary();
        trace!("[{}] sending COOKIE-ECHO on path {}", self.name, primary);
        self.queue_chunk(
            primary,
            Chunk::CookieEcho(ChunkCookieEcho {
                cookie: cookie.clone(),
            }),
        );
        self.stored_cookie = Some(cookie);
        self.timers.start(Timer::T1Cookie, now, self.control_rto);
    }

    pub(super) fn send_shutdown(&mut self, now: Instant) {
        let primary = self.paths.primary();
        let cumulative_tsn_ack = self.receive.cumulative_tsn();
        trace!("[{}] sending SHUTDOWN cumTSN={}", self.name, cumulative_tsn_ack);
        self.queue_chunk(primary, Chunk::Shutdown(ChunkShutdown { cumulative_tsn_ack }));
        self.receive.send_sack_everytime();
        self.control_retrans = 0;
        self.control_rto = self.paths.rto(primary);
        self.timers.start(Timer::T2Shutdown, now, self.control_rto);
    }

    fn send_shutdown_ack(&mut self, now: Instant) {
        let primary = self.paths.primary();
        self.queue_chunk(primary, Chunk::ShutdownAck);
        self.control_retrans = 0;
        self.control_rto = self.paths.rto(primary);
        self.timers.start(Timer::T2Shutdown, now, self.control_rto);
    }

    /// Backs off the INIT/COOKIE/SHUTDOWN retransmission timer. Returns false once
    /// `limit` retransmissions are used up.
    fn backoff_control_timer(&mut self, limit: usize) -> bool {
        self.control_retrans += 1;
        if self.control_retrans > limit {
            return false;
        }
        self.control_rto = min(self.control_rto.saturating_mul(2), self.config.rto_max());
        true
    }

    pub(super) fn on_t1_init_timeout(&mut self, now: Instant) {
        if self.state != AssociationState::CookieWait {
            return;
        }
        if !self.backoff_control_timer(self.config.max_init_retransmissions()) {
            debug!("[{}] INIT retransmissions exhausted", self.name);
            self.lost(CommunicationLostReason::ExceededRetransmissions);
            return;
        }
        if let Some(init) = self.stored_init.clone() {
            debug!(
                "[{}] retransmitting INIT ({}), rto={}",
                self.name, self.control_retrans, self.control_rto
            );
            self.send_init(init, now);
        }
    }

    pub(super) fn on_t1_cookie_timeout(&mut self, now: Instant) {
        if self.state != AssociationState::CookieEchoed {
            return;
        }
        if !self.backoff_control_timer(self.config.max_init_retransmissions()) {
            debug!("[{}] COOKIE-ECHO retransmissions exhausted", self.name);
            self.lost(CommunicationLostReason::ExceededRetransmissions);
            return;
        }
        if let Some(cookie) = self.stored_cookie.clone() {
            debug!(
                "[{}] retransmitting COOKIE-ECHO ({}), rto={}",
                self.name, self.control_retrans, self.control_rto
            );
            self.send_cookie_echo(cookie, now);
        }
    }

    pub(super) fn on_t2_shutdown_timeout(&mut self, now: Instant) {
        if !self.backoff_control_timer(self.config.max_association_retransmissions()) {
            debug!("[{}] shutdown retransmissions exhausted", self.name);
            self.lost(CommunicationLostReason::ExceededRetransmissions);
            return;
        }

        let primary = self.paths.primary();
        match self.state {
            AssociationState::ShutdownSent => {
                let cumulative_tsn_ack = self.receive.cumulative_tsn();
                self.queue_chunk(primary, Chunk::Shutdown(ChunkShutdown { cumulative_tsn_ack }));
            }
            AssociationState::ShutdownAckSent => self.queue_chunk(primary, Chunk::ShutdownAck),
            _ => return,
        }
        debug!(
            "[{}] retransmitting shutdown ({}), rto={}",
            self.name, self.control_retrans, self.control_rto
        );
        self.timers.start(Timer::T2Shutdown, now, self.control_rto);
    }

    pub(super) fn on_heartbeat_timeout(&mut self, path: PathId, now: Instant) {
        if !self.paths.contains(path) || self.state.is_handshaking() {
            return;
        }
        match self.paths.heartbeat_timeout(path) {
            Err(failure) => self.lost(failure.into()),
            Ok(action) => {
                if action.send {
                    let heartbeat_info =
                        self.authenticator
                            .seal_heartbeat(self.my_verification_tag, path.0, now);
                    trace!("[{}] HEARTBEAT on path {}", self.name, path);
                    self.queue_chunk(path, Chunk::Heartbeat(ChunkHeartbeat { heartbeat_info }));
                }
                if let Some(delay) = action.restart {
                    self.timers.start(Timer::Heartbeat(path), now, delay);
                }
            }
        }
    }

    fn learn_addresses(&mut self, remote: SocketAddr, addresses: &[std::net::IpAddr]) {
        for ip in addresses {
            self.paths
                .learn(SocketAddr::new(*ip, remote.port()), &self.config);
        }
    }

    /// Moves to ESTABLISHED and tells the ULP
    fn establish(&mut self, now: Instant) {
        self.set_state(AssociationState::Established);
        self.local_tie_tag = self.my_verification_tag;
        self.peer_tie_tag = self.peer_verification_tag;
        self.control_retrans = 0;
        self.events.push_back(Event::CommunicationUp {
            paths: self.paths.len(),
            inbound_streams: self.num_inbound_streams,
            outbound_streams: self.num_outbound_streams,
        });
        for (path, delay) in self.paths.initial_heartbeat_delays() {
            self.timers.start(Timer::Heartbeat(path), now, delay);
        }
    }

    fn abort_invalid(&mut self, remote: SocketAddr, verification_tag: u32, cause: ErrorCause) {
        self.queue_chunk_to(
            remote,
            verification_tag,
            Chunk::Abort(ChunkAbort {
                tag_reflected: false,
                error_causes: vec![cause],
            }),
        );
        self.lost(CommunicationLostReason::InvalidParameter);
    }

    pub(super) fn handle_init(
        &mut self,
        now: Instant,
        remote: SocketAddr,
        init: ChunkInit,
    ) -> Result<()> {
        if let Err(err) = init.check() {
            warn!("[{}] invalid INIT from {}: {}", self.name, remote, err);
            self.queue_chunk_to(
                remote,
                init.initiate_tag,
                Chunk::Abort(ChunkAbort {
                    tag_reflected: false,
                    error_causes: vec![ErrorCause::new(INVALID_MANDATORY_PARAMETER)],
                }),
            );
            return Ok(());
        }

        let (local_tag, local_tsn, tie_tags) = match self.state {
            AssociationState::Closed => return Ok(()),
            AssociationState::CookieWait => (self.my_verification_tag, self.my_initial_tsn, (0, 0)),
            AssociationState::CookieEchoed => (
                self.my_verification_tag,
                self.my_initial_tsn,
                (self.my_verification_tag, self.peer_verification_tag),
            ),
            AssociationState::ShutdownAckSent => {
                trace!("[{}] INIT in SHUTDOWN-ACK-SENT", self.name);
                self.queue_chunk_to(remote, self.peer_verification_tag, Chunk::ShutdownAck);
                return Ok(());
            }
            _ => (
                generate_verification_tag(&mut rand::thread_rng()),
                rand::random::<u32>(),
                (self.local_tie_tag, self.peer_tie_tag),
            ),
        };

        debug!(
            "[{}] answering INIT in state '{}' with tag {:08x}",
            self.name, self.state, local_tag
        );
        let init_ack = build_init_ack(
            &self.config,
            &self.authenticator,
            &init,
            local_tag,
            local_tsn,
            tie_tags,
            now,
        );
        self.queue_chunk_to(remote, init.initiate_tag, Chunk::InitAck(init_ack));
        Ok(())
    }

    pub(super) fn handle_init_ack(
        &mut self,
        now: Instant,
        path: PathId,
        init_ack: ChunkInit,
    ) -> Result<()> {
        if self.state != AssociationState::CookieWait {
            debug!("[{}] INIT-ACK discarded in state '{}'", self.name, self.state);
            return Ok(());
        }

        let remote = self.paths.addr(path);
        if let Err(err) = init_ack.check() {
            warn!("[{}] invalid INIT-ACK: {}", self.name, err);
            self.abort_invalid(
                remote,
                init_ack.initiate_tag,
                ErrorCause::new(INVALID_MANDATORY_PARAMETER),
            );
            return Ok(());
        }
        let Some(cookie) = init_ack.state_cookie.clone() else {
            warn!("[{}] {}", self.name, Error::ErrInitAckNoCookie);
            self.abort_invalid(
                remote,
                init_ack.initiate_tag,
                ErrorCause::missing_mandatory_parameter(PARAM_STATE_COOKIE),
            );
            return Ok(());
        };

        self.timers.stop(Timer::T1Init);
        self.stored_init = None;
        self.peer_verification_tag = init_ack.initiate_tag;
        self.use_forward_tsn =
            self.config.forward_tsn_supported() && init_ack.forward_tsn_supported;
        self.learn_addresses(remote, &init_ack.addresses);
        let num_outbound_streams = min(
            self.config.max_num_outbound_streams(),
            init_ack.num_inbound_streams,
        );
        let num_inbound_streams = min(
            self.config.max_num_inbound_streams(),
            init_ack.num_outbound_streams,
        );
        self.init_transfer(
            init_ack.initial_tsn,
            init_ack.advertised_receiver_window_credit,
            num_outbound_streams,
            num_inbound_streams,
        );

        self.control_retrans = 0;
        self.control_rto = self.paths.rto(self.paths.primary());
        self.send_cookie_echo(cookie, now);
        self.set_state(AssociationState::CookieEchoed);
        Ok(())
    }

    /// COOKIE ECHO while a TCB exists (RFC 4960 sec 5.2.4)
    pub(super) fn handle_cookie_echo(
        &mut self,
        now: Instant,
        path: PathId,
        c: ChunkCookieEcho,
    ) -> Result<()> {
        let cookie = match self.authenticator.open(&c.cookie) {
            Ok(cookie) => cookie,
            Err(err) => {
                debug!("[{}] COOKIE-ECHO discarded: {}", self.name, err);
                return Ok(());
            }
        };

        let local_match = cookie.local_tag == self.my_verification_tag;
        let peer_match = cookie.peer_tag == self.peer_verification_tag;
        if !(local_match && peer_match) {
            let now_ms = self.authenticator.now_ms(now);
            if let Some(staleness) = cookie.staleness(now_ms) {
                debug!("[{}] stale cookie by {:?}", self.name, staleness);
                let usec = min(staleness.as_micros(), u32::MAX as u128) as u32;
                self.queue_chunk_to(
                    self.paths.addr(path),
                    cookie.peer_tag,
                    Chunk::Error(ChunkError {
                        error_causes: vec![ErrorCause::stale_cookie(usec)],
                    }),
                );
                return Ok(());
            }
        }

        match (local_match, peer_match) {
            // case D, or case B with the peer tag taken from the cookie
            (true, _) => {
                if !peer_match {
                    trace!(
                        "[{}] peer tag {:08x} => {:08x}",
                        self.name,
                        self.peer_verification_tag,
                        cookie.peer_tag
                    );
                    self.peer_verification_tag = cookie.peer_tag;
                }
                if self.state.is_handshaking() {
                    self.timers.stop(Timer::T1Init);
                    self.timers.stop(Timer::T1Cookie);
                    self.stored_init = None;
                    self.stored_cookie = None;
                    self.use_forward_tsn = cookie.forward_tsn;
                    self.learn_addresses(self.paths.addr(path), &cookie.peer_addresses);
                    self.init_transfer(
                        cookie.peer_initial_tsn,
                        cookie.peer_receiver_window,
                        cookie.num_outbound_streams,
                        cookie.num_inbound_streams,
                    );
                    self.establish(now);
                }
                self.queue_chunk(path, Chunk::CookieAck);
            }
            // case C
            (false, true) if cookie.local_tie_tag == 0 && cookie.peer_tie_tag == 0 => {
                debug!("[{}] COOKIE-ECHO of an earlier INIT discarded", self.name);
            }
            // case A
            (false, false)
                if !self.state.is_handshaking()
                    && cookie.local_tie_tag == self.local_tie_tag
                    && cookie.peer_tie_tag == self.peer_tie_tag =>
            {
                self.restart(now, path, &cookie);
            }
            _ => {
                debug!("[{}] COOKIE-ECHO with unrelated tags discarded", self.name);
            }
        }
        Ok(())
    }

    /// The peer restarted: keep the association, replace everything it negotiated
    fn restart(&mut self, now: Instant, path: PathId, cookie: &StateCookie) {
        let remote = self.paths.addr(path);
        if self.state == AssociationState::ShutdownAckSent {
            debug!("[{}] peer restart while shutting down refused", self.name);
            self.queue_chunk_to(remote, cookie.peer_tag, Chunk::ShutdownAck);
            self.queue_chunk_to(
                remote,
                cookie.peer_tag,
                Chunk::Error(ChunkError {
                    error_causes: vec![ErrorCause::new(COOKIE_RECEIVED_WHILE_SHUTTING_DOWN)],
                }),
            );
            return;
        }

        debug!("[{}] peer restarted", self.name);
        self.flush_queues();
        self.timers.stop_all();
        self.outgoing.clear();

        let old_tag = self.my_verification_tag;
        self.my_verification_tag = cookie.local_tag;
        self.peer_verification_tag = cookie.peer_tag;
        self.my_initial_tsn = cookie.local_initial_tsn;
        self.use_forward_tsn = cookie.forward_tsn;
        self.shutdown_requested = false;
        self.init_transfer(
            cookie.peer_initial_tsn,
            cookie.peer_receiver_window,
            cookie.num_outbound_streams,
            cookie.num_inbound_streams,
        );

        self.set_state(AssociationState::Established);
        self.local_tie_tag = self.my_verification_tag;
        self.peer_tie_tag = self.peer_verification_tag;
        self.control_retrans = 0;
        for (path, delay) in self.paths.initial_heartbeat_delays() {
            self.timers.start(Timer::Heartbeat(path), now, delay);
        }
        if old_tag != self.my_verification_tag {
            self.endpoint_events
                .push_back(EndpointEventInner::LocalTagChanged(self.my_verification_tag));
        }
        self.events.push_back(Event::Restart);
        self.queue_chunk(path, Chunk::CookieAck);
    }

    pub(super) fn handle_cookie_ack(&mut self, now: Instant) -> Result<()> {
        if self.state != AssociationState::CookieEchoed {
            trace!("[{}] COOKIE-ACK discarded in state '{}'", self.name, self.state);
            return Ok(());
        }
        self.timers.stop(Timer::T1Cookie);
        self.stored_cookie = None;
        self.establish(now);
        Ok(())
    }

    pub(super) fn handle_heartbeat(&mut self, path: PathId, c: ChunkHeartbeat) -> Result<()> {
        if self.state.is_handshaking() {
            trace!("[{}] HEARTBEAT discarded in state '{}'", self.name, self.state);
            return Ok(());
        }
        self.queue_chunk(path, Chunk::HeartbeatAck(c));
        Ok(())
    }

    pub(super) fn handle_heartbeat_ack(&mut self, now: Instant, c: ChunkHeartbeat) -> Result<()> {
        let (index, sent) = match self
            .authenticator
            .open_heartbeat(self.my_verification_tag, &c.heartbeat_info)
        {
            Ok(info) => info,
            Err(err) => {
                debug!("[{}] HEARTBEAT-ACK discarded: {}", self.name, err);
                return Ok(());
            }
        };
        let path = PathId(index);
        if !self.paths.contains(path) {
            return Ok(());
        }
        if let Some(delay) = self.paths.heartbeat_ack(path, sent, now) {
            self.timers.start(Timer::Heartbeat(path), now, delay);
        }
        Ok(())
    }

    pub(super) fn handle_shutdown(
        &mut self,
        now: Instant,
        path: PathId,
        cumulative_tsn_ack: u32,
    ) -> Result<()> {
        match self.state {
            AssociationState::Established => {
                self.set_state(AssociationState::ShutdownReceived);
                self.shutdown_requested = true;
                self.disable_all_heartbeats();
                self.events.push_back(Event::ShutdownReceived);
                self.shutdown_ctsna(now, path, cumulative_tsn_ack);
            }
            AssociationState::ShutdownReceived | AssociationState::ShutdownAckSent => {
                self.shutdown_ctsna(now, path, cumulative_tsn_ack);
            }
            AssociationState::ShutdownSent => {
                // both sides shut down at once
                self.shutdown_ctsna(now, path, cumulative_tsn_ack);
                self.timers.stop(Timer::T2Shutdown);
                self.events.push_back(Event::ShutdownReceived);
                self.send_shutdown_ack(now);
                self.set_state(AssociationState::ShutdownAckSent);
            }
            _ => {
                debug!("[{}] SHUTDOWN discarded in state '{}'", self.name, self.state);
            }
        }
        Ok(())
    }

    /// The cumulative TSN ack of a SHUTDOWN acts like a SACK without gaps
    fn shutdown_ctsna(&mut self, now: Instant, path: PathId, cumulative_tsn_ack: u32) {
        self.receive.send_sack_everytime();
        let outstanding_at_arrival = self.reliable.outstanding_bytes();
        if let Some(newly_acked_bytes) = self.reliable.shutdown_ctsna(cumulative_tsn_ack) {
            let outcome = SackOutcome {
                cumulative_tsn_ack,
                newly_acked_bytes,
                outstanding_at_arrival,
                all_acked: self.reliable.queue.is_empty(),
                new_acked: newly_acked_bytes > 0,
                ..Default::default()
            };
            let arwnd = self.flow.peer_arwnd;
            self.sack_info(path, arwnd, &outcome, now);
        }
        self.check_all_chunks_acked(now);
    }

    pub(super) fn check_all_chunks_acked(&mut self, now: Instant) {
        if !self.shutdown_requested || !self.flow.is_empty() || !self.reliable.queue.is_empty() {
            return;
        }
        match self.state {
            AssociationState::ShutdownPending => {
                self.shutdown_requested = false;
                self.send_shutdown(now);
                self.set_state(AssociationState::ShutdownSent);
            }
            AssociationState::ShutdownReceived => {
                self.shutdown_requested = false;
                self.send_shutdown_ack(now);
                self.set_state(AssociationState::ShutdownAckSent);
            }
            _ => {}
        }
    }

    pub(super) fn handle_shutdown_ack(
        &mut self,
        remote: SocketAddr,
        verification_tag: u32,
    ) -> Result<()> {
        match self.state {
            AssociationState::CookieWait | AssociationState::CookieEchoed => {
                self.queue_chunk_to(
                    remote,
                    verification_tag,
                    Chunk::ShutdownComplete(ChunkShutdownComplete {
                        tag_reflected: true,
                    }),
                );
            }
            AssociationState::ShutdownSent | AssociationState::ShutdownAckSent => {
                self.timers.stop(Timer::T2Shutdown);
                self.queue_chunk_to(
                    remote,
                    self.peer_verification_tag,
                    Chunk::ShutdownComplete(ChunkShutdownComplete {
                        tag_reflected: false,
                    }),
                );
                self.shutdown_complete();
            }
            _ => {
                debug!("[{}] SHUTDOWN-ACK discarded in state '{}'", self.name, self.state);
            }
        }
        Ok(())
    }

    pub(super) fn handle_shutdown_complete(&mut self) -> Result<()> {
        if self.state != AssociationState::ShutdownAckSent {
            debug!(
                "[{}] SHUTDOWN-COMPLETE discarded in state '{}'",
                self.name, self.state
            );
            return Ok(());
        }
        self.shutdown_complete();
        Ok(())
    }

    fn shutdown_complete(&mut self) {
        debug!("[{}] shutdown complete", self.name);
        self.teardown();
        self.events.push_back(Event::ShutdownComplete);
    }

    pub(super) fn handle_abort(&mut self, c: ChunkAbort) -> Result<()> {
        for cause in &c.error_causes {
            debug!("[{}] ABORT cause: {}", self.name, cause);
        }
        self.lost(CommunicationLostReason::Aborted);
        Ok(())
    }

    pub(super) fn handle_error(&mut self, now: Instant, c: ChunkError) -> Result<()> {
        for cause in c.error_causes {
            if cause.code == STALE_COOKIE_ERROR && self.state == AssociationState::CookieEchoed {
                self.handle_stale_cookie(now, &cause);
                if self.state == AssociationState::Closed {
                    break;
                }
            } else {
                debug!("[{}] ERROR from peer: {}", self.name, cause);
                self.events.push_back(Event::CommunicationError { cause });
            }
        }
        Ok(())
    }

    /// Retries the handshake asking for a longer cookie life (RFC 4960 sec 5.2.6)
    fn handle_stale_cookie(&mut self, now: Instant, cause: &ErrorCause) {
        if !self.backoff_control_timer(self.config.max_init_retransmissions()) {
            debug!("[{}] giving up after stale cookies", self.name);
            self.lost(CommunicationLostReason::ExceededRetransmissions);
            return;
        }

        let staleness_ms = cause.staleness().unwrap_or(0) / 1000;
        let preservative = staleness_ms.saturating_mul(2).max(1);
        debug!(
            "[{}] stale cookie, retrying with preservative {} ms",
            self.name, preservative
        );
        self.timers.stop(Timer::T1Cookie);
        self.stored_cookie = None;
        self.peer_verification_tag = 0;
        let init = self.make_init(Some(preservative));
        self.send_init(init, now);
        self.set_state(AssociationState::CookieWait);
    }

    pub(super) fn handle_unrecognized(
        &mut self,
        path: PathId,
        typ: ChunkType,
        flags: u8,
    ) -> Result<()> {
        let action = typ.unrecognized_action();
        trace!("[{}] unrecognized chunk {}: {:?}", self.name, typ, action);
        if matches!(
            action,
            UnrecognizedAction::StopAndReport | UnrecognizedAction::SkipAndReport
        ) && !self.state.is_handshaking()
        {
            self.queue_chunk(
                path,
                Chunk::Error(ChunkError {
                    error_causes: vec![ErrorCause::unrecognized_chunk_type(typ.0, flags)],
                }),
            );
        }
        match action {
            UnrecognizedAction::Stop | UnrecognizedAction::StopAndReport => {
                Err(Error::ErrChunkTypeUnrecognized(typ.0))
            }
            UnrecognizedAction::Skip | UnrecognizedAction::SkipAndReport => Ok(()),
        }
    }
}
