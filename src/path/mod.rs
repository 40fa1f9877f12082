//! Path management: health of every destination transport address of an association,
//! RTT/RTO estimation and heartbeat bookkeeping (RFC 4960 sec 8.2 - 8.3).
//!
//! The manager never sends anything itself. It answers the association with what to
//! do (send a heartbeat, restart a timer, declare the peer lost) and queues network
//! status changes for the ULP.

pub(crate) mod rto;

use crate::config::TransportConfig;
use rto::RtoManager;

use log::{debug, trace};
use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Number of unconfirmed paths probed right after the association comes up
const INITIAL_PROBES: usize = 4;

/// Index of a destination transport address within its association
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PathId(pub usize);

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reachability state of a destination
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PathState {
    /// Never confirmed by a round trip
    Unconfirmed,
    Active,
    /// Exceeded Path.Max.Retrans consecutive retransmissions
    Inactive,
    /// Reported once when a destination joins an established association
    Added,
    /// The destination left the association and is never used again
    Removed,
}

impl fmt::Display for PathState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            PathState::Unconfirmed => "Unconfirmed",
            PathState::Active => "Active",
            PathState::Inactive => "Inactive",
            PathState::Added => "Added",
            PathState::Removed => "Removed",
        };
        write!(f, "{s}")
    }
}

/// Why the peer is considered unreachable
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PathFailure {
    /// Association.Max.Retrans exceeded
    ExceededRetransmissions,
    /// The last active destination went inactive
    EndpointUnreachable,
}

/// What the association has to do after a heartbeat timer fired
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub(crate) struct HeartbeatAction {
    pub(crate) send: bool,
    /// Delay of the next heartbeat timer in msec, if it must be restarted
    pub(crate) restart: Option<u64>,
}

#[derive(Debug, Clone)]
pub(crate) struct Path {
    pub(crate) addr: SocketAddr,
    pub(crate) state: PathState,
    pub(crate) rto: RtoManager,
    retrans_count: usize,
    heartbeat_enabled: bool,
    heartbeat_sent: bool,
    heartbeat_acked: bool,
    timer_backoff: bool,
    /// Data was sent on the path during the current heartbeat interval
    chunks_sent: bool,
    /// Data was acked on the path during the current heartbeat interval
    chunks_acked: bool,
    /// Next RTT sample is accepted at or after this instant (one per round trip)
    rto_update: Option<Instant>,
}

impl Path {
    fn new(addr: SocketAddr, state: PathState, config: &TransportConfig) -> Self {
        Path {
            addr,
            state,
            rto: RtoManager::new(config.rto_initial(), config.rto_min(), config.rto_max()),
            retrans_count: 0,
            heartbeat_enabled: true,
            heartbeat_sent: false,
            heartbeat_acked: false,
            timer_backoff: false,
            chunks_sent: false,
            chunks_acked: false,
            rto_update: None,
        }
    }

    fn is_usable(&self) -> bool {
        self.state != PathState::Removed
    }
}

#[derive(Debug)]
pub(crate) struct PathManager {
    paths: Vec<Path>,
    primary: PathId,
    peer_retrans_count: usize,
    max_path_retrans: usize,
    max_assoc_retrans: usize,
    heartbeat_interval: u64,
    status_changes: VecDeque<(PathId, PathState)>,
}

impl PathManager {
    /// The primary starts active; every other destination stays unconfirmed until a
    /// round trip over it succeeds.
    pub(crate) fn new(addrs: &[SocketAddr], primary: usize, config: &TransportConfig) -> Self {
        let primary = if primary < addrs.len() { primary } else { 0 };
        let paths = addrs
            .iter()
            .enumerate()
            .map(|(i, addr)| {
                let state = if i == primary {
                    PathState::Active
                } else {
                    PathState::Unconfirmed
                };
                Path::new(*addr, state, config)
            })
            .collect();

        PathManager {
            paths,
            primary: PathId(primary),
            peer_retrans_count: 0,
            max_path_retrans: config.max_path_retransmissions(),
            max_assoc_retrans: config.max_association_retransmissions(),
            heartbeat_interval: config.heartbeat_interval(),
            status_changes: VecDeque::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.paths.len()
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = PathId> + '_ {
        (0..self.paths.len()).map(PathId)
    }

    pub(crate) fn addr(&self, path: PathId) -> SocketAddr {
        self.paths[path.0].addr
    }

    pub(crate) fn addrs(&self) -> impl Iterator<Item = SocketAddr> + '_ {
        self.paths
            .iter()
            .filter(|p| p.is_usable())
            .map(|p| p.addr)
    }

    pub(crate) fn find(&self, addr: SocketAddr) -> Option<PathId> {
        self.paths
            .iter()
            .position(|p| p.addr == addr && p.is_usable())
            .map(PathId)
    }

    pub(crate) fn contains(&self, path: PathId) -> bool {
        path.0 < self.paths.len()
    }

    pub(crate) fn state(&self, path: PathId) -> PathState {
        self.paths[path.0].state
    }

    pub(crate) fn is_active(&self, path: PathId) -> bool {
        self.contains(path) && self.paths[path.0].state == PathState::Active
    }

    pub(crate) fn primary(&self) -> PathId {
        self.primary
    }

    pub(crate) fn rto(&self, path: PathId) -> u64 {
        self.paths[path.0].rto.get_rto()
    }

    pub(crate) fn srtt(&self, path: PathId) -> u64 {
        self.paths[path.0].rto.srtt
    }

    pub(crate) fn poll_status_change(&mut self) -> Option<(PathId, PathState)> {
        self.status_changes.pop_front()
    }

    /// Round-robin successor of `from` among active destinations, `from` itself last
    pub(crate) fn next_active(&self, from: PathId) -> Option<PathId> {
        let n = self.paths.len();
        (1..=n)
            .map(|i| PathId((from.0 + i) % n))
            .find(|&p| self.paths[p.0].state == PathState::Active)
    }

    /// First active destination, in address order
    pub(crate) fn first_active(&self) -> Option<PathId> {
        self.paths
            .iter()
            .position(|p| p.state == PathState::Active)
            .map(PathId)
    }

    pub(crate) fn set_primary(&mut self, path: PathId) -> bool {
        if !self.is_active(path) {
            return false;
        }
        debug!("primary path {} -> {}", self.primary, path);
        self.primary = path;
        true
    }

    pub(crate) fn chunks_sent_on(&mut self, path: PathId) {
        self.paths[path.0].chunks_sent = true;
    }

    /// A retransmission timeout happened on `path`, for data or for a heartbeat.
    ///
    /// Returns the failure when the association has to be torn down.
    pub(crate) fn chunks_retransmitted(&mut self, path: PathId) -> Option<PathFailure> {
        let p = &mut self.paths[path.0];
        match p.state {
            PathState::Unconfirmed => p.retrans_count += 1,
            PathState::Active => {
                p.retrans_count += 1;
                self.peer_retrans_count += 1;
            }
            _ => {
                trace!("retransmission on {} path {} ignored", p.state, path);
                return None;
            }
        }
        trace!(
            "path {} retrans={} peer retrans={}",
            path,
            p.retrans_count,
            self.peer_retrans_count
        );

        if self.peer_retrans_count >= self.max_assoc_retrans {
            debug!("peer exceeded {} retransmissions", self.max_assoc_retrans);
            return Some(PathFailure::ExceededRetransmissions);
        }

        if p.retrans_count >= self.max_path_retrans {
            p.state = PathState::Inactive;
            debug!("path {} to Inactive", path);

            if self.first_active().is_none() {
                return Some(PathFailure::EndpointUnreachable);
            }
            if path == self.primary {
                if let Some(next) = self.first_active() {
                    debug!("primary path {} failed, {} takes over", path, next);
                    self.primary = next;
                }
            }
            self.status_changes.push_back((path, PathState::Inactive));
        }

        None
    }

    /// Data sent on `path` was acknowledged. `rtt` is the measured round trip in
    /// msec, if the acked chunk qualified for a measurement.
    pub(crate) fn chunks_acked(&mut self, path: PathId, rtt: Option<u64>, now: Instant) {
        let p = &mut self.paths[path.0];
        if p.state != PathState::Active {
            // stale acknowledgement
            return;
        }

        let mut rtt = rtt.map(|r| r.min(p.rto.rto_max()));
        if p.rto_update.map_or(false, |t| now < t) {
            rtt = None;
        }

        self.handle_chunks_acked(path, rtt);
        let p = &mut self.paths[path.0];
        if rtt.is_some() {
            p.rto_update = Some(now + Duration::from_millis(p.rto.srtt));
        }
        p.chunks_acked = true;
    }

    fn handle_chunks_acked(&mut self, path: PathId, rtt: Option<u64>) {
        let p = &mut self.paths[path.0];
        if let Some(rtt) = rtt {
            p.rto.set_new_rtt(rtt);
            trace!(
                "path {} rtt={} srtt={} rttvar={} rto={}",
                path,
                rtt,
                p.rto.srtt,
                p.rto.rttvar,
                p.rto.get_rto()
            );
        }

        p.retrans_count = 0;
        self.peer_retrans_count = 0;
    }

    /// T3-rtx expired on `path`: back off its RTO.
    pub(crate) fn rto_backoff(&mut self, path: PathId) {
        let p = &mut self.paths[path.0];
        if p.state == PathState::Active {
            p.rto.backoff();
            p.timer_backoff = true;
            trace!("path {} backed off rto={}", path, p.rto.get_rto());
        }
    }

    /// Delay before the first heartbeat on each path once the association is up.
    ///
    /// Unconfirmed destinations are probed almost immediately, a few at a time.
    pub(crate) fn initial_heartbeat_delays(&self) -> Vec<(PathId, u64)> {
        let mut probes = 0;
        self.ids()
            .filter(|&p| self.paths[p.0].heartbeat_enabled && self.paths[p.0].is_usable())
            .map(|p| {
                let path = &self.paths[p.0];
                if path.state == PathState::Unconfirmed && probes < INITIAL_PROBES {
                    probes += 1;
                    (p, probes as u64)
                } else {
                    (p, self.heartbeat_interval + path.rto.get_rto())
                }
            })
            .collect()
    }

    /// The heartbeat timer of `path` fired.
    pub(crate) fn heartbeat_timeout(
        &mut self,
        path: PathId,
    ) -> Result<HeartbeatAction, PathFailure> {
        let (sent, acked) = {
            let p = &self.paths[path.0];
            (p.heartbeat_sent, p.heartbeat_acked)
        };

        if sent && !acked {
            // an unanswered heartbeat counts like an unacknowledged DATA chunk
            if self.paths[path.0].state == PathState::Active {
                if let Some(failure) = self.chunks_retransmitted(path) {
                    return Err(failure);
                }
            }
            let p = &mut self.paths[path.0];
            if !p.timer_backoff {
                p.rto.backoff();
                trace!("heartbeat backoff on path {} rto={}", path, p.rto.get_rto());
            }
        }

        let p = &mut self.paths[path.0];
        let mut action = HeartbeatAction::default();
        if !p.chunks_acked && p.heartbeat_enabled && !p.chunks_sent && p.is_usable() {
            // the path was idle for a whole interval
            action.send = true;
            p.heartbeat_sent = true;
        } else {
            p.heartbeat_sent = false;
        }

        if p.heartbeat_enabled && p.is_usable() {
            action.restart = Some(self.heartbeat_interval + p.rto.get_rto());
            p.chunks_sent = false;
        }

        p.heartbeat_acked = false;
        p.timer_backoff = false;
        p.chunks_acked = false;

        Ok(action)
    }

    /// A heartbeat sent at `sent` on `path` came back. Returns the delay of the restarted
    /// heartbeat timer when the path changed state.
    pub(crate) fn heartbeat_ack(&mut self, path: PathId, sent: Instant, now: Instant) -> Option<u64> {
        if !self.contains(path) || !self.paths[path.0].is_usable() {
            return None;
        }

        let rtt = now.saturating_duration_since(sent).as_millis() as u64;
        self.handle_chunks_acked(path, Some(rtt));

        let p = &mut self.paths[path.0];
        p.heartbeat_acked = true;

        match p.state {
            PathState::Inactive | PathState::Unconfirmed => {
                p.state = PathState::Active;
                debug!("path {} to Active", path);
                self.status_changes.push_back((path, PathState::Active));
                if self.paths[path.0].heartbeat_enabled {
                    Some(self.heartbeat_interval + self.paths[path.0].rto.get_rto())
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Turns heartbeats on for `path`, optionally with a new interval. Returns the
    /// delay of the heartbeat timer to start.
    pub(crate) fn enable_heartbeat(&mut self, path: PathId, interval: Option<u64>) -> u64 {
        if let Some(interval) = interval {
            self.heartbeat_interval = interval;
        }
        let p = &mut self.paths[path.0];
        p.heartbeat_enabled = true;
        p.chunks_sent = false;
        p.chunks_acked = false;
        self.heartbeat_interval + p.rto.get_rto()
    }

    pub(crate) fn disable_heartbeat(&mut self, path: PathId) {
        self.paths[path.0].heartbeat_enabled = false;
    }

    pub(crate) fn disable_all_heartbeats(&mut self) {
        for p in &mut self.paths {
            p.heartbeat_enabled = false;
        }
    }

    pub(crate) fn heartbeat_enabled(&self, path: PathId) -> bool {
        self.paths[path.0].heartbeat_enabled
    }

    /// Adds a destination learned after the association came up
    pub(crate) fn add(&mut self, addr: SocketAddr, config: &TransportConfig) -> PathId {
        let id = PathId(self.paths.len());
        self.paths.push(Path::new(addr, PathState::Unconfirmed, config));
        self.status_changes.push_back((id, PathState::Added));
        id
    }

    /// Adds a destination announced during association setup. Returns the known path
    /// if the address is already there.
    pub(crate) fn learn(&mut self, addr: SocketAddr, config: &TransportConfig) -> PathId {
        if let Some(id) = self.find(addr) {
            return id;
        }
        let id = PathId(self.paths.len());
        self.paths.push(Path::new(addr, PathState::Unconfirmed, config));
        trace!("learned path {} {}", id, addr);
        id
    }

    pub(crate) fn remove(&mut self, path: PathId) {
        let p = &mut self.paths[path.0];
        p.state = PathState::Removed;
        p.heartbeat_enabled = false;
        self.status_changes.push_back((path, PathState::Removed));
    }
}
