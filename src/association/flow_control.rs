use super::reliable_transfer::SackOutcome;
use super::timer::Timer;
use super::{Association, Event, QueueKind, SendFailureReason};
use crate::chunk::Chunk;
use crate::path::{PathId, PathManager};
use crate::queue::retransmission_queue::OutboundChunk;
use crate::util::*;

use log::{debug, trace};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Congestion control variables of one destination (RFC 4960 sec 7.2)
#[derive(Debug, Clone)]
pub(crate) struct CongestionParams {
    pub(crate) cwnd: u32,
    pub(crate) ssthresh: u32,
    pub(crate) partial_bytes_acked: u32,
    pub(crate) mtu: u32,
    last_send_time: Option<Instant>,
    time_of_cwnd_adjustment: Option<Instant>,
}

impl CongestionParams {
    fn new(mtu: u32, peer_rwnd: u32) -> Self {
        CongestionParams {
            cwnd: 2 * mtu,
            ssthresh: peer_rwnd,
            partial_bytes_acked: 0,
            mtu,
            last_send_time: None,
            time_of_cwnd_adjustment: None,
        }
    }

    fn enter_loss_recovery(&mut self, cwnd: u32) {
        self.ssthresh = std::cmp::max(self.cwnd / 2, 2 * self.mtu);
        self.cwnd = cwnd;
        self.partial_bytes_acked = 0;
    }
}

/// A chunk waiting for (re)transmission
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Pending {
    /// Already has a TSN and lives in the retransmission queue
    Retransmit(u32),
    /// Head of the send queue
    New,
}

/// Sender flow and congestion control: queues user data, decides when and where
/// DATA chunks go.
#[derive(Debug)]
pub(crate) struct FlowControl {
    pub(crate) cparams: Vec<CongestionParams>,
    /// User data not yet sent, in submission order
    pub(crate) send_queue: VecDeque<OutboundChunk>,
    /// TSNs to retransmit, ascending; served before new data
    pub(crate) retransmit_queue: VecDeque<u32>,
    next_tsn: u32,
    pub(crate) peer_rwnd: u32,
    /// Last receiver window advertised by the peer
    pub(crate) peer_arwnd: u32,
    one_packet_inflight: bool,
    doing_retransmission: bool,
    waiting_for_sack: bool,
    t3_retransmission_sent: bool,
    max_queue_len: usize,
    /// Next SSN per outbound stream
    ssn: Vec<u16>,
}

impl FlowControl {
    pub(crate) fn new(
        num_paths: usize,
        mtu: u32,
        peer_rwnd: u32,
        initial_tsn: u32,
        num_outbound_streams: u16,
        max_queue_len: usize,
    ) -> Self {
        FlowControl {
            cparams: (0..num_paths)
                .map(|_| CongestionParams::new(mtu, peer_rwnd))
                .collect(),
            send_queue: VecDeque::new(),
            retransmit_queue: VecDeque::new(),
            next_tsn: initial_tsn,
            peer_rwnd,
            peer_arwnd: peer_rwnd,
            one_packet_inflight: false,
            doing_retransmission: false,
            waiting_for_sack: false,
            t3_retransmission_sent: false,
            max_queue_len,
            ssn: vec![0; num_outbound_streams as usize],
        }
    }

    pub(crate) fn add_path(&mut self, mtu: u32) {
        let peer_rwnd = self.peer_arwnd;
        self.cparams.push(CongestionParams::new(mtu, peer_rwnd));
    }

    /// Chunks waiting to go out, new and retransmissions
    pub(crate) fn len(&self) -> usize {
        self.send_queue.len() + self.retransmit_queue.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn is_full(&self) -> bool {
        self.max_queue_len != 0 && self.send_queue.len() >= self.max_queue_len
    }

    pub(crate) fn max_queue_len(&self) -> usize {
        self.max_queue_len
    }

    pub(crate) fn cwnd(&self, path: PathId) -> u32 {
        self.cparams[path.0].cwnd
    }

    /// Hands out the next SSN of an outbound stream
    pub(crate) fn next_ssn(&mut self, stream: u16) -> u16 {
        let ssn = self.ssn[stream as usize];
        self.ssn[stream as usize] = ssn.wrapping_add(1);
        ssn
    }

    /// Inserts TSNs into the retransmit list, keeping it sorted and unique
    fn schedule_retransmit(&mut self, tsn: u32) {
        let pos = self
            .retransmit_queue
            .iter()
            .position(|&t| !sna32lt(t, tsn))
            .unwrap_or(self.retransmit_queue.len());
        if self.retransmit_queue.get(pos) != Some(&tsn) {
            self.retransmit_queue.insert(pos, tsn);
        }
    }

    /// Where a chunk goes next. `old_destination` is the destination of the
    /// chunk sent just before in the same burst.
    fn select_destination(
        chunk: &OutboundChunk,
        paths: &PathManager,
        old_destination: Option<PathId>,
    ) -> PathId {
        if let Some(old) = old_destination {
            if paths.is_active(old) {
                return old;
            }
            return paths.next_active(old).unwrap_or(old);
        }

        let retransmitted = chunk.nsent > 0;
        let mut next = chunk
            .initial_destination
            .filter(|&p| paths.contains(p))
            .unwrap_or_else(|| paths.primary());
        if !retransmitted {
            if paths.is_active(next) {
                return next;
            }
            if paths.is_active(paths.primary()) {
                return paths.primary();
            }
        } else if let Some(last) = chunk.last_destination {
            next = last;
        }
        paths.next_active(next).unwrap_or(next)
    }

    /// The sender may put one more chunk of `len` bytes into the current packet
    fn send_okay(
        &mut self,
        cparams: &CongestionParams,
        total_size: u32,
        obpa: u32,
        len: u32,
        nsent: usize,
    ) -> bool {
        if self.doing_retransmission {
            if total_size + len > cparams.mtu {
                self.doing_retransmission = false;
            } else {
                return true;
            }
        }

        total_size + obpa < cparams.cwnd + cparams.mtu - 1
            && ((nsent == 0 && self.peer_rwnd > len) || !self.one_packet_inflight || nsent > 0)
    }
}

impl Association {
    /// Queues a user message, then tries to send
    pub(super) fn enqueue_data(&mut self, chunk: OutboundChunk, now: Instant) {
        let old_len = self.flow.send_queue.len();
        self.flow.send_queue.push_back(chunk);
        self.check_for_transmit(now, false, old_len);
    }

    fn next_pending(&mut self, now: Instant) -> Option<Pending> {
        while let Some(&tsn) = self.flow.retransmit_queue.front() {
            match self.reliable.queue.get(tsn) {
                Some(c) if !c.acked && !c.dropped => return Some(Pending::Retransmit(tsn)),
                _ => {
                    self.flow.retransmit_queue.pop_front();
                }
            }
        }

        while let Some(c) = self.flow.send_queue.front() {
            if !c.is_expired(now) {
                return Some(Pending::New);
            }
            if let Some(c) = self.flow.send_queue.pop_front() {
                debug!(
                    "[{}] unsent message expired on stream {}",
                    self.name, c.data.stream_identifier
                );
                self.events.push_back(Event::SendFailure {
                    stream_identifier: c.data.stream_identifier,
                    data: c.data.user_data,
                    reason: SendFailureReason::Abandoned,
                });
            }
        }
        None
    }

    fn pending_chunk(&self, pending: Pending) -> Option<&OutboundChunk> {
        match pending {
            Pending::Retransmit(tsn) => self.reliable.queue.get(tsn),
            Pending::New => self.flow.send_queue.front(),
        }
    }

    /// Idle destinations fall back to the initial window (RFC 4960 sec 7.2.1)
    fn reset_cwnd(&mut self, path: PathId, now: Instant) {
        if self.reliable.outstanding_bytes() == 0 {
            self.flow.one_packet_inflight = false;
        }
        let rto = Duration::from_millis(self.paths.rto(path));
        let cp = &mut self.flow.cparams[path.0];
        if cp.last_send_time.map_or(true, |t| now >= t + rto) {
            trace!("[{}] path {} idle, cwnd reset to {}", self.name, path, 2 * cp.mtu);
            cp.cwnd = 2 * cp.mtu;
            cp.last_send_time = Some(now);
        }
    }

    /// Sends as many queued chunks as the windows allow. `initial_retransmit` lets
    /// one packet of retransmissions out regardless of cwnd.
    pub(super) fn check_for_transmit(
        &mut self,
        now: Instant,
        initial_retransmit: bool,
        old_len: usize,
    ) {
        self.transmit_data(now, initial_retransmit);
        self.notify_queue_status(old_len);
    }

    fn transmit_data(&mut self, now: Instant, initial_retransmit: bool) {
        let Some(mut pending) = self.next_pending(now) else {
            return;
        };
        let Some(first) = self.pending_chunk(pending) else {
            return;
        };
        let mut destination = FlowControl::select_destination(first, &self.paths, None);

        if self.flow.peer_rwnd == 0 && self.flow.one_packet_inflight {
            trace!("[{}] peer window closed", self.name);
            return;
        }

        let mut obpa = self.reliable.outstanding_on(destination);
        if !initial_retransmit {
            if self.flow.cwnd(destination) <= obpa {
                trace!(
                    "[{}] cwnd {} full on path {}",
                    self.name,
                    self.flow.cwnd(destination),
                    destination
                );
                return;
            }
        } else {
            self.flow.doing_retransmission = true;
        }

        if self.flow.waiting_for_sack
            && matches!(pending, Pending::Retransmit(_))
            && self.flow.t3_retransmission_sent
        {
            trace!("[{}] waiting for SACK after T3 retransmission", self.name);
            return;
        }

        self.reset_cwnd(destination, now);

        let mut total_size = 0;
        let mut submitted = false;
        let mut retransmitted = false;
        let mut lowest_tsn_retransmitted = false;

        loop {
            let Some(c) = self.pending_chunk(pending) else {
                break;
            };
            let len = c.len() as u32;
            let nsent = c.nsent;
            let cparams = self.flow.cparams[destination.0].clone();
            if !self.flow.send_okay(&cparams, total_size, obpa, len, nsent) {
                break;
            }
            total_size += len;

            let tsn = match pending {
                Pending::Retransmit(tsn) => {
                    self.flow.retransmit_queue.pop_front();
                    tsn
                }
                Pending::New => {
                    let Some(mut c) = self.flow.send_queue.pop_front() else {
                        break;
                    };
                    let tsn = self.flow.next_tsn;
                    self.flow.next_tsn = tsn.wrapping_add(1);
                    c.data.tsn = tsn;
                    self.reliable.save(c);
                    tsn
                }
            };

            let Some(c) = self.reliable.queue.get_mut(tsn) else {
                break;
            };
            c.nsent += 1;
            c.last_destination = Some(destination);
            c.requeued = false;
            if c.nsent == 1 {
                c.sent_at = Some(now);
                self.flow.peer_rwnd = self.flow.peer_rwnd.saturating_sub(len);
            } else {
                retransmitted = true;
            }
            let nsent = c.nsent;
            let data = c.data.clone();
            if nsent > 1 && !lowest_tsn_retransmitted {
                lowest_tsn_retransmitted = self.reliable.is_lowest_tsn(tsn);
            }

            trace!(
                "[{}] DATA tsn={} len={} on path {} nsent={}",
                self.name,
                tsn,
                len,
                destination,
                nsent
            );
            self.queue_chunk(destination, Chunk::PayloadData(data));
            self.paths.chunks_sent_on(destination);
            self.flow.cparams[destination.0].last_send_time = Some(now);
            self.flow.one_packet_inflight = true;
            self.stats.inc_datas_sent();
            submitted = true;

            let Some(next) = self.next_pending(now) else {
                break;
            };
            pending = next;
            let Some(c) = self.pending_chunk(pending) else {
                break;
            };
            let next_len = c.len() as u32;
            let next_is_new = c.nsent == 0;
            let previous = destination;
            destination = FlowControl::select_destination(c, &self.paths, Some(destination));
            if destination != previous {
                obpa = self.reliable.outstanding_on(destination);
                total_size = 0;
            }
            if self.flow.peer_rwnd < next_len && next_is_new {
                break;
            }
        }
        self.flow.doing_retransmission = false;

        if self.flow.waiting_for_sack && !self.flow.t3_retransmission_sent && submitted && retransmitted {
            self.flow.t3_retransmission_sent = true;
        }

        if submitted || self.reliable.outstanding_on(destination) > 0 {
            let timer = Timer::T3Rtx(destination);
            if !self.timers.is_running(timer) || lowest_tsn_retransmitted {
                self.timers.start(timer, now, self.paths.rto(destination));
            }
        }
    }

    /// Reports the send queue crossing its configured limit
    pub(super) fn notify_queue_status(&mut self, old_len: usize) {
        let max = self.flow.max_queue_len();
        if max == 0 {
            return;
        }
        let len = self.flow.send_queue.len();
        if (old_len < max && len >= max) || (old_len >= max && len < max) {
            self.events.push_back(Event::QueueStatusChange {
                queue: QueueKind::Send,
                len,
            });
        }
    }

    /// Updates cwnd after a SACK (RFC 4960 sec 7.2.1, 7.2.2)
    fn adjust_counters(&mut self, path: PathId, outcome: &SackOutcome, now: Instant) {
        let outstanding = outcome.outstanding_at_arrival;
        let srtt = Duration::from_millis(self.paths.srtt(path));
        let Some(cp) = self.flow.cparams.get(path.0) else {
            return;
        };

        if cp.cwnd <= cp.ssthresh {
            // slow start
            for cp in self.flow.cparams.iter_mut() {
                cp.partial_bytes_acked = 0;
            }
            let cp = &mut self.flow.cparams[path.0];
            if outcome.new_acked {
                cp.cwnd += std::cmp::min(cp.mtu, outcome.newly_acked_bytes);
                cp.time_of_cwnd_adjustment = Some(now);
            }
            trace!("[{}] slow start path {} cwnd={}", self.name, path, cp.cwnd);
        } else {
            // congestion avoidance
            let cp = &mut self.flow.cparams[path.0];
            if outcome.new_acked {
                cp.partial_bytes_acked += outcome.newly_acked_bytes;
            }
            let round_trip_passed = cp
                .time_of_cwnd_adjustment
                .map_or(true, |t| now >= t + srtt);
            if round_trip_passed && cp.partial_bytes_acked >= cp.cwnd && outstanding >= cp.cwnd {
                cp.cwnd += cp.mtu;
                cp.partial_bytes_acked = cp.partial_bytes_acked.saturating_sub(cp.cwnd);
                cp.time_of_cwnd_adjustment = Some(now);
            }
            if outcome.all_acked {
                cp.partial_bytes_acked = 0;
            }
            trace!(
                "[{}] congestion avoidance path {} cwnd={} pba={}",
                self.name,
                path,
                cp.cwnd,
                cp.partial_bytes_acked
            );
        }
    }

    /// Stops or restarts T3-rtx according to what is still in flight (RFC 4960 sec 6.3.2)
    fn check_t3(&mut self, path: PathId, outcome: &SackOutcome, now: Instant) {
        if outcome.all_acked {
            for p in self.paths.ids().collect::<Vec<_>>() {
                self.timers.stop(Timer::T3Rtx(p));
            }
            return;
        }
        if self.reliable.outstanding_on(path) == 0 {
            self.timers.stop(Timer::T3Rtx(path));
            return;
        }
        if outcome.new_acked {
            self.timers.start(Timer::T3Rtx(path), now, self.paths.rto(path));
        }
    }

    /// A SACK without fast retransmissions arrived from `path`
    pub(super) fn sack_info(&mut self, path: PathId, arwnd: u32, outcome: &SackOutcome, now: Instant) {
        let old_len = self.flow.send_queue.len();
        self.flow.t3_retransmission_sent = false;
        self.flow.waiting_for_sack = false;

        self.adjust_counters(path, outcome, now);
        self.check_t3(path, outcome, now);

        let outstanding = self.reliable.outstanding_bytes();
        self.flow.one_packet_inflight = outstanding != 0;
        self.flow.peer_arwnd = arwnd;
        self.flow.peer_rwnd = arwnd.saturating_sub(outstanding);

        if !self.flow.is_empty() {
            self.check_for_transmit(now, false, old_len);
        } else if outstanding == 0 && outcome.newly_acked_bytes > 0 {
            self.events.push_back(Event::QueueStatusChange {
                queue: QueueKind::Send,
                len: 0,
            });
        }
    }

    /// A SACK reported chunks missing often enough to retransmit them (RFC 4960 sec 7.2.4)
    pub(super) fn fast_retransmission(
        &mut self,
        path: PathId,
        arwnd: u32,
        outcome: &SackOutcome,
        now: Instant,
    ) {
        let old_len = self.flow.send_queue.len();
        self.adjust_counters(path, outcome, now);
        self.flow.t3_retransmission_sent = false;
        self.flow.waiting_for_sack = false;

        if !self.reliable.is_in_fast_recovery() {
            let cp = &mut self.flow.cparams[path.0];
            let ssthresh = std::cmp::max(cp.cwnd / 2, 2 * cp.mtu);
            cp.enter_loss_recovery(ssthresh);
            debug!(
                "[{}] fast retransmit on path {}, cwnd={} ssthresh={}",
                self.name, path, cp.cwnd, cp.ssthresh
            );
            self.reliable.enter_fast_recovery();
        }

        for &tsn in &outcome.retransmit {
            self.flow.schedule_retransmit(tsn);
        }
        self.stats.inc_fast_retrans();

        self.check_t3(path, outcome, now);

        let outstanding = self.reliable.outstanding_bytes();
        self.flow.peer_arwnd = arwnd;
        self.flow.peer_rwnd = arwnd.saturating_sub(outstanding);
        self.flow.one_packet_inflight = !outcome.all_acked;

        if !self.flow.is_empty() {
            self.check_for_transmit(now, true, old_len);
        }
        self.flow.cparams[path.0].time_of_cwnd_adjustment = Some(now);
    }

    /// T3-rtx fired on `path` (RFC 4960 sec 6.3.3)
    pub(super) fn on_t3_timeout(&mut self, path: PathId, now: Instant) {
        self.stats.inc_t3timeouts();
        if self.reliable.queue.is_empty() {
            return;
        }

        let old_len = self.flow.send_queue.len();
        let (tsns, forward_tsn) = self.reliable.t3_timeout(path, now);
        if let Some(fwd) = forward_tsn {
            self.stats.inc_forward_tsns();
            self.queue_chunk(path, Chunk::ForwardTsn(fwd));
        }
        self.report_abandoned();
        if tsns.is_empty() {
            return;
        }
        debug!("[{}] T3-rtx timeout on path {}, {} chunks", self.name, path, tsns.len());

        if !self.reliable.is_in_fast_recovery() {
            let cp = &mut self.flow.cparams[path.0];
            let mtu = cp.mtu;
            cp.enter_loss_recovery(mtu);
        }

        for tsn in tsns {
            if let Some(c) = self.reliable.queue.get_mut(tsn) {
                c.requeued = true;
            }
            self.flow.schedule_retransmit(tsn);
        }
        self.flow.waiting_for_sack = true;
        self.flow.t3_retransmission_sent = false;
        self.flow.one_packet_inflight = false;

        if let Some(failure) = self.paths.chunks_retransmitted(path) {
            self.lost(failure.into());
            return;
        }
        self.paths.rto_backoff(path);
        self.check_for_transmit(now, true, old_len);
    }

    /// Requeues what is in flight towards a destination that left the association
    pub(super) fn requeue_path(&mut self, path: PathId, now: Instant) {
        let old_len = self.flow.send_queue.len();
        let tsns: Vec<u32> = self
            .reliable
            .queue
            .iter()
            .filter(|c| c.is_outstanding() && c.last_destination == Some(path))
            .map(|c| c.tsn())
            .collect();
        for tsn in tsns {
            if let Some(c) = self.reliable.queue.get_mut(tsn) {
                c.requeued = true;
            }
            self.flow.schedule_retransmit(tsn);
        }
        if !self.flow.is_empty() {
            self.check_for_transmit(now, false, old_len);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chunk::chunk_payload_data::ChunkPayloadData;
    use crate::config::TransportConfig;
    use bytes::Bytes;
    use std::net::SocketAddr;

    fn paths(n: usize) -> PathManager {
        let addrs: Vec<SocketAddr> = (0..n)
            .map(|i| SocketAddr::from(([10, 0, 0, i as u8 + 1], 5000)))
            .collect();
        PathManager::new(&addrs, 0, &TransportConfig::default())
    }

    fn chunk(initial_destination: Option<PathId>) -> OutboundChunk {
        OutboundChunk::new(
            ChunkPayloadData {
                user_data: Bytes::from_static(b"hello"),
                ..Default::default()
            },
            initial_destination,
            None,
        )
    }

    #[test]
    fn test_select_destination() {
        let mut pm = paths(3);
        let now = Instant::now();
        pm.heartbeat_ack(PathId(2), now, now);

        // new data: the requested destination when active, otherwise the primary
        assert_eq!(FlowControl::select_destination(&chunk(Some(PathId(2))), &pm, None), PathId(2));
        assert_eq!(FlowControl::select_destination(&chunk(Some(PathId(1))), &pm, None), PathId(0));
        assert_eq!(FlowControl::select_destination(&chunk(None), &pm, None), PathId(0));

        // a retransmission moves on from its last destination
        let mut c = chunk(None);
        c.nsent = 1;
        c.last_destination = Some(PathId(0));
        assert_eq!(FlowControl::select_destination(&c, &pm, None), PathId(2));

        // within a burst the previous destination is kept while active
        assert_eq!(FlowControl::select_destination(&c, &pm, Some(PathId(0))), PathId(0));
        assert_eq!(FlowControl::select_destination(&c, &pm, Some(PathId(1))), PathId(2));
    }

    #[test]
    fn test_send_okay() {
        let mut fc = FlowControl::new(1, 1500, 10000, 1, 1, 0);
        let cp = fc.cparams[0].clone();
        assert_eq!(cp.cwnd, 3000);

        assert!(fc.send_okay(&cp, 0, 0, 1000, 0));
        assert!(fc.send_okay(&cp, 1000, 2000, 1000, 0), "below cwnd + mtu - 1");
        assert!(!fc.send_okay(&cp, 2000, 2500, 1000, 0));

        // a new chunk that does not fit the peer window only goes when nothing is in flight
        fc.peer_rwnd = 500;
        fc.one_packet_inflight = true;
        assert!(!fc.send_okay(&cp, 0, 0, 1000, 0));
        assert!(fc.send_okay(&cp, 0, 0, 1000, 1), "retransmissions ignore the peer window");
        fc.one_packet_inflight = false;
        assert!(fc.send_okay(&cp, 0, 0, 1000, 0), "zero window probe");

        // one packet of retransmissions regardless of cwnd
        fc.doing_retransmission = true;
        assert!(fc.send_okay(&cp, 0, 100000, 1000, 1));
        assert!(!fc.send_okay(&cp, 1000, 100000, 1000, 1));
        assert!(!fc.doing_retransmission);
    }

    #[test]
    fn test_schedule_retransmit_sorted_unique() {
        let mut fc = FlowControl::new(1, 1500, 10000, 1, 1, 0);
        for tsn in [5, 3, 9, 3, 5, 4] {
            fc.schedule_retransmit(tsn);
        }
        assert_eq!(fc.retransmit_queue, VecDeque::from(vec![3, 4, 5, 9]));
        assert_eq!(fc.len(), 4);
    }

    #[test]
    fn test_next_ssn_per_stream() {
        let mut fc = FlowControl::new(1, 1500, 10000, 1, 2, 0);
        assert_eq!(fc.next_ssn(0), 0);
        assert_eq!(fc.next_ssn(0), 1);
        assert_eq!(fc.next_ssn(1), 0);
    }
}
