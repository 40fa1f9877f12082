use crate::chunk::chunk_forward_tsn::{ChunkForwardTsn, ChunkForwardTsnStream};
use crate::chunk::chunk_selective_ack::ChunkSelectiveAck;
use crate::path::PathId;
use crate::queue::retransmission_queue::{OutboundChunk, RetransmissionQueue};
use crate::util::*;

use log::{debug, trace};
use std::time::Instant;

/// A chunk is fast retransmitted after this many miss indications
pub(crate) const FAST_RETRANSMIT_THRESHOLD: usize = 4;

/// What a SACK changed, handed to flow control
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct SackOutcome {
    pub(crate) cumulative_tsn_ack: u32,
    pub(crate) newly_acked_bytes: u32,
    /// Bytes in flight when the SACK arrived
    pub(crate) outstanding_at_arrival: u32,
    /// Nothing is left in the retransmission queue and every TSN sent is acked
    pub(crate) all_acked: bool,
    /// The cumulative TSN ack point advanced
    pub(crate) new_acked: bool,
    /// TSNs to fast retransmit, ascending
    pub(crate) retransmit: Vec<u32>,
    /// Send time of a chunk acked after a single transmission to the SACK source
    pub(crate) rtt_sent: Option<Instant>,
    pub(crate) forward_tsn: Option<ChunkForwardTsn>,
}

/// Sender side of reliable transfer: the retransmission queue and everything
/// learned from SACKs about it.
#[derive(Debug)]
pub(crate) struct ReliableTransfer {
    pub(crate) queue: RetransmissionQueue,
    highest_acked: u32,
    /// Lowest TSN not yet cumulatively acked
    lowest_tsn: u32,
    /// Highest TSN handed to the queue
    highest_tsn: u32,
    fast_recovery: bool,
    fr_exit_point: u32,
    advanced_peer_ack_point: u32,
    last_received_ctsna: u32,
    all_chunks_are_unacked: bool,
    forward_tsn_supported: bool,
    last_sack: Option<ChunkSelectiveAck>,
    /// Chunks given up because their lifetime expired, to be reported to the ULP
    abandoned: Vec<OutboundChunk>,
}

impl ReliableTransfer {
    pub(crate) fn new(initial_tsn: u32, forward_tsn_supported: bool) -> Self {
        let last = initial_tsn.wrapping_sub(1);
        ReliableTransfer {
            queue: RetransmissionQueue::new(),
            highest_acked: last,
            lowest_tsn: last,
            highest_tsn: last,
            fast_recovery: false,
            fr_exit_point: 0,
            advanced_peer_ack_point: last,
            last_received_ctsna: last,
            all_chunks_are_unacked: true,
            forward_tsn_supported,
            last_sack: None,
            abandoned: vec![],
        }
    }

    /// Stores a chunk after its first transmission
    pub(crate) fn save(&mut self, c: OutboundChunk) -> bool {
        let tsn = c.tsn();
        if !self.queue.push(c) {
            return false;
        }
        self.highest_tsn = tsn;
        true
    }

    pub(crate) fn is_in_fast_recovery(&self) -> bool {
        self.fast_recovery
    }

    pub(crate) fn enter_fast_recovery(&mut self) {
        if !self.fast_recovery {
            debug!("entering fast recovery, exit point {}", self.highest_tsn);
            self.fast_recovery = true;
            self.fr_exit_point = self.highest_tsn;
        }
    }

    fn check_fast_recovery(&mut self, ctsna: u32) {
        if self.fast_recovery && sna32gte(ctsna, self.fr_exit_point) {
            debug!("leaving fast recovery, ctsna {}", ctsna);
            self.fast_recovery = false;
            self.fr_exit_point = 0;
        }
    }

    pub(crate) fn is_lowest_tsn(&self, tsn: u32) -> bool {
        self.queue.front_tsn() == Some(tsn)
    }

    /// Bytes in flight towards `path`
    pub(crate) fn outstanding_on(&self, path: PathId) -> u32 {
        self.queue
            .iter()
            .filter(|c| c.is_outstanding() && c.last_destination == Some(path))
            .map(|c| c.len() as u32)
            .sum()
    }

    /// Bytes in flight over all destinations
    pub(crate) fn outstanding_bytes(&self) -> u32 {
        self.queue
            .iter()
            .filter(|c| c.is_outstanding())
            .map(|c| c.len() as u32)
            .sum()
    }

    pub(crate) fn take_abandoned(&mut self) -> Vec<OutboundChunk> {
        std::mem::take(&mut self.abandoned)
    }

    fn abandon(&mut self, tsn: u32) {
        if let Some(c) = self.queue.get_mut(tsn) {
            c.dropped = true;
            c.fast_retransmitted = true;
            trace!("abandoned tsn={}", tsn);
            self.abandoned.push(c.clone());
        }
    }

    /// Removes every chunk up to `ctsna`, counting the bytes acked for the first time
    fn dequeue_up_to(&mut self, ctsna: u32, source: Option<PathId>) -> (u32, Option<Instant>) {
        let mut newly_acked = 0;
        let mut rtt_sent = None;
        while let Some(c) = self.queue.pop_through(ctsna) {
            if !c.acked && !c.dropped {
                newly_acked += c.len() as u32;
                if c.nsent == 1 && source.is_some() && c.last_destination == source {
                    rtt_sent = c.sent_at;
                }
            }
        }
        (newly_acked, rtt_sent)
    }

    /// Applies a SACK received from `source`. Returns `None` when the SACK is older
    /// than one already processed, repeats the previous one, or acks unsent data.
    pub(crate) fn process_sack(
        &mut self,
        sack: &ChunkSelectiveAck,
        source: PathId,
        now: Instant,
    ) -> Option<SackOutcome> {
        let ctsna = sack.cumulative_tsn_ack;
        if sna32lt(ctsna, self.highest_acked) {
            trace!("old SACK ctsna={} < {}", ctsna, self.highest_acked);
            return None;
        }
        if sna32gt(ctsna, self.highest_tsn) {
            debug!("SACK acks unsent tsn {} > {}", ctsna, self.highest_tsn);
            return None;
        }
        if self.last_sack.as_ref() == Some(sack) {
            trace!("duplicate SACK ctsna={}", ctsna);
            return None;
        }
        self.last_sack = Some(sack.clone());
        let old_ack = self.highest_acked;
        self.highest_acked = ctsna;
        self.last_received_ctsna = ctsna;
        self.check_fast_recovery(ctsna);

        let mut outcome = SackOutcome {
            cumulative_tsn_ack: ctsna,
            outstanding_at_arrival: self.outstanding_bytes(),
            ..Default::default()
        };

        if sna32gte(ctsna, self.lowest_tsn) {
            let (newly_acked, rtt_sent) = self.dequeue_up_to(ctsna, Some(source));
            outcome.newly_acked_bytes += newly_acked;
            outcome.rtt_sent = rtt_sent;
            self.lowest_tsn = ctsna;
        }

        if !sack.gap_ack_blocks.is_empty() {
            self.walk_gap_blocks(sack, source, now, &mut outcome);
        } else if !self.all_chunks_are_unacked {
            // reneged: chunks acked by earlier gap reports are missing again
            let tsns: Vec<u32> = self.queue.tsns().collect();
            for tsn in tsns {
                if let Some(c) = self.queue.get_mut(tsn) {
                    if c.acked && !c.dropped {
                        c.acked = false;
                        c.gap_reports = 0;
                        c.fast_retransmitted = true;
                        outcome.retransmit.push(tsn);
                        debug!("reneged tsn={} scheduled for retransmission", tsn);
                    }
                }
            }
            self.all_chunks_are_unacked = true;
        }

        match self.queue.front_tsn() {
            Some(front) => self.lowest_tsn = front,
            None => {
                outcome.all_acked = self.highest_tsn == self.highest_acked;
                self.lowest_tsn = self.highest_tsn;
            }
        }
        outcome.new_acked = sna32gt(ctsna, old_ack);

        if sna32lt(self.advanced_peer_ack_point, ctsna) {
            self.advanced_peer_ack_point = ctsna;
        }
        outcome.forward_tsn = self.check_forward_tsn(ctsna);

        trace!(
            "SACK ctsna={} acked={} queued={}B all_acked={} new_acked={} rtx={:?}",
            ctsna,
            outcome.newly_acked_bytes,
            self.queue.get_num_bytes(),
            outcome.all_acked,
            outcome.new_acked,
            outcome.retransmit
        );
        Some(outcome)
    }

    fn walk_gap_blocks(
        &mut self,
        sack: &ChunkSelectiveAck,
        source: PathId,
        now: Instant,
        outcome: &mut SackOutcome,
    ) {
        let ctsna = sack.cumulative_tsn_ack;
        let blocks: Vec<(u32, u32)> = sack
            .gap_ack_blocks
            .iter()
            .map(|b| {
                (
                    ctsna.wrapping_add(b.start as u32),
                    ctsna.wrapping_add(b.end as u32),
                )
            })
            .collect();
        let Some(&(_, highest_reported)) = blocks.last() else {
            return;
        };

        let tsns: Vec<u32> = self.queue.tsns().collect();
        for tsn in tsns {
            if sna32gt(tsn, highest_reported) {
                break;
            }
            let in_block = blocks
                .iter()
                .any(|&(lo, hi)| sna32gte(tsn, lo) && sna32lte(tsn, hi));

            let Some(c) = self.queue.get_mut(tsn) else {
                continue;
            };
            if in_block {
                if !c.acked && !c.dropped {
                    outcome.newly_acked_bytes += c.len() as u32;
                    c.acked = true;
                    self.all_chunks_are_unacked = false;
                    if c.nsent == 1 && c.last_destination == Some(source) {
                        outcome.rtt_sent = c.sent_at;
                    }
                }
                c.gap_reports = 0;
                continue;
            }

            c.gap_reports += 1;
            if c.gap_reports < FAST_RETRANSMIT_THRESHOLD || c.dropped {
                continue;
            }
            if c.is_expired(now) {
                self.abandon(tsn);
            } else if !c.fast_retransmitted {
                c.gap_reports = 0;
                c.fast_retransmitted = true;
                outcome.retransmit.push(tsn);
                trace!("tsn={} scheduled for fast retransmission", tsn);
            }
        }
    }

    /// Moves the advanced peer ack point over the abandoned chunks at the head of
    /// the queue and builds a FORWARD TSN when it passed `ctsna`.
    fn check_forward_tsn(&mut self, ctsna: u32) -> Option<ChunkForwardTsn> {
        if !self.forward_tsn_supported {
            return None;
        }

        let mut streams: Vec<ChunkForwardTsnStream> = vec![];
        for c in self.queue.iter() {
            if !c.dropped {
                break;
            }
            self.advanced_peer_ack_point = max_tsn(self.advanced_peer_ack_point, c.tsn());
            if c.data.unordered {
                continue;
            }
            let si = c.data.stream_identifier;
            let ssn = c.data.stream_sequence_number;
            match streams.iter_mut().find(|s| s.identifier == si) {
                Some(s) => {
                    if sna16gt(ssn, s.sequence) {
                        s.sequence = ssn;
                    }
                }
                None => streams.push(ChunkForwardTsnStream {
                    identifier: si,
                    sequence: ssn,
                }),
            }
        }

        if !sna32gt(self.advanced_peer_ack_point, ctsna) {
            return None;
        }
        streams.sort_by_key(|s| s.identifier);
        debug!(
            "FORWARD TSN {} (ctsna {})",
            self.advanced_peer_ack_point, ctsna
        );
        Some(ChunkForwardTsn {
            new_cumulative_tsn: self.advanced_peer_ack_point,
            streams,
        })
    }

    /// T3-rtx expired on `path`. Returns the TSNs to retransmit and, if chunks were
    /// abandoned past the peer's cumulative ack, the FORWARD TSN to send.
    pub(crate) fn t3_timeout(
        &mut self,
        path: PathId,
        now: Instant,
    ) -> (Vec<u32>, Option<ChunkForwardTsn>) {
        let mut retransmit = vec![];
        let tsns: Vec<u32> = self.queue.tsns().collect();
        for tsn in tsns {
            let Some(c) = self.queue.get_mut(tsn) else {
                continue;
            };
            if c.last_destination != Some(path) || c.dropped || c.acked {
                continue;
            }
            if c.is_expired(now) {
                self.abandon(tsn);
            } else {
                c.gap_reports = 0;
                retransmit.push(tsn);
            }
        }

        self.lowest_tsn = self.queue.front_tsn().unwrap_or(self.highest_tsn);
        let forward_tsn = self.check_forward_tsn(self.last_received_ctsna);
        (retransmit, forward_tsn)
    }

    /// Cumulative ack carried by a SHUTDOWN chunk. Returns the newly acked bytes,
    /// or `None` when the ack does not move anything.
    pub(crate) fn shutdown_ctsna(&mut self, ctsna: u32) -> Option<u32> {
        if !sna32gte(ctsna, self.lowest_tsn) || sna32gt(ctsna, self.highest_tsn) {
            return None;
        }
        let (newly_acked, _) = self.dequeue_up_to(ctsna, None);
        self.lowest_tsn = ctsna;
        if sna32gt(ctsna, self.highest_acked) {
            self.highest_acked = ctsna;
            self.last_received_ctsna = ctsna;
        }
        Some(newly_acked)
    }
}
