use crate::chunk::chunk_payload_data::ChunkPayloadData;
use crate::path::PathId;
use crate::util::*;

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

/// A user message on its way to the peer, from `send()` until it is cumulatively
/// acked or abandoned.
#[derive(Debug, Clone)]
pub(crate) struct OutboundChunk {
    pub(crate) data: ChunkPayloadData,
    /// Number of transmissions so far
    pub(crate) nsent: usize,
    pub(crate) last_destination: Option<PathId>,
    /// Destination the user asked for, if any
    pub(crate) initial_destination: Option<PathId>,
    /// Number of SACKs that reported this chunk missing
    pub(crate) gap_reports: usize,
    pub(crate) acked: bool,
    pub(crate) dropped: bool,
    pub(crate) fast_retransmitted: bool,
    pub(crate) requeued: bool,
    pub(crate) expiry: Option<Instant>,
    pub(crate) sent_at: Option<Instant>,
}

impl OutboundChunk {
    pub(crate) fn new(
        data: ChunkPayloadData,
        initial_destination: Option<PathId>,
        expiry: Option<Instant>,
    ) -> Self {
        OutboundChunk {
            data,
            nsent: 0,
            last_destination: None,
            initial_destination,
            gap_reports: 0,
            acked: false,
            dropped: false,
            fast_retransmitted: false,
            requeued: false,
            expiry,
            sent_at: None,
        }
    }

    pub(crate) fn tsn(&self) -> u32 {
        self.data.tsn
    }

    pub(crate) fn len(&self) -> usize {
        self.data.user_data.len()
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.expiry.map_or(false, |t| t <= now)
    }

    /// Counts against the congestion window of its last destination
    pub(crate) fn is_outstanding(&self) -> bool {
        self.nsent > 0 && !self.acked && !self.dropped && !self.requeued
    }
}

/// The sole owner of every chunk that has been assigned a TSN. Chunks are kept in
/// ascending TSN order without duplicates; the head is the lowest unacked TSN.
#[derive(Default, Debug)]
pub(crate) struct RetransmissionQueue {
    chunk_map: HashMap<u32, OutboundChunk>,
    sorted: VecDeque<u32>,
    n_bytes: usize,
}

impl RetransmissionQueue {
    pub(crate) fn new() -> Self {
        RetransmissionQueue::default()
    }

    /// push stores a chunk whose TSN is newer than every queued one.
    pub(crate) fn push(&mut self, c: OutboundChunk) -> bool {
        let tsn = c.tsn();
        if let Some(&last) = self.sorted.back() {
            if !sna32gt(tsn, last) {
                return false;
            }
        }

        self.n_bytes += c.len();
        self.chunk_map.insert(tsn, c);
        self.sorted.push_back(tsn);
        true
    }

    pub(crate) fn get(&self, tsn: u32) -> Option<&OutboundChunk> {
        self.chunk_map.get(&tsn)
    }

    pub(crate) fn get_mut(&mut self, tsn: u32) -> Option<&mut OutboundChunk> {
        self.chunk_map.get_mut(&tsn)
    }

    pub(crate) fn front_tsn(&self) -> Option<u32> {
        self.sorted.front().copied()
    }

    /// TSNs in ascending order
    pub(crate) fn tsns(&self) -> impl Iterator<Item = u32> + '_ {
        self.sorted.iter().copied()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &OutboundChunk> + '_ {
        self.sorted.iter().filter_map(|tsn| self.chunk_map.get(tsn))
    }

    /// pop removes the head if its TSN is not newer than `cumulative_tsn`.
    pub(crate) fn pop_through(&mut self, cumulative_tsn: u32) -> Option<OutboundChunk> {
        let tsn = *self.sorted.front()?;
        if !sna32lte(tsn, cumulative_tsn) {
            return None;
        }
        self.sorted.pop_front();
        let c = self.chunk_map.remove(&tsn)?;
        self.n_bytes -= c.len();
        Some(c)
    }

    /// Removes every chunk, in TSN order
    pub(crate) fn drain(&mut self) -> Vec<OutboundChunk> {
        let mut chunk_map = std::mem::take(&mut self.chunk_map);
        self.n_bytes = 0;
        self.sorted
            .drain(..)
            .filter_map(|tsn| chunk_map.remove(&tsn))
            .collect()
    }

    pub(crate) fn get_num_bytes(&self) -> usize {
        self.n_bytes
    }

    pub(crate) fn len(&self) -> usize {
        self.chunk_map.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;

    fn make_chunk(tsn: u32, len: usize) -> OutboundChunk {
        OutboundChunk::new(
            ChunkPayloadData {
                tsn,
                user_data: Bytes::from(vec![0u8; len]),
                ..Default::default()
            },
            None,
            None,
        )
    }

    #[test]
    fn test_retransmission_queue_keeps_ascending_order() {
        let mut q = RetransmissionQueue::new();
        assert!(q.push(make_chunk(u32::MAX - 1, 10)));
        assert!(q.push(make_chunk(u32::MAX, 10)));
        assert!(q.push(make_chunk(0, 10)), "wrap around must be accepted");
        assert!(!q.push(make_chunk(0, 10)), "duplicate must be refused");
        assert!(!q.push(make_chunk(u32::MAX, 10)), "older TSN must be refused");

        let tsns: Vec<u32> = q.tsns().collect();
        assert_eq!(tsns, vec![u32::MAX - 1, u32::MAX, 0]);
        assert_eq!(q.get_num_bytes(), 30);
        assert_eq!(q.front_tsn(), Some(u32::MAX - 1));
    }

    #[test]
    fn test_retransmission_queue_pop_through() {
        let mut q = RetransmissionQueue::new();
        for tsn in 10..15 {
            q.push(make_chunk(tsn, 4));
        }

        assert!(q.pop_through(9).is_none());
        let popped: Vec<u32> = std::iter::from_fn(|| q.pop_through(12))
            .map(|c| c.tsn())
            .collect();
        assert_eq!(popped, vec![10, 11, 12]);
        assert_eq!(q.len(), 2);
        assert_eq!(q.get_num_bytes(), 8);

        let rest: Vec<u32> = q.drain().iter().map(|c| c.tsn()).collect();
        assert_eq!(rest, vec![13, 14]);
        assert!(q.is_empty());
        assert_eq!(q.get_num_bytes(), 0);
    }

    #[test]
    fn test_outbound_chunk_outstanding() {
        let mut c = make_chunk(1, 4);
        assert!(!c.is_outstanding(), "unsent chunk is not in flight");
        c.nsent = 1;
        assert!(c.is_outstanding());
        c.requeued = true;
        assert!(!c.is_outstanding());
        c.requeued = false;
        c.acked = true;
        assert!(!c.is_outstanding());
    }
}
