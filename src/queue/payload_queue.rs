use crate::chunk::chunk_selective_ack::GapAckBlock;
use crate::util::*;

use std::collections::VecDeque;

/// Tracks inbound TSNs above the cumulative TSN so that SACKs can report gaps and
/// duplicates. Payloads themselves are handed to the stream reorder buffers.
#[derive(Default, Debug)]
pub(crate) struct PayloadQueue {
    pub(crate) cumulative_tsn: u32,
    sorted: VecDeque<u32>,
    dup_tsn: Vec<u32>,
}

impl PayloadQueue {
    pub(crate) fn new(cumulative_tsn: u32) -> Self {
        PayloadQueue {
            cumulative_tsn,
            ..Default::default()
        }
    }

    pub(crate) fn is_duplicate(&self, tsn: u32) -> bool {
        sna32lte(tsn, self.cumulative_tsn) || self.sorted.contains(&tsn)
    }

    /// Gap ack block offsets are 16 bits wide, so a TSN further ahead of the
    /// cumulative TSN cannot be reported.
    pub(crate) fn is_out_of_range(&self, tsn: u32) -> bool {
        tsn.wrapping_sub(self.cumulative_tsn) > u16::MAX as u32
            && sna32gt(tsn, self.cumulative_tsn)
    }

    /// push records a received TSN. A TSN that is already known is logged as
    /// duplicate, to be reported with the next SACK.
    pub(crate) fn push(&mut self, tsn: u32) -> bool {
        if self.is_duplicate(tsn) {
            self.dup_tsn.push(tsn);
            return false;
        }
        if self.is_out_of_range(tsn) {
            return false;
        }

        match self.sorted.back() {
            Some(&last) if sna32lt(tsn, last) => {
                let pos = self
                    .sorted
                    .iter()
                    .position(|&t| sna32gt(t, tsn))
                    .unwrap_or(self.sorted.len());
                self.sorted.insert(pos, tsn);
            }
            _ => self.sorted.push_back(tsn),
        }

        self.advance();
        true
    }

    /// Moves the cumulative TSN over every consecutive TSN received
    fn advance(&mut self) {
        while let Some(&tsn) = self.sorted.front() {
            if tsn == self.cumulative_tsn.wrapping_add(1) {
                self.cumulative_tsn = tsn;
                self.sorted.pop_front();
            } else if sna32lte(tsn, self.cumulative_tsn) {
                self.sorted.pop_front();
            } else {
                break;
            }
        }
    }

    /// The sender abandoned everything up to `new_cumulative_tsn`.
    pub(crate) fn forward(&mut self, new_cumulative_tsn: u32) -> bool {
        if !sna32gt(new_cumulative_tsn, self.cumulative_tsn) {
            return false;
        }
        self.cumulative_tsn = new_cumulative_tsn;
        self.advance();
        true
    }

    pub(crate) fn has_gaps(&self) -> bool {
        !self.sorted.is_empty()
    }

    pub(crate) fn has_duplicates(&self) -> bool {
        !self.dup_tsn.is_empty()
    }

    /// pop_duplicates returns the TSN values that were found duplicate.
    pub(crate) fn pop_duplicates(&mut self) -> Vec<u32> {
        self.dup_tsn.drain(..).collect()
    }

    pub(crate) fn get_gap_ack_blocks(&self) -> Vec<GapAckBlock> {
        let mut gap_ack_blocks: Vec<GapAckBlock> = vec![];
        for &tsn in &self.sorted {
            let diff = tsn.wrapping_sub(self.cumulative_tsn) as u16;
            match gap_ack_blocks.last_mut() {
                Some(b) if b.end.wrapping_add(1) == diff => b.end = diff,
                _ => gap_ack_blocks.push(GapAckBlock {
                    start: diff,
                    end: diff,
                }),
            }
        }
        gap_ack_blocks
    }

    pub(crate) fn get_gap_ack_blocks_string(&self) -> String {
        let mut s = format!("cumTSN={}", self.cumulative_tsn);
        for b in self.get_gap_ack_blocks() {
            s += format!(",{}-{}", b.start, b.end).as_str();
        }
        s
    }
}
