use super::state::AckState;
use crate::chunk::chunk_forward_tsn::ChunkForwardTsn;
use crate::chunk::chunk_payload_data::ChunkPayloadData;
use crate::chunk::chunk_selective_ack::ChunkSelectiveAck;
use crate::path::PathId;
use crate::queue::payload_queue::PayloadQueue;
use crate::util::*;

use log::trace;

/// What became of a received DATA chunk
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DataOutcome {
    /// Accepted; the chunks now deliverable to the ULP, in delivery order
    Accepted(Vec<ChunkPayloadData>),
    /// Already received, reported in the next SACK
    Duplicate,
    /// The stream does not exist; the TSN is acked and the data discarded
    InvalidStream,
    /// No room in the receive window; neither recorded nor acked
    Overflow,
}

/// Ordered delivery state of one inbound stream
#[derive(Debug, Default)]
struct InboundStream {
    next_ssn: u16,
    /// Chunks received ahead of `next_ssn`, sorted by SSN
    pending: Vec<ChunkPayloadData>,
}

impl InboundStream {
    fn insert(&mut self, chunk: ChunkPayloadData) {
        let ssn = chunk.stream_sequence_number;
        if self.pending.iter().any(|c| c.stream_sequence_number == ssn) {
            return;
        }
        let pos = self
            .pending
            .iter()
            .position(|c| sna16gt(c.stream_sequence_number, ssn))
            .unwrap_or(self.pending.len());
        self.pending.insert(pos, chunk);
    }

    /// Pops the chunks that became in-sequence
    fn drain_ready(&mut self, out: &mut Vec<ChunkPayloadData>) {
        while !self.pending.is_empty() && self.pending[0].stream_sequence_number == self.next_ssn {
            let c = self.pending.remove(0);
            self.next_ssn = self.next_ssn.wrapping_add(1);
            out.push(c);
        }
    }

    /// Skips every message up to and including `ssn`
    fn skip_to(&mut self, ssn: u16, out: &mut Vec<ChunkPayloadData>) -> usize {
        if sna16lt(ssn, self.next_ssn) {
            return 0;
        }
        self.next_ssn = ssn.wrapping_add(1);
        let before = self.pending.len();
        let next_ssn = self.next_ssn;
        let mut freed = 0;
        self.pending.retain(|c| {
            let keep = !sna16lt(c.stream_sequence_number, next_ssn);
            if !keep {
                freed += c.user_data.len();
            }
            keep
        });
        if before != self.pending.len() {
            trace!("skipped {} pending chunks", before - self.pending.len());
        }
        self.drain_ready(out);
        freed
    }
}

/// Receive side of an association: TSN bookkeeping for SACK generation, the
/// receive window and per-stream ordered delivery.
#[derive(Debug)]
pub(crate) struct ReceiveState {
    payload_queue: PayloadQueue,
    streams: Vec<InboundStream>,
    max_receive_buffer: u32,
    /// Bytes held back waiting for an earlier SSN
    buffered: usize,
    pub(crate) ack_state: AckState,
    packets_since_ack: usize,
    sack_everytime: bool,
    /// Data seen in the packet being processed
    data_in_packet: bool,
    /// Something in the packet asks for an immediate SACK
    immediate_in_packet: bool,
    /// Source of the most recent DATA, where SACKs are sent
    pub(crate) last_data_path: Option<PathId>,
}

impl ReceiveState {
    pub(crate) fn new(peer_initial_tsn: u32, num_inbound_streams: u16, max_receive_buffer: u32) -> Self {
        ReceiveState {
            payload_queue: PayloadQueue::new(peer_initial_tsn.wrapping_sub(1)),
            streams: (0..num_inbound_streams)
                .map(|_| InboundStream::default())
                .collect(),
            max_receive_buffer,
            buffered: 0,
            ack_state: AckState::Idle,
            packets_since_ack: 0,
            sack_everytime: false,
            data_in_packet: false,
            immediate_in_packet: false,
            last_data_path: None,
        }
    }

    pub(crate) fn cumulative_tsn(&self) -> u32 {
        self.payload_queue.cumulative_tsn
    }

    /// Advertised receiver window credit
    pub(crate) fn rwnd(&self) -> u32 {
        self.max_receive_buffer.saturating_sub(self.buffered as u32)
    }

    /// After a SHUTDOWN every packet carrying data is acked at once
    pub(crate) fn send_sack_everytime(&mut self) {
        self.sack_everytime = true;
    }

    pub(crate) fn begin_packet(&mut self) {
        self.data_in_packet = false;
        self.immediate_in_packet = false;
    }

    pub(crate) fn handle_data(&mut self, d: ChunkPayloadData, path: PathId) -> DataOutcome {
        self.data_in_packet = true;
        self.last_data_path = Some(path);
        if d.immediate_sack {
            self.immediate_in_packet = true;
        }

        if self.payload_queue.is_duplicate(d.tsn) {
            self.payload_queue.push(d.tsn);
            self.immediate_in_packet = true;
            return DataOutcome::Duplicate;
        }

        if self.payload_queue.is_out_of_range(d.tsn) {
            trace!(
                "dropping tsn={} too far ahead of cumTSN={}",
                d.tsn,
                self.payload_queue.cumulative_tsn
            );
            return DataOutcome::Overflow;
        }

        if d.user_data.len() > self.rwnd() as usize {
            trace!(
                "dropping tsn={} len={}, rwnd={}",
                d.tsn,
                d.user_data.len(),
                self.rwnd()
            );
            return DataOutcome::Overflow;
        }

        self.payload_queue.push(d.tsn);
        if self.payload_queue.has_gaps() {
            self.immediate_in_packet = true;
        }

        let Some(stream) = self.streams.get_mut(d.stream_identifier as usize) else {
            return DataOutcome::InvalidStream;
        };

        let mut ready = vec![];
        if d.unordered {
            ready.push(d);
        } else if d.stream_sequence_number == stream.next_ssn {
            stream.next_ssn = stream.next_ssn.wrapping_add(1);
            ready.push(d);
            let before = ready.len();
            stream.drain_ready(&mut ready);
            self.buffered -= ready[before..]
                .iter()
                .map(|c| c.user_data.len())
                .sum::<usize>();
        } else if sna16lt(d.stream_sequence_number, stream.next_ssn) {
            trace!(
                "stale ssn={} on stream {}, next={}",
                d.stream_sequence_number,
                d.stream_identifier,
                stream.next_ssn
            );
        } else {
            self.buffered += d.user_data.len();
            stream.insert(d);
        }

        DataOutcome::Accepted(ready)
    }

    /// Moves the cumulative TSN past abandoned chunks and releases the stream
    /// messages they were blocking. Returns the chunks that became deliverable.
    pub(crate) fn handle_forward_tsn(&mut self, c: &ChunkForwardTsn) -> Vec<ChunkPayloadData> {
        self.immediate_in_packet = true;
        if !self.payload_queue.forward(c.new_cumulative_tsn) {
            return vec![];
        }

        let mut ready = vec![];
        for s in &c.streams {
            if let Some(stream) = self.streams.get_mut(s.identifier as usize) {
                let before = ready.len();
                let freed = stream.skip_to(s.sequence, &mut ready);
                let released: usize = ready[before..].iter().map(|c| c.user_data.len()).sum();
                self.buffered = self.buffered.saturating_sub(freed + released);
            }
        }
        ready
    }

    /// Decides how the packet just processed is acknowledged
    pub(crate) fn end_packet(&mut self) -> AckState {
        if self.data_in_packet {
            self.packets_since_ack += 1;
            self.ack_state = if self.immediate_in_packet
                || self.sack_everytime
                || self.payload_queue.has_duplicates()
                || self.packets_since_ack >= 2
            {
                AckState::Immediate
            } else {
                AckState::Delay
            };
        } else if self.immediate_in_packet {
            self.ack_state = AckState::Immediate;
        }
        self.ack_state
    }

    pub(crate) fn create_selective_ack(&mut self) -> ChunkSelectiveAck {
        self.ack_state = AckState::Idle;
        self.packets_since_ack = 0;
        ChunkSelectiveAck {
            cumulative_tsn_ack: self.payload_queue.cumulative_tsn,
            advertised_receiver_window_credit: self.rwnd(),
            gap_ack_blocks: self.payload_queue.get_gap_ack_blocks(),
            duplicate_tsn: self.payload_queue.pop_duplicates(),
        }
    }

    pub(crate) fn gap_ack_blocks_string(&self) -> String {
        self.payload_queue.get_gap_ack_blocks_string()
    }
}
