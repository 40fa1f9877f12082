pub(crate) mod payload_queue;
pub(crate) mod retransmission_queue;
