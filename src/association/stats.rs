/// Association statistics
#[derive(Default, Debug, Copy, Clone)]
pub struct AssociationStats {
    n_datas_sent: u64,
    n_datas_received: u64,
    n_sacks_sent: u64,
    n_sacks_received: u64,
    n_t3timeouts: u64,
    n_ack_timeouts: u64,
    n_fast_retrans: u64,
    n_forward_tsns: u64,
}

impl AssociationStats {
    pub fn inc_datas_sent(&mut self) {
        self.n_datas_sent += 1;
    }

    pub fn get_num_datas_sent(&self) -> u64 {
        self.n_datas_sent
    }

    pub fn inc_datas_received(&mut self) {
        self.n_datas_received += 1;
    }

    pub fn get_num_datas_received(&self) -> u64 {
        self.n_datas_received
    }

    pub fn inc_sacks_sent(&mut self) {
        self.n_sacks_sent += 1;
    }

    pub fn get_num_sacks_sent(&self) -> u64 {
        self.n_sacks_sent
    }

    pub fn inc_sacks_received(&mut self) {
        self.n_sacks_received += 1;
    }

    pub fn get_num_sacks_received(&self) -> u64 {
        self.n_sacks_received
    }

    pub fn inc_t3timeouts(&mut self) {
        self.n_t3timeouts += 1;
    }

    pub fn get_num_t3timeouts(&self) -> u64 {
        self.n_t3timeouts
    }

    pub fn inc_ack_timeouts(&mut self) {
        self.n_ack_timeouts += 1;
    }

    pub fn get_num_ack_timeouts(&self) -> u64 {
        self.n_ack_timeouts
    }

    pub fn inc_fast_retrans(&mut self) {
        self.n_fast_retrans += 1;
    }

    pub fn get_num_fast_retrans(&self) -> u64 {
        self.n_fast_retrans
    }

    pub fn inc_forward_tsns(&mut self) {
        self.n_forward_tsns += 1;
    }

    pub fn get_num_forward_tsns(&self) -> u64 {
        self.n_forward_tsns
    }

    pub fn reset(&mut self) {
        *self = AssociationStats::default();
    }
}
