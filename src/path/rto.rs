const RTO_ALPHA: u64 = 1;
const RTO_BETA: u64 = 2;
const RTO_BASE: u64 = 8;
/// Clock granularity G in msec
const CLOCK_GRANULARITY: f64 = 1.0;

/// rtoManager manages Rtx timeout values of one destination.
/// This is an implementation of RFC 4960 sec 6.3.1.
#[derive(Default, Debug, Clone)]
pub(crate) struct RtoManager {
    pub(crate) srtt: u64,
    pub(crate) rttvar: f64,
    pub(crate) rto: u64,
    rto_min: u64,
    rto_max: u64,
}

impl RtoManager {
    pub(crate) fn new(rto_initial: u64, rto_min: u64, rto_max: u64) -> Self {
        RtoManager {
            rto: rto_initial,
            rto_min,
            rto_max,
            ..Default::default()
        }
    }

    /// set_new_rtt takes a newly measured RTT then adjust the RTO in msec.
    pub(crate) fn set_new_rtt(&mut self, rtt: u64) -> u64 {
        if self.srtt == 0 {
            // C2)  When the first RTT measurement R is made, set
            //      SRTT <- R, RTTVAR <- R/2, and RTO <- SRTT + 4 * RTTVAR.
            self.srtt = rtt;
            self.rttvar = rtt as f64 / 2.0;
        } else {
            // C3)  When a new RTT measurement R' is made, set
            //      RTTVAR <- (1 - RTO.Beta) * RTTVAR + RTO.Beta * |SRTT - R'|
            //      and
            //      SRTT <- (1 - RTO.Alpha) * SRTT + RTO.Alpha * R'
            self.rttvar = ((RTO_BASE - RTO_BETA) as f64 * self.rttvar
                + RTO_BETA as f64 * (self.srtt as i64 - rtt as i64).abs() as f64)
                / RTO_BASE as f64;
            self.srtt = ((RTO_BASE - RTO_ALPHA) * self.srtt + RTO_ALPHA * rtt) / RTO_BASE;
        }

        // C4)  When data is in flight and when allowed by rule C5 below, a new
        //      RTT measurement MUST be made each round trip.
        //      G is the clock granularity; RTTVAR never drops below it.
        if self.rttvar < CLOCK_GRANULARITY {
            self.rttvar = CLOCK_GRANULARITY;
        }

        self.rto = self.clamp(self.srtt + (4.0 * self.rttvar) as u64);

        self.srtt
    }

    /// get_rto simply returns the current RTO in msec.
    pub(crate) fn get_rto(&self) -> u64 {
        self.rto
    }

    pub(crate) fn rto_max(&self) -> u64 {
        self.rto_max
    }

    /// E2) set RTO <- RTO * 2 ("back off the timer"), bounded by RTO.Max
    pub(crate) fn backoff(&mut self) {
        self.rto = std::cmp::min(self.rto.saturating_mul(2), self.rto_max);
    }

    fn clamp(&self, rto: u64) -> u64 {
        std::cmp::min(std::cmp::max(rto, self.rto_min), self.rto_max)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_rto_manager_initial_values() {
        let m = RtoManager::new(3000, 1000, 60000);
        assert_eq!(m.get_rto(), 3000, "should be rto.initial");
        assert_eq!(m.srtt, 0, "should be 0");
        assert_eq!(m.rttvar, 0.0, "should be 0.0");
    }

    #[test]
    fn test_rto_manager_rto_calculation_small_rtt() {
        let mut m = RtoManager::new(3000, 1000, 60000);
        let exp = [
            1800, 1500, 1275, 1106, 1000, // capped at RTO.Min
        ];

        for (i, e) in exp.iter().enumerate() {
            m.set_new_rtt(600);
            let rto = m.get_rto();
            assert_eq!(rto, *e, "should be equal: {i}");
        }
    }

    #[test]
    fn test_rto_manager_rto_calculation_large_rtt() {
        let mut m = RtoManager::new(3000, 1000, 60000);
        let exp = [
            60000, // capped at RTO.Max
            60000, // capped at RTO.Max
            60000, // capped at RTO.Max
            55312, 48984,
        ];

        for (i, e) in exp.iter().enumerate() {
            m.set_new_rtt(30000);
            let rto = m.get_rto();
            assert_eq!(rto, *e, "should be equal: {i}");
        }
    }

    #[test]
    fn test_rto_manager_backoff() {
        let mut m = RtoManager::new(3000, 1000, 10000);
        m.backoff();
        assert_eq!(m.get_rto(), 6000);
        m.backoff();
        assert_eq!(m.get_rto(), 10000, "backoff is bounded by RTO.Max");

        m.set_new_rtt(100);
        assert_eq!(m.get_rto(), 1000, "small RTT is raised to RTO.Min");
    }
}
