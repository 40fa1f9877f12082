use crate::path::PathId;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Every timer an association can run. Per-destination timers carry their path.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub(crate) enum Timer {
    T1Init,
    T1Cookie,
    T2Shutdown,
    Ack,
    T3Rtx(PathId),
    Heartbeat(PathId),
}

/// Deadlines of the running timers of one association
///
/// A stopped timer has no entry; a table that was cleared on teardown never fires again.
#[derive(Debug, Clone, Default)]
pub(crate) struct TimerTable {
    data: BTreeMap<Timer, Instant>,
}

impl TimerTable {
    pub fn new() -> Self {
        TimerTable::default()
    }

    pub fn is_running(&self, timer: Timer) -> bool {
        self.data.contains_key(&timer)
    }

    pub fn next_timeout(&self) -> Option<Instant> {
        self.data.values().min().copied()
    }

    /// (Re)starts `timer` to fire `interval` msec after `now`
    pub fn start(&mut self, timer: Timer, now: Instant, interval: u64) {
        self.data.insert(timer, now + Duration::from_millis(interval));
    }

    pub fn stop(&mut self, timer: Timer) {
        self.data.remove(&timer);
    }

    /// Stops every per-destination timer of `path`
    pub fn stop_path(&mut self, path: PathId) {
        self.stop(Timer::T3Rtx(path));
        self.stop(Timer::Heartbeat(path));
    }

    pub fn stop_all(&mut self) {
        self.data.clear();
    }

    /// Timers due at `now`, earliest first. They stay in the table until expired.
    pub fn due(&self, now: Instant) -> Vec<Timer> {
        let mut due: Vec<(Instant, Timer)> = self
            .data
            .iter()
            .filter(|(_, &t)| t <= now)
            .map(|(&timer, &t)| (t, timer))
            .collect();
        due.sort();
        due.into_iter().map(|(_, timer)| timer).collect()
    }

    /// Removes `timer` if it is still running and due at `now`
    pub fn expire(&mut self, timer: Timer, now: Instant) -> bool {
        match self.data.get(&timer) {
            Some(&t) if t <= now => {
                self.data.remove(&timer);
                true
            }
            _ => false,
        }
    }
}
