//! Heartbeat monitor
//!
//! Keeps the timer and acknowledgement bookkeeping for one connection. The
//! shard runner polls [`Heartbeater::tick`] from its select loop and turns a
//! [`Beat`] into either an outbound heartbeat or a liveness failure.

use std::future::pending;
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Outcome of a beat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Beat {
    /// Send a heartbeat now.
    Send,
    /// The previous heartbeat was never acknowledged.
    Missed,
}

#[derive(Debug, Default)]
pub struct Heartbeater {
    interval: Option<Interval>,
    last_sent: Option<Instant>,
    latency: Option<Duration>,
    acknowledged: bool,
}

impl Heartbeater {
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)start periodic firing. The first tick lands one full period from now.
    pub fn start(&mut self, period: Duration) {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.interval = Some(interval);
        self.last_sent = None;
        self.acknowledged = true;
    }

    pub fn is_running(&self) -> bool {
        self.interval.is_some()
    }

    /// Resolves on the next scheduled beat; never resolves while stopped.
    pub async fn tick(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => pending::<()>().await,
        }
    }

    /// Decide whether a heartbeat can go out.
    ///
    /// With `ignore_if_unacked` the acknowledgement check is skipped; this is
    /// used when the remote asks for a beat or right after a handshake.
    pub fn beat(&mut self, ignore_if_unacked: bool) -> Beat {
        if !self.acknowledged && !ignore_if_unacked {
            return Beat::Missed;
        }
        self.acknowledged = false;
        self.last_sent = Some(Instant::now());
        Beat::Send
    }

    /// Record an acknowledgement and return the measured round trip.
    pub fn acknowledge(&mut self) -> Option<Duration> {
        self.acknowledged = true;
        let latency = self.last_sent.map(|sent| sent.elapsed());
        if latency.is_some() {
            self.latency = latency;
        }
        self.latency
    }

    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged
    }

    /// Stop the timer and forget everything.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
