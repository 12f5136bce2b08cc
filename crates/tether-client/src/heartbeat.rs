use std::time::Duration;

use tether_core::protocol::Envelope;

/// Application-level liveness check.
///
/// Only measures. There is no pong deadline: a dead peer is noticed when
/// the transport closes or errors.
#[derive(Debug)]
pub struct HeartbeatTracker {
    interval: Duration,
    last_ping_ms: Option<i64>,
    rtt_ms: Option<i64>,
}

impl HeartbeatTracker {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_ping_ms: None,
            rtt_ms: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Build the next ping and remember its send time.
    pub fn ping(&mut self) -> Envelope {
        let ping = Envelope::ping();
        self.last_ping_ms = Some(ping.timestamp);
        ping
    }

    /// Measure the round trip from a pong. `None` if no ping is outstanding.
    pub fn on_pong(&mut self, pong: &Envelope) -> Option<i64> {
        let sent = self.last_ping_ms?;
        let rtt = pong.timestamp - sent;
        self.rtt_ms = Some(rtt);
        Some(rtt)
    }

    pub fn rtt_ms(&self) -> Option<i64> {
        self.rtt_ms
    }

    /// Forget the outstanding ping. The last RTT is kept for status reports.
    pub fn stop(&mut self) {
        self.last_ping_ms = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtt_is_pong_time_minus_ping_time() {
        let mut hb = HeartbeatTracker::new(Duration::from_secs(15));
        let ping = hb.ping();

        let mut pong = Envelope::pong().reply_to(ping.id.clone());
        pong.timestamp = ping.timestamp + 87;

        assert_eq!(hb.on_pong(&pong), Some(87));
        assert_eq!(hb.rtt_ms(), Some(87));
    }

    #[test]
    fn pong_without_ping_is_ignored() {
        let mut hb = HeartbeatTracker::new(Duration::from_secs(15));
        assert_eq!(hb.on_pong(&Envelope::pong()), None);

        hb.ping();
        hb.stop();
        assert_eq!(hb.on_pong(&Envelope::pong()), None);
        assert_eq!(hb.rtt_ms(), None);
    }
}
