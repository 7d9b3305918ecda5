use std::collections::VecDeque;
use std::time::{Duration, Instant};

const WINDOW: usize = 3;

/// Adaptive pacing for outgoing frames.
///
/// Remembers the last three send instants. A burst of three lines inside two
/// seconds costs a full second, two lines inside one second cost half a
/// second, anything calmer gets the quarter-second baseline.
#[derive(Debug, Default)]
pub struct FloodGate {
    recent: VecDeque<Instant>,
}

impl FloodGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a send at `now` and return how long to pause before the next one.
    pub fn record(&mut self, now: Instant) -> Duration {
        if self.recent.len() == WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(now);

        let newest = now;
        if self.recent.len() == WINDOW {
            if let Some(oldest) = self.recent.front() {
                if newest.duration_since(*oldest) < Duration::from_secs(2) {
                    return Duration::from_secs(1);
                }
            }
        }
        if self.recent.len() >= 2 {
            let previous = self.recent[self.recent.len() - 2];
            if newest.duration_since(previous) < Duration::from_secs(1) {
                return Duration::from_millis(500);
            }
        }
        Duration::from_millis(250)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_send_gets_baseline() {
        let mut gate = FloodGate::new();
        assert_eq!(gate.record(Instant::now()), Duration::from_millis(250));
    }

    #[test]
    fn quick_pair_costs_half_second() {
        let mut gate = FloodGate::new();
        let t0 = Instant::now();
        gate.record(t0);
        assert_eq!(
            gate.record(t0 + Duration::from_millis(300)),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn burst_of_three_costs_full_second() {
        let mut gate = FloodGate::new();
        let t0 = Instant::now();
        gate.record(t0);
        gate.record(t0 + Duration::from_millis(600));
        assert_eq!(
            gate.record(t0 + Duration::from_millis(1500)),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn spaced_sends_stay_at_baseline() {
        let mut gate = FloodGate::new();
        let t0 = Instant::now();
        for i in 0..6 {
            let delay = gate.record(t0 + Duration::from_millis(1500 * i));
            assert_eq!(delay, Duration::from_millis(250));
        }
    }

    #[test]
    fn window_slides() {
        let mut gate = FloodGate::new();
        let t0 = Instant::now();
        gate.record(t0);
        gate.record(t0 + Duration::from_millis(100));
        gate.record(t0 + Duration::from_millis(200));
        // t0 has left the window; the burst now spans 2.1s.
        assert_eq!(
            gate.record(t0 + Duration::from_millis(2200)),
            Duration::from_millis(250)
        );
    }
}
