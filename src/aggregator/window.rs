use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Statistic a windowed accumulator reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowedKind {
    /// Running sum.
    Counter,
    /// Running mean.
    Average,
    /// Running maximum.
    Peak,
}

#[derive(Debug, Clone, Copy)]
struct WindowState {
    start: Instant,
    sum: f64,
    max: f64,
    count: u64,
}

impl WindowState {
    fn fresh(start: Instant) -> Self {
        Self {
            start,
            sum: 0.0,
            max: f64::NEG_INFINITY,
            count: 0,
        }
    }
}

/// Accumulator that starts over once `window` has elapsed since its last
/// reset. The check happens lazily on each update.
#[derive(Debug)]
pub struct WindowedAccumulator {
    kind: WindowedKind,
    window: Duration,
    state: Mutex<WindowState>,
}

impl WindowedAccumulator {
    pub fn new(kind: WindowedKind, window: Duration) -> Self {
        Self::starting_at(kind, window, Instant::now())
    }

    pub fn starting_at(kind: WindowedKind, window: Duration, start: Instant) -> Self {
        Self {
            kind,
            window,
            state: Mutex::new(WindowState::fresh(start)),
        }
    }

    pub fn update(&self, sample: f64) -> f64 {
        self.update_at(sample, Instant::now())
    }

    /// Accumulates `sample` observed at `now` and returns the new value.
    pub fn update_at(&self, sample: f64, now: Instant) -> f64 {
        let mut state = self.state.lock();
        if now.saturating_duration_since(state.start) > self.window {
            *state = WindowState::fresh(now);
        }
        state.sum += sample;
        state.max = state.max.max(sample);
        state.count += 1;
        self.derive(&state)
    }

    /// Current value. Never resets the window.
    pub fn value(&self) -> f64 {
        self.derive(&self.state.lock())
    }

    fn derive(&self, state: &WindowState) -> f64 {
        if state.count == 0 {
            return 0.0;
        }
        match self.kind {
            WindowedKind::Counter => state.sum,
            WindowedKind::Average => state.sum / state.count as f64,
            WindowedKind::Peak => state.max,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    const WINDOW: Duration = Duration::from_secs(10);

    #[test]
    fn test_counter_sums_within_window_then_restarts() {
        let start = Instant::now();
        let counter = WindowedAccumulator::starting_at(WindowedKind::Counter, WINDOW, start);
        counter.update_at(5.0, start + Duration::from_secs(1));
        counter.update_at(10.0, start + Duration::from_secs(2));
        assert_eq!(counter.update_at(15.0, start + Duration::from_secs(3)), 30.0);
        assert_eq!(counter.value(), 30.0);

        let later = start + WINDOW + Duration::from_secs(1);
        assert_eq!(counter.update_at(7.0, later), 7.0);
    }

    #[test]
    fn test_window_boundary_is_inclusive() {
        let start = Instant::now();
        let counter = WindowedAccumulator::starting_at(WindowedKind::Counter, WINDOW, start);
        counter.update_at(1.0, start);
        assert_eq!(counter.update_at(1.0, start + WINDOW), 2.0);
    }

    #[test]
    fn test_average_and_peak() {
        let start = Instant::now();
        let average = WindowedAccumulator::starting_at(WindowedKind::Average, WINDOW, start);
        let peak = WindowedAccumulator::starting_at(WindowedKind::Peak, WINDOW, start);
        for v in [4.0, -2.0, 10.0] {
            average.update_at(v, start);
            peak.update_at(v, start);
        }
        assert_eq!(average.value(), 4.0);
        assert_eq!(peak.value(), 10.0);

        let later = start + WINDOW * 2;
        assert_eq!(peak.update_at(-3.0, later), -3.0);
    }

    #[test]
    fn test_empty_window_reads_zero() {
        let peak = WindowedAccumulator::new(WindowedKind::Peak, WINDOW);
        assert_eq!(peak.value(), 0.0);
    }

    #[test]
    fn test_concurrent_updates_lose_nothing() {
        let start = Instant::now();
        let counter = Arc::new(WindowedAccumulator::starting_at(
            WindowedKind::Counter,
            Duration::from_secs(3_600),
            start,
        ));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        counter.update_at(3.0, start);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().expect("thread panicked");
        }
        assert_eq!(counter.value(), 24_000.0);
    }
}
