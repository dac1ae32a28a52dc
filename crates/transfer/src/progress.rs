use std::collections::VecDeque;
use std::time::{Duration, Instant};

const DEFAULT_WINDOW: Duration = Duration::from_secs(5);
const DEFAULT_MAX_SAMPLES: usize = 100;

/// Sliding-window throughput estimate for one upload.
///
/// Owned by the task answering chunk requests, so it takes `&mut self`
/// and needs no locking.
#[derive(Debug)]
pub struct SpeedCalculator {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
    max_samples: usize,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeedCalculator {
    /// A calculator over the last 5 s, keeping at most 100 samples.
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW, DEFAULT_MAX_SAMPLES)
    }

    pub fn with_window(window: Duration, max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples.min(DEFAULT_MAX_SAMPLES)),
            window,
            max_samples: max_samples.max(1),
        }
    }

    /// Records that `bytes` were just sent.
    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    fn record_at(&mut self, now: Instant, bytes: u64) {
        self.samples.push_back((now, bytes));
        while let Some(&(at, _)) = self.samples.front() {
            let expired = now.duration_since(at) > self.window;
            if !expired && self.samples.len() <= self.max_samples {
                break;
            }
            self.samples.pop_front();
        }
    }

    /// Bytes per second across the retained samples; 0 until two
    /// samples with distinct timestamps exist.
    pub fn bytes_per_second(&self) -> f64 {
        let (Some(&(first, _)), Some(&(last, _))) = (self.samples.front(), self.samples.back())
        else {
            return 0.0;
        };
        let elapsed = last.duration_since(first);
        if elapsed.is_zero() {
            return 0.0;
        }
        let total: u64 = self.samples.iter().map(|&(_, bytes)| bytes).sum();
        total as f64 / elapsed.as_secs_f64()
    }

    /// Time left for `remaining` bytes at the current rate.
    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        (speed > 0.0).then(|| Duration::from_secs_f64(remaining as f64 / speed))
    }
}
