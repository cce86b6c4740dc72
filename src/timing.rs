//! Per-cycle latency instrumentation.
//!
//! Each cycle is split at the moment the frame finished arriving:
//! - transport: previous baseline -> frame read complete (wire + remote capture)
//! - processing: frame read complete -> output written (local work)
//!
//! The baseline for the next cycle is the read-complete instant, not the end
//! of processing. Since the ack goes out right after the read, the remote is
//! already capturing while processing runs, and transport time measures only
//! what the link and camera cost.

use std::fmt;
use std::time::{Duration, Instant};

/// Timing sample for one streaming cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CycleTiming {
    pub transport: Duration,
    pub processing: Duration,
}

impl CycleTiming {
    pub fn total(&self) -> Duration {
        self.transport + self.processing
    }

    /// Instantaneous rate bounded by the transport time; zero when unmeasurable.
    pub fn fps(&self) -> f64 {
        let transport_ms = duration_ms(self.transport);
        if transport_ms > 0.0 {
            1000.0 / transport_ms
        } else {
            0.0
        }
    }
}

impl fmt::Display for CycleTiming {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fps={:.2} | transport={:.2} ms | processing={:.2} ms | total={:.2} ms",
            self.fps(),
            duration_ms(self.transport),
            duration_ms(self.processing),
            duration_ms(self.total())
        )
    }
}

fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Chains cycle baselines across a session.
#[derive(Clone, Debug)]
pub struct CycleClock {
    baseline: Instant,
    read_done: Option<Instant>,
}

impl CycleClock {
    /// Start the clock; called right after the start token is drained.
    pub fn start() -> Self {
        Self::start_at(Instant::now())
    }

    pub fn start_at(baseline: Instant) -> Self {
        Self {
            baseline,
            read_done: None,
        }
    }

    pub fn baseline(&self) -> Instant {
        self.baseline
    }

    /// Mark the frame as fully received.
    pub fn mark_read(&mut self) {
        self.mark_read_at(Instant::now());
    }

    pub fn mark_read_at(&mut self, at: Instant) {
        self.read_done = Some(at);
    }

    /// Close the cycle once output is written and re-anchor on the read instant.
    pub fn finish(&mut self) -> CycleTiming {
        self.finish_at(Instant::now())
    }

    pub fn finish_at(&mut self, at: Instant) -> CycleTiming {
        let read_done = self.read_done.take().unwrap_or(at);
        let timing = CycleTiming {
            transport: read_done.saturating_duration_since(self.baseline),
            processing: at.saturating_duration_since(read_done),
        };
        self.baseline = read_done;
        timing
    }
}
