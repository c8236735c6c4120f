use std::time::{Duration, Instant};

use tracing::info;

/// Wall-clock time spent in each named startup stage, in order.
#[derive(Debug, Default, Clone)]
pub struct StageTimer {
    stages: Vec<(&'static str, Duration)>,
}

impl StageTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f`, recording how long it took under `stage`.
    pub fn time<T>(&mut self, stage: &'static str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        self.stages.push((stage, start.elapsed()));
        out
    }

    pub fn stages(&self) -> &[(&'static str, Duration)] {
        &self.stages
    }

    pub fn total(&self) -> Duration {
        self.stages.iter().map(|(_, d)| *d).sum()
    }

    pub fn log(&self, rank: usize) {
        for (stage, elapsed) in &self.stages {
            info!(rank, stage, elapsed_ms = elapsed.as_millis() as u64, "startup stage");
        }
        info!(rank, total_ms = self.total().as_millis() as u64, "rank startup complete");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
