//! Per-request phase timing.

use std::fmt;
use std::time::Duration;

/// The four timed phases of one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Wait,
    Load,
    Ingest,
    Infer,
}

/// Timings and token count for a single request.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StatisticsSnapshot {
    pub wait: Duration,
    pub load: Duration,
    pub ingest: Duration,
    pub infer: Duration,
    pub tokens: usize,
}

impl StatisticsSnapshot {
    pub fn total(&self) -> Duration {
        self.wait + self.load + self.ingest + self.infer
    }

    /// Seconds per counted token, `NaN` when nothing was counted.
    pub fn time_per_token(&self) -> f64 {
        if self.tokens == 0 {
            f64::NAN
        } else {
            self.total().as_secs_f64() / self.tokens as f64
        }
    }
}

impl fmt::Display for StatisticsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f)?;
        writeln!(f, "{{END}}")?;
        writeln!(f, "Wait Time  (sec): {:.2}", self.wait.as_secs_f64())?;
        writeln!(f, "Model Load (sec): {:.2}", self.load.as_secs_f64())?;
        writeln!(f, "Ingestion  (sec): {:.2}", self.ingest.as_secs_f64())?;
        writeln!(f, "Inference  (sec): {:.2}", self.infer.as_secs_f64())?;
        writeln!(f, "Total Time (sec): {:.2}", self.total().as_secs_f64())?;
        let per_token = self.time_per_token();
        if per_token.is_nan() {
            writeln!(f, "Token Time (sec): NaN")?;
        } else {
            writeln!(f, "Token Time (sec): {:.2}", per_token)?;
        }
        writeln!(f, "Num Tokens (int): {}", self.tokens)
    }
}

/// Accumulates phase timings for one request. Never shared between
/// requests; the pipeline creates one per call.
#[derive(Debug, Default)]
pub struct StatisticsRecorder {
    snapshot: StatisticsSnapshot,
}

impl StatisticsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero every phase and the token counter.
    pub fn reset(&mut self) {
        self.snapshot = StatisticsSnapshot::default();
    }

    /// Add `elapsed` to `phase`.
    pub fn record(&mut self, phase: Phase, elapsed: Duration) {
        let slot = match phase {
            Phase::Wait => &mut self.snapshot.wait,
            Phase::Load => &mut self.snapshot.load,
            Phase::Ingest => &mut self.snapshot.ingest,
            Phase::Infer => &mut self.snapshot.infer,
        };
        *slot += elapsed;
    }

    pub fn count_token(&mut self) {
        self.snapshot.tokens += 1;
    }

    pub fn tokens(&self) -> usize {
        self.snapshot.tokens
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        self.snapshot
    }

    /// Human-readable summary block, appended to the output stream.
    pub fn render(&self) -> String {
        self.snapshot.to_string()
    }
}
