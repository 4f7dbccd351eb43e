use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stats {
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub p50: u64,
    pub p90: u64,
    pub p99: u64,
    pub p999: u64,
    pub count: usize,
}

/// Sorts `samples` in place. `None` when there is nothing to summarize.
pub fn compute_stats(samples: &mut [u64]) -> Option<Stats> {
    if samples.is_empty() {
        return None;
    }
    samples.sort_unstable();

    let count = samples.len();
    let sum: u128 = samples.iter().map(|&x| x as u128).sum();

    Some(Stats {
        min: samples[0],
        max: samples[count - 1],
        mean: sum as f64 / count as f64,
        p50: percentile_sorted(samples, 50.0),
        p90: percentile_sorted(samples, 90.0),
        p99: percentile_sorted(samples, 99.0),
        p999: percentile_sorted(samples, 99.9),
        count,
    })
}

fn percentile_sorted(sorted: &[u64], pct: f64) -> u64 {
    let len = sorted.len();
    if len == 1 {
        return sorted[0];
    }
    let rank = (pct / 100.0 * len as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(len - 1);
    sorted[idx]
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsumerReport {
    pub id: usize,
    pub items: u64,
    pub reclaims: u64,
    pub timeouts: u64,
    pub elapsed_ms: f64,
    pub items_per_sec: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub mode: String,
    pub strategy: String,
    pub capacity: usize,
    pub enqueued: u64,
    /// CSV lines that could not be parsed.
    pub malformed: u64,
    /// Sequence numbers the producer gave up on.
    pub gaps: u64,
    /// Matched dequeues, sentinels included.
    pub completed: u64,
    pub elapsed_ms: f64,
    pub items_per_sec: f64,
    pub consumers: Vec<ConsumerReport>,
    /// Time spent in each successful dequeue call, in nanoseconds.
    pub dequeue_latency_ns: Option<Stats>,
}

impl RunReport {
    pub fn log(&self) {
        tracing::info!(
            mode = %self.mode,
            strategy = %self.strategy,
            enqueued = self.enqueued,
            completed = self.completed,
            gaps = self.gaps,
            malformed = self.malformed,
            elapsed_ms = self.elapsed_ms,
            items_per_sec = self.items_per_sec,
            "run finished"
        );
        for c in &self.consumers {
            tracing::info!(
                consumer = c.id,
                items = c.items,
                reclaims = c.reclaims,
                timeouts = c.timeouts,
                items_per_sec = c.items_per_sec,
                "consumer finished"
            );
        }
        if let Some(l) = &self.dequeue_latency_ns {
            tracing::info!(
                p50 = l.p50,
                p90 = l.p90,
                p99 = l.p99,
                p999 = l.p999,
                max = l.max,
                "dequeue latency (ns)"
            );
        }
    }

    pub fn write_json(&self, path: &Path) -> anyhow::Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
}

pub fn rate(items: u64, elapsed_ms: f64) -> f64 {
    if elapsed_ms > 0.0 {
        items as f64 / (elapsed_ms / 1_000.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentiles_use_nearest_rank() {
        let mut samples: Vec<u64> = (1..=100).rev().collect();
        let s = compute_stats(&mut samples).unwrap();
        assert_eq!((s.min, s.max, s.count), (1, 100, 100));
        assert_eq!((s.p50, s.p90, s.p99, s.p999), (50, 90, 99, 100));
        assert_eq!(s.mean, 50.5);
    }

    #[test]
    fn empty_samples_have_no_stats() {
        assert_eq!(compute_stats(&mut []), None);
        assert_eq!(compute_stats(&mut [7]).unwrap().p999, 7);
    }

    #[test]
    fn rate_guards_zero_elapsed() {
        assert_eq!(rate(10, 0.0), 0.0);
        assert_eq!(rate(10, 500.0), 20.0);
    }
}
