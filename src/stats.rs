//! Command latency statistics
//!
//! Process-wide latency distributions for lookups, iterations and commits,
//! shared by every connection and rendered into a process-title line.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// How many recent samples are kept for percentile estimates.
/// This acts as a circular buffer.
pub const STATS_SAMPLE_LEN: usize = 1024;

/// Latency distribution in microseconds
#[derive(Debug, Clone, Default)]
pub struct StatsDist {
    count: u64,
    sum: u64,
    min: u64,
    max: u64,
    samples: VecDeque<u64>,
}

impl StatsDist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one latency sample
    pub fn add(&mut self, usecs: u64) {
        if self.count == 0 || usecs < self.min {
            self.min = usecs;
        }
        if usecs > self.max {
            self.max = usecs;
        }
        self.count += 1;
        self.sum = self.sum.saturating_add(usecs);
        if self.samples.len() == STATS_SAMPLE_LEN {
            self.samples.pop_front();
        }
        self.samples.push_back(usecs);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> u64 {
        self.sum
    }

    pub fn min(&self) -> u64 {
        self.min
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn avg(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.sum / self.count
        }
    }

    /// Nearest-rank percentile over the recent samples (`q` in 0.0..=1.0)
    pub fn percentile(&self, q: f64) -> u64 {
        if self.samples.is_empty() {
            return 0;
        }
        let mut sorted: Vec<u64> = self.samples.iter().copied().collect();
        sorted.sort_unstable();
        let rank = (q.clamp(0.0, 1.0) * sorted.len() as f64).ceil() as usize;
        sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
    }
}

/// Which distribution a completed command feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatKind {
    Lookup,
    Iteration,
    Commit,
}

/// Stats shared across all connections of a process
#[derive(Debug, Default)]
pub struct CommandStats {
    lookups: Mutex<StatsDist>,
    iterations: Mutex<StatsDist>,
    commits: Mutex<StatsDist>,
    clients: AtomicUsize,
}

impl CommandStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn dist(&self, kind: StatKind) -> &Mutex<StatsDist> {
        match kind {
            StatKind::Lookup => &self.lookups,
            StatKind::Iteration => &self.iterations,
            StatKind::Commit => &self.commits,
        }
    }

    /// Add one latency sample
    pub fn record(&self, kind: StatKind, usecs: u64) {
        self.dist(kind).lock().add(usecs);
    }

    /// Copy of one distribution
    pub fn snapshot(&self, kind: StatKind) -> StatsDist {
        self.dist(kind).lock().clone()
    }

    pub fn client_connected(&self) {
        self.clients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_disconnected(&self) {
        // Never wraps below zero even if calls are unbalanced.
        let _ = self
            .clients
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn clients(&self) -> usize {
        self.clients.load(Ordering::Relaxed)
    }

    /// `[N clients, L lookups:min/avg/95%/max, ...]`
    pub fn proctitle(&self) -> String {
        let mut title = format!("[{} clients", self.clients());
        for (name, kind) in [
            ("lookups", StatKind::Lookup),
            ("iters", StatKind::Iteration),
            ("commits", StatKind::Commit),
        ] {
            let dist = self.snapshot(kind);
            title.push_str(&format!(
                ", {} {}:{}/{}/{}/{}",
                dist.count(),
                name,
                dist.min(),
                dist.avg(),
                dist.percentile(0.95),
                dist.max()
            ));
        }
        title.push(']');
        title
    }
}
