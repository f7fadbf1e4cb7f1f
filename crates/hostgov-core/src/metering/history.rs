//! Bounded snapshot history and the rolling aggregates derived from it.

use std::collections::VecDeque;

use serde::Serialize;

use crate::config::DEFAULT_HISTORY_LIMIT;
use crate::metering::usage::ResourceUsage;

/// Fixed-capacity snapshot history; the oldest entry is evicted on overflow.
#[derive(Debug, Clone)]
pub struct UsageHistory {
    capacity: usize,
    samples: VecDeque<ResourceUsage>,
}

impl Default for UsageHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl UsageHistory {
    /// Creates an empty history. A zero capacity falls back to the default.
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_HISTORY_LIMIT
        } else {
            capacity
        };
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, usage: ResourceUsage) {
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(usage);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &ResourceUsage> {
        self.samples.iter()
    }

    /// Copies the samples out, oldest first.
    pub fn to_vec(&self) -> Vec<ResourceUsage> {
        self.samples.iter().cloned().collect()
    }
}

/// Average, minimum and maximum of one metric over the history window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Aggregate {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

impl Aggregate {
    /// Aggregates `values`; an empty input yields all zeros.
    pub fn of(values: impl IntoIterator<Item = f64>) -> Self {
        let mut count = 0usize;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for v in values {
            count += 1;
            sum += v;
            min = min.min(v);
            max = max.max(v);
        }
        if count == 0 {
            return Self::default();
        }
        Self {
            avg: sum / count as f64,
            min,
            max,
        }
    }
}

/// Rolling aggregates per resource category.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageStats {
    pub samples: usize,
    /// Process CPU percent.
    pub cpu_percent: Aggregate,
    pub memory_percent: Aggregate,
    pub disk_percent: Aggregate,
    pub net_bytes_sent: Aggregate,
    pub net_bytes_recv: Aggregate,
}

impl UsageStats {
    /// Recomputes every aggregate from the full window.
    pub fn from_history(history: &UsageHistory) -> Self {
        Self {
            samples: history.len(),
            cpu_percent: Aggregate::of(history.iter().map(|u| u.cpu.usage)),
            memory_percent: Aggregate::of(history.iter().map(|u| u.memory.percent)),
            disk_percent: Aggregate::of(history.iter().map(|u| u.disk.percent)),
            net_bytes_sent: Aggregate::of(history.iter().map(|u| u.network.bytes_sent as f64)),
            net_bytes_recv: Aggregate::of(history.iter().map(|u| u.network.bytes_recv as f64)),
        }
    }
}
