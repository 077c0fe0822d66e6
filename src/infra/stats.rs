//! In-process request statistics, served on `/stats`.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockWriteGuard};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Internally synchronized registry of label-keyed counters, label-keyed
/// timer aggregates and a status-code histogram.
#[derive(Debug, Default)]
pub struct Stats {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    counters: HashMap<String, u64>,
    timers: HashMap<String, TimerAggregate>,
    status_codes: HashMap<u16, u64>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct TimerAggregate {
    pub count: u64,
    pub total_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
}

impl TimerAggregate {
    fn observe(&mut self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1_000.0;
        if self.count == 0 || ms < self.min_ms {
            self.min_ms = ms;
        }
        if ms > self.max_ms {
            self.max_ms = ms;
        }
        self.count += 1;
        self.total_ms += ms;
        self.mean_ms = self.total_ms / self.count as f64;
    }
}

/// Point-in-time copy of the registry, serialized for `/stats`.
#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub counters: HashMap<String, u64>,
    pub timers: HashMap<String, TimerAggregate>,
    pub status_codes: HashMap<u16, u64>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, label: &str) {
        *self.write().counters.entry(label.to_string()).or_default() += 1;
    }

    pub fn record_status(&self, status: u16) {
        *self.write().status_codes.entry(status).or_default() += 1;
    }

    /// Folds the elapsed time since `started` into the labeled aggregate.
    pub fn measure_since(&self, label: &str, started: Instant) {
        self.write()
            .timers
            .entry(label.to_string())
            .or_default()
            .observe(started.elapsed());
    }

    pub fn counter(&self, label: &str) -> u64 {
        self.write().counters.get(label).copied().unwrap_or(0)
    }

    pub fn timer_count(&self, label: &str) -> u64 {
        self.write()
            .timers
            .get(label)
            .map(|timer| timer.count)
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.write();
        StatsSnapshot {
            counters: inner.counters.clone(),
            timers: inner.timers.clone(),
            status_codes: inner.status_codes.clone(),
        }
    }

    // A poisoned registry only means a panic mid-update; the counts stay
    // usable, so recover the guard instead of propagating.
    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
