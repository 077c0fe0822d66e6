//! Simplistic per-request tracer.

use std::time::Instant;

use tracing::info;

/// Records labeled events over the lifetime of a single request and emits
/// them as a log table on demand. A disabled stopwatch is a no-op and a
/// stopwatch never influences the response.
#[derive(Debug, Default)]
pub struct StopWatch {
    enabled: bool,
    entries: Vec<Entry>,
}

#[derive(Debug)]
struct Entry {
    at: Instant,
    message: String,
}

impl StopWatch {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            entries: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Records a labeled event at the current instant.
    pub fn record(&mut self, message: impl Into<String>) {
        if !self.enabled {
            return;
        }
        self.entries.push(Entry {
            at: Instant::now(),
            message: message.into(),
        });
    }

    /// Emits one log line per recorded event with elapsed-since-previous,
    /// elapsed-since-start and the share of total request time.
    pub fn log_table(&self) {
        if !self.enabled || self.entries.is_empty() {
            return;
        }
        let started = self.entries[0].at;
        let total = self
            .entries
            .last()
            .map(|entry| entry.at.duration_since(started))
            .unwrap_or_default();
        let mut previous = started;
        for (step, entry) in self.entries.iter().enumerate() {
            let since_previous = entry.at.duration_since(previous);
            let since_start = entry.at.duration_since(started);
            let share = if total.as_secs_f64() > 0.0 {
                100.0 * since_previous.as_secs_f64() / total.as_secs_f64()
            } else {
                0.0
            };
            info!(
                target: "legame::stopwatch",
                step,
                since_previous_us = since_previous.as_micros() as u64,
                since_start_us = since_start.as_micros() as u64,
                share_pct = share,
                "{}",
                entry.message
            );
            previous = entry.at;
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}
