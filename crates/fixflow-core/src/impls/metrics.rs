//! MetricsSink implementations.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::ports::MetricsSink;

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn increment(&self, _name: &'static str, _labels: &[(&'static str, &str)]) {}

    fn record_duration(
        &self,
        _name: &'static str,
        _labels: &[(&'static str, &str)],
        _value: Duration,
    ) {
    }
}

/// Keeps counters and timings in memory, keyed by `name{k=v,...}`.
#[derive(Debug, Default)]
pub struct InMemoryMetricsSink {
    counters: Mutex<BTreeMap<String, u64>>,
    durations: Mutex<BTreeMap<String, Vec<Duration>>>,
}

impl InMemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key(name, labels))
            .copied()
            .unwrap_or(0)
    }

    /// Sum of a counter over every label combination.
    pub fn counter_total(&self, name: &str) -> u64 {
        let prefix = format!("{name}{{");
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(k, _)| k.as_str() == name || k.starts_with(&prefix))
            .map(|(_, v)| v)
            .sum()
    }

    pub fn durations(&self, name: &str, labels: &[(&str, &str)]) -> Vec<Duration> {
        self.durations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key(name, labels))
            .cloned()
            .unwrap_or_default()
    }

    pub fn counters(&self) -> BTreeMap<String, u64> {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl MetricsSink for InMemoryMetricsSink {
    fn increment(&self, name: &'static str, labels: &[(&'static str, &str)]) {
        *self
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key(name, labels))
            .or_insert(0) += 1;
    }

    fn record_duration(&self, name: &'static str, labels: &[(&'static str, &str)], value: Duration) {
        self.durations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key(name, labels))
            .or_default()
            .push(value);
    }
}

fn key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut sorted: Vec<_> = labels.to_vec();
    sorted.sort();
    let body: Vec<String> = sorted.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{name}{{{}}}", body.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_keyed_by_sorted_labels() {
        let sink = InMemoryMetricsSink::new();
        sink.increment("stage_calls", &[("stage", "resolve"), ("outcome", "success")]);
        sink.increment("stage_calls", &[("outcome", "success"), ("stage", "resolve")]);
        sink.increment("stage_calls", &[("stage", "review"), ("outcome", "success")]);

        assert_eq!(
            sink.counter("stage_calls", &[("stage", "resolve"), ("outcome", "success")]),
            2
        );
        assert_eq!(sink.counter_total("stage_calls"), 3);
        assert_eq!(sink.counter("missing", &[]), 0);
    }

    #[test]
    fn durations_accumulate() {
        let sink = InMemoryMetricsSink::new();
        sink.record_duration("stage_latency", &[("stage", "analyze")], Duration::from_millis(5));
        sink.record_duration("stage_latency", &[("stage", "analyze")], Duration::from_millis(7));
        assert_eq!(sink.durations("stage_latency", &[("stage", "analyze")]).len(), 2);
    }
}
