//! MetricsSink port - カウンタとタイマー
//!
//! ラベルは `(key, value)` の小さな配列。実装は Prometheus でも StatsD でもよい。

use std::time::Duration;

pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &'static str, labels: &[(&'static str, &str)]);

    fn record_duration(&self, name: &'static str, labels: &[(&'static str, &str)], value: Duration);
}
