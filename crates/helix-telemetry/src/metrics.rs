//! In-process metric registry with Prometheus and JSON export

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Millisecond buckets for job and load latency
pub const LATENCY_BUCKETS: &[f64] = &[
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 30000.0,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistogramData {
    pub count: u64,
    pub sum: f64,
    pub mean: f64,
    pub buckets: Vec<(f64, u64)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub name: String,
    pub metric_type: MetricType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counter: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gauge: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub histogram: Option<HistogramData>,
    pub timestamp_ms: u64,
}

#[derive(Debug, Clone)]
pub struct Counter {
    name: String,
    value: Arc<AtomicU64>,
}

impl Counter {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), value: Arc::new(AtomicU64::new(0)) }
    }
    pub fn inc(&self) { self.value.fetch_add(1, Ordering::Relaxed); }
    pub fn inc_by(&self, n: u64) { self.value.fetch_add(n, Ordering::Relaxed); }
    pub fn get(&self) -> u64 { self.value.load(Ordering::Relaxed) }
    pub fn name(&self) -> &str { &self.name }
}

#[derive(Debug, Clone)]
pub struct Gauge {
    name: String,
    value: Arc<RwLock<f64>>,
}

impl Gauge {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), value: Arc::new(RwLock::new(0.0)) }
    }
    pub fn set(&self, value: f64) { *self.value.write() = value; }
    pub fn get(&self) -> f64 { *self.value.read() }
    pub fn name(&self) -> &str { &self.name }
}

#[derive(Debug, Clone)]
pub struct Histogram {
    name: String,
    inner: Arc<RwLock<HistogramInner>>,
}

#[derive(Debug)]
struct HistogramInner {
    buckets: Vec<f64>,
    bucket_counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl Histogram {
    pub fn new(name: &str, buckets: &[f64]) -> Self {
        let mut sorted = buckets.to_vec();
        sorted.sort_by(f64::total_cmp);
        let bucket_counts = vec![0; sorted.len()];
        Self {
            name: name.to_string(),
            inner: Arc::new(RwLock::new(HistogramInner { buckets: sorted, bucket_counts, sum: 0.0, count: 0 })),
        }
    }

    pub fn observe(&self, value: f64) {
        if value.is_nan() {
            return;
        }
        let mut inner = self.inner.write();
        inner.sum += value;
        inner.count += 1;
        let HistogramInner { buckets, bucket_counts, .. } = &mut *inner;
        for (bound, count) in buckets.iter().zip(bucket_counts.iter_mut()) {
            if value <= *bound {
                *count += 1;
            }
        }
    }

    pub fn count(&self) -> u64 { self.inner.read().count }
    pub fn sum(&self) -> f64 { self.inner.read().sum }
    pub fn mean(&self) -> f64 {
        let inner = self.inner.read();
        if inner.count == 0 { 0.0 } else { inner.sum / inner.count as f64 }
    }
    pub fn buckets(&self) -> Vec<(f64, u64)> {
        let inner = self.inner.read();
        inner.buckets.iter().copied().zip(inner.bucket_counts.iter().copied()).collect()
    }
    pub fn name(&self) -> &str { &self.name }
}

/// Registry of named metrics.
///
/// Each metric type lives in its own map, so a name reused across types
/// yields two independent series instead of a conflict.
#[derive(Debug, Default)]
pub struct MetricRegistry {
    counters: DashMap<String, Counter>,
    gauges: DashMap<String, Gauge>,
    histograms: DashMap<String, Histogram>,
}

impl MetricRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn counter(&self, name: &str) -> Counter {
        self.counters.entry(name.to_string()).or_insert_with(|| Counter::new(name)).clone()
    }

    pub fn gauge(&self, name: &str) -> Gauge {
        self.gauges.entry(name.to_string()).or_insert_with(|| Gauge::new(name)).clone()
    }

    pub fn histogram(&self, name: &str) -> Histogram {
        self.histograms
            .entry(name.to_string())
            .or_insert_with(|| Histogram::new(name, LATENCY_BUCKETS))
            .clone()
    }

    /// Snapshot sorted by name
    pub fn snapshot(&self) -> Vec<MetricSnapshot> {
        let timestamp_ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        let mut out: Vec<MetricSnapshot> = Vec::new();
        out.extend(self.counters.iter().map(|c| MetricSnapshot {
            name: c.name().to_string(),
            metric_type: MetricType::Counter,
            counter: Some(c.get()),
            gauge: None,
            histogram: None,
            timestamp_ms,
        }));
        out.extend(self.gauges.iter().map(|g| MetricSnapshot {
            name: g.name().to_string(),
            metric_type: MetricType::Gauge,
            counter: None,
            gauge: Some(g.get()),
            histogram: None,
            timestamp_ms,
        }));
        out.extend(self.histograms.iter().map(|h| MetricSnapshot {
            name: h.name().to_string(),
            metric_type: MetricType::Histogram,
            counter: None,
            gauge: None,
            histogram: Some(HistogramData { count: h.count(), sum: h.sum(), mean: h.mean(), buckets: h.buckets() }),
            timestamp_ms,
        }));
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();
        for snap in self.snapshot() {
            match snap.metric_type {
                MetricType::Counter => {
                    let _ = writeln!(output, "# TYPE {} counter", snap.name);
                    let _ = writeln!(output, "{} {}", snap.name, snap.counter.unwrap_or_default());
                }
                MetricType::Gauge => {
                    let _ = writeln!(output, "# TYPE {} gauge", snap.name);
                    let _ = writeln!(output, "{} {}", snap.name, snap.gauge.unwrap_or_default());
                }
                MetricType::Histogram => {
                    let Some(h) = snap.histogram else { continue };
                    let _ = writeln!(output, "# TYPE {} histogram", snap.name);
                    for (bound, count) in &h.buckets {
                        let _ = writeln!(output, "{}_bucket{{le=\"{}\"}} {}", snap.name, bound, count);
                    }
                    let _ = writeln!(output, "{}_bucket{{le=\"+Inf\"}} {}", snap.name, h.count);
                    let _ = writeln!(output, "{}_sum {}", snap.name, h.sum);
                    let _ = writeln!(output, "{}_count {}", snap.name, h.count);
                }
            }
        }
        output
    }

    pub fn export_json(&self) -> String {
        serde_json::to_string_pretty(&self.snapshot()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_counter_thread_safety() {
        let counter = Counter::new("test");
        let c1 = counter.clone();
        let c2 = counter.clone();
        let h1 = thread::spawn(move || { for _ in 0..1000 { c1.inc(); } });
        let h2 = thread::spawn(move || { for _ in 0..1000 { c2.inc_by(2); } });
        h1.join().unwrap();
        h2.join().unwrap();
        assert_eq!(counter.get(), 3000);
    }

    #[test]
    fn test_gauge_set() {
        let gauge = Gauge::new("queue_depth");
        gauge.set(42.5);
        assert_eq!(gauge.get(), 42.5);
    }

    #[test]
    fn test_histogram_buckets_are_cumulative() {
        let h = Histogram::new("latency", &[10.0, 1.0, 100.0]);
        h.observe(0.5);
        h.observe(5.0);
        h.observe(50.0);
        h.observe(f64::NAN);
        assert_eq!(h.count(), 3);
        assert_eq!(h.buckets(), vec![(1.0, 1), (10.0, 2), (100.0, 3)]);
        assert!((h.mean() - 55.5 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_registry_returns_shared_series() {
        let registry = MetricRegistry::new();
        registry.counter("jobs_completed").inc();
        registry.counter("jobs_completed").inc();
        assert_eq!(registry.counter("jobs_completed").get(), 2);
    }

    #[test]
    fn test_same_name_different_types_do_not_conflict() {
        let registry = MetricRegistry::new();
        registry.counter("evictions").inc();
        registry.gauge("evictions").set(7.0);
        assert_eq!(registry.counter("evictions").get(), 1);
        assert_eq!(registry.gauge("evictions").get(), 7.0);
    }

    #[test]
    fn test_prometheus_export() {
        let registry = MetricRegistry::new();
        registry.counter("allocations_total").inc_by(3);
        registry.gauge("queue_depth").set(2.0);
        registry.histogram("job_latency_ms").observe(12.0);

        let text = registry.export_prometheus();
        assert!(text.contains("# TYPE allocations_total counter"));
        assert!(text.contains("allocations_total 3"));
        assert!(text.contains("queue_depth 2"));
        assert!(text.contains("job_latency_ms_bucket{le=\"25\"} 1"));
        assert!(text.contains("job_latency_ms_count 1"));
    }

    #[test]
    fn test_json_export_is_sorted() {
        let registry = MetricRegistry::new();
        registry.counter("b").inc();
        registry.counter("a").inc();
        let snaps: Vec<MetricSnapshot> = serde_json::from_str(&registry.export_json()).unwrap();
        assert_eq!(snaps[0].name, "a");
        assert_eq!(snaps[1].name, "b");
    }
}
