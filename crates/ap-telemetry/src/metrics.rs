use ahash::AHashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{OnceLock, PoisonError, RwLock};

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Sorted `key=value` pairs distinguishing series of one counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        v.sort();
        Self(v)
    }

    /// `{key="value",...}`, or the empty string when there are no labels.
    pub fn prometheus_str(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let inner: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{k}=\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\"")))
            .collect();
        format!("{{{}}}", inner.join(","))
    }
}

// ---------------------------------------------------------------------------
// MetricsCollector
// ---------------------------------------------------------------------------

/// Process-wide counters and gauges.
///
/// Series are registered lazily on first use. Values are atomics, so the
/// maps only take a write lock when a new series appears.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    counters: RwLock<AHashMap<(String, Labels), AtomicU64>>,
    gauges: RwLock<AHashMap<String, AtomicI64>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Counters -----------------------------------------------------------

    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.increment_counter_by(name, labels, 1);
    }

    pub fn increment_counter_by(&self, name: &str, labels: &[(&str, &str)], amount: u64) {
        let key = (name.to_string(), Labels::new(labels));
        {
            let map = self.counters.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(c) = map.get(&key) {
                c.fetch_add(amount, Ordering::Relaxed);
                return;
            }
        }
        let mut map = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(amount, Ordering::Relaxed);
    }

    pub fn get_counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = (name.to_string(), Labels::new(labels));
        self.counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // -- Gauges -------------------------------------------------------------

    pub fn set_gauge(&self, name: &str, value: i64) {
        {
            let map = self.gauges.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(g) = map.get(name) {
                g.store(value, Ordering::Relaxed);
                return;
            }
        }
        let mut map = self.gauges.write().unwrap_or_else(PoisonError::into_inner);
        map.entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .store(value, Ordering::Relaxed);
    }

    pub fn get_gauge(&self, name: &str) -> i64 {
        self.gauges
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // -- Export --------------------------------------------------------------

    /// Prometheus text exposition format, series sorted by name.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();

        {
            let map = self.counters.read().unwrap_or_else(PoisonError::into_inner);
            let mut series: Vec<(&String, &Labels, u64)> = map
                .iter()
                .map(|((name, labels), v)| (name, labels, v.load(Ordering::Relaxed)))
                .collect();
            series.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

            let mut last_name: Option<&String> = None;
            for (name, labels, value) in series {
                if last_name != Some(name) {
                    out.push_str(&format!("# TYPE {name} counter\n"));
                    last_name = Some(name);
                }
                out.push_str(&format!("{name}{} {value}\n", labels.prometheus_str()));
            }
        }

        {
            let map = self.gauges.read().unwrap_or_else(PoisonError::into_inner);
            let mut names: Vec<&String> = map.keys().collect();
            names.sort();
            for name in names {
                let value = map[name].load(Ordering::Relaxed);
                out.push_str(&format!("# TYPE {name} gauge\n{name} {value}\n"));
            }
        }

        out
    }

    /// Same data as [`export_prometheus`](Self::export_prometheus), as JSON.
    pub fn export_json(&self) -> serde_json::Value {
        let mut counters = serde_json::Map::new();
        for ((name, labels), v) in self
            .counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            counters.insert(
                format!("{name}{}", labels.prometheus_str()),
                serde_json::json!(v.load(Ordering::Relaxed)),
            );
        }

        let mut gauges = serde_json::Map::new();
        for (name, v) in self.gauges.read().unwrap_or_else(PoisonError::into_inner).iter() {
            gauges.insert(name.clone(), serde_json::json!(v.load(Ordering::Relaxed)));
        }

        serde_json::json!({ "counters": counters, "gauges": gauges })
    }
}

// ---------------------------------------------------------------------------
// Global singleton
// ---------------------------------------------------------------------------

/// The process-wide collector.
pub fn global_metrics() -> &'static MetricsCollector {
    static INSTANCE: OnceLock<MetricsCollector> = OnceLock::new();
    INSTANCE.get_or_init(MetricsCollector::new)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_keyed_by_labels() {
        let m = MetricsCollector::new();
        m.increment_counter("webhook_rejections_total", &[("reason", "replay")]);
        m.increment_counter("webhook_rejections_total", &[("reason", "replay")]);
        m.increment_counter("webhook_rejections_total", &[("reason", "stale")]);

        assert_eq!(m.get_counter("webhook_rejections_total", &[("reason", "replay")]), 2);
        assert_eq!(m.get_counter("webhook_rejections_total", &[("reason", "stale")]), 1);
        assert_eq!(m.get_counter("webhook_rejections_total", &[("reason", "future")]), 0);
    }

    #[test]
    fn label_order_does_not_matter() {
        let m = MetricsCollector::new();
        m.increment_counter_by("api_requests_total", &[("method", "GET"), ("status", "200")], 3);
        assert_eq!(
            m.get_counter("api_requests_total", &[("status", "200"), ("method", "GET")]),
            3
        );
    }

    #[test]
    fn gauges_overwrite() {
        let m = MetricsCollector::new();
        m.set_gauge("queue_pending", 5);
        m.set_gauge("queue_pending", 2);
        assert_eq!(m.get_gauge("queue_pending"), 2);
        assert_eq!(m.get_gauge("queue_active"), 0);
    }

    #[test]
    fn prometheus_export() {
        let m = MetricsCollector::new();
        m.increment_counter("tasks_completed_total", &[]);
        m.increment_counter("webhook_rejections_total", &[("reason", "stale")]);
        m.increment_counter("webhook_rejections_total", &[("reason", "replay")]);
        m.set_gauge("queue_active", 1);

        let out = m.export_prometheus();
        assert!(out.contains("# TYPE tasks_completed_total counter\ntasks_completed_total 1\n"));
        assert_eq!(out.matches("# TYPE webhook_rejections_total counter").count(), 1);
        assert!(out.contains("webhook_rejections_total{reason=\"replay\"} 1"));
        assert!(out.contains("# TYPE queue_active gauge\nqueue_active 1\n"));
    }

    #[test]
    fn label_values_are_escaped() {
        let l = Labels::new(&[("path", "a\"b")]);
        assert_eq!(l.prometheus_str(), "{path=\"a\\\"b\"}");
    }

    #[test]
    fn json_export() {
        let m = MetricsCollector::new();
        m.increment_counter("tasks_enqueued_total", &[]);
        m.set_gauge("queue_pending", 4);
        let json = m.export_json();
        assert_eq!(json["gauges"]["queue_pending"], 4);
        assert_eq!(json["counters"]["tasks_enqueued_total"], 1);
    }

    #[test]
    fn global_is_a_singleton() {
        assert!(std::ptr::eq(global_metrics(), global_metrics()));
    }
}
