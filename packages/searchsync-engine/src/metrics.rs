//! Sync metrics tracker
//!
//! Running-average apply latency per entity type plus a few counters. Always
//! on and lock-free per entity (DashMap shards). With the `metrics` feature
//! the same observations are mirrored into a Prometheus registry.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "metrics")]
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry, HistogramOpts,
    HistogramVec, IntCounterVec, Opts, Registry,
};

#[derive(Debug, Default, Clone, Copy)]
struct RunningAverage {
    count: u64,
    mean_ms: f64,
}

impl RunningAverage {
    fn observe(&mut self, sample_ms: f64) {
        self.count += 1;
        self.mean_ms += (sample_ms - self.mean_ms) / self.count as f64;
    }
}

#[derive(Debug, Default)]
struct EntityCounters {
    latency: parking_lot::Mutex<RunningAverage>,
    documents_indexed: AtomicU64,
    events_applied: AtomicU64,
    events_failed: AtomicU64,
}

/// Point-in-time view of one entity type
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityMetrics {
    pub entity_type: String,
    pub samples: u64,
    pub average_latency_ms: f64,
    pub documents_indexed: u64,
    pub events_applied: u64,
    pub events_failed: u64,
}

#[cfg(feature = "metrics")]
#[derive(Clone)]
pub struct PrometheusSyncMetrics {
    pub latency: HistogramVec,
    pub documents_indexed: IntCounterVec,
    pub events: IntCounterVec,
}

#[cfg(feature = "metrics")]
impl PrometheusSyncMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        Ok(Self {
            latency: register_histogram_vec_with_registry!(
                HistogramOpts::new("searchsync_apply_latency_seconds", "Change apply latency"),
                &["entity_type"],
                registry
            )?,
            documents_indexed: register_int_counter_vec_with_registry!(
                Opts::new("searchsync_documents_indexed_total", "Documents written by backfill"),
                &["entity_type"],
                registry
            )?,
            events: register_int_counter_vec_with_registry!(
                Opts::new("searchsync_events_total", "Change events by result"),
                &["entity_type", "result"],
                registry
            )?,
        })
    }
}

#[derive(Clone, Default)]
pub struct SyncMetricsTracker {
    entities: Arc<DashMap<String, Arc<EntityCounters>>>,
    #[cfg(feature = "metrics")]
    prometheus: Option<PrometheusSyncMetrics>,
}

impl SyncMetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(feature = "metrics")]
    pub fn with_prometheus(mut self, metrics: PrometheusSyncMetrics) -> Self {
        self.prometheus = Some(metrics);
        self
    }

    fn counters(&self, entity_type: &str) -> Arc<EntityCounters> {
        if let Some(existing) = self.entities.get(entity_type) {
            return existing.clone();
        }
        self.entities
            .entry(entity_type.to_string())
            .or_default()
            .clone()
    }

    pub fn record_latency(&self, entity_type: &str, latency: Duration) {
        let ms = latency.as_secs_f64() * 1_000.0;
        self.counters(entity_type).latency.lock().observe(ms);

        #[cfg(feature = "metrics")]
        if let Some(prom) = &self.prometheus {
            prom.latency
                .with_label_values(&[entity_type])
                .observe(latency.as_secs_f64());
        }
    }

    pub fn record_documents_indexed(&self, entity_type: &str, count: u64) {
        self.counters(entity_type)
            .documents_indexed
            .fetch_add(count, Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        if let Some(prom) = &self.prometheus {
            prom.documents_indexed
                .with_label_values(&[entity_type])
                .inc_by(count);
        }
    }

    pub fn record_event(&self, entity_type: &str, success: bool) {
        let counters = self.counters(entity_type);
        if success {
            counters.events_applied.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.events_failed.fetch_add(1, Ordering::Relaxed);
        }

        #[cfg(feature = "metrics")]
        if let Some(prom) = &self.prometheus {
            let result = if success { "applied" } else { "failed" };
            prom.events.with_label_values(&[entity_type, result]).inc();
        }
    }

    /// Running-average latency, `None` before the first sample
    pub fn average_latency(&self, entity_type: &str) -> Option<Duration> {
        let entry = self.entities.get(entity_type)?;
        let avg = *entry.latency.lock();
        (avg.count > 0).then(|| Duration::from_secs_f64(avg.mean_ms / 1_000.0))
    }

    pub fn snapshot(&self, entity_type: &str) -> Option<EntityMetrics> {
        let entry = self.entities.get(entity_type)?;
        Some(Self::to_metrics(entity_type, &entry))
    }

    /// All entity types, sorted by name
    pub fn snapshot_all(&self) -> Vec<EntityMetrics> {
        let mut all: Vec<_> = self
            .entities
            .iter()
            .map(|entry| Self::to_metrics(entry.key(), entry.value()))
            .collect();
        all.sort_by(|a, b| a.entity_type.cmp(&b.entity_type));
        all
    }

    fn to_metrics(entity_type: &str, counters: &EntityCounters) -> EntityMetrics {
        let avg = *counters.latency.lock();
        EntityMetrics {
            entity_type: entity_type.to_string(),
            samples: avg.count,
            average_latency_ms: avg.mean_ms,
            documents_indexed: counters.documents_indexed.load(Ordering::Relaxed),
            events_applied: counters.events_applied.load(Ordering::Relaxed),
            events_failed: counters.events_failed.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.entities.clear();
    }
}
