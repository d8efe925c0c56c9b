//! In-memory aggregates fed by the event consumer
//!
//! Reads are served from this cache. The event's `new_value` is the
//! authoritative post-increment value, so replays under at-least-once
//! delivery can overcount `events` but never corrupt `value`; a periodic
//! reconcile against the durable store corrects any drift.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use highpress_events::CounterEvent;
use highpress_kv::{counter_key, CounterStore};
use std::sync::atomic::{AtomicU64, Ordering};

/// Keys reconciled per store round-trip.
const RECONCILE_CHUNK: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    pub resource_id: String,
    pub counter_type: String,
    pub value: i64,
    pub events: i64,
    pub last_updated: DateTime<Utc>,
}

/// A page of ranked aggregates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopPage {
    pub counters: Vec<Aggregate>,
    pub total: usize,
    pub has_next: bool,
}

#[derive(Debug, Default)]
pub struct AggregateStore {
    counters: DashMap<(String, String), Aggregate>,
    total_events: AtomicU64,
}

impl AggregateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one consumed event into the aggregates.
    pub fn apply(&self, event: &CounterEvent) {
        let key = (event.resource_id.clone(), event.counter_type.clone());
        let mut entry = self.counters.entry(key).or_insert_with(|| Aggregate {
            resource_id: event.resource_id.clone(),
            counter_type: event.counter_type.clone(),
            value: 0,
            events: 0,
            last_updated: event.timestamp,
        });
        entry.value = event.new_value;
        entry.events += 1;
        if event.timestamp > entry.last_updated {
            entry.last_updated = event.timestamp;
        }
        drop(entry);
        self.total_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, resource_id: &str, counter_type: &str) -> Option<Aggregate> {
        self.counters
            .get(&(resource_id.to_owned(), counter_type.to_owned()))
            .map(|entry| entry.clone())
    }

    /// Counters ranked by value, optionally filtered by type. `page` is
    /// 1-indexed; out-of-range pages come back empty with `has_next =
    /// false`.
    pub fn top(&self, counter_type: &str, page: usize, page_size: usize) -> TopPage {
        let mut matching: Vec<Aggregate> = self
            .counters
            .iter()
            .filter(|entry| counter_type.is_empty() || entry.counter_type == counter_type)
            .map(|entry| entry.clone())
            .collect();
        matching.sort_by(|a, b| {
            b.value
                .cmp(&a.value)
                .then_with(|| a.resource_id.cmp(&b.resource_id))
                .then_with(|| a.counter_type.cmp(&b.counter_type))
        });

        let total = matching.len();
        let page = page.max(1);
        let page_size = page_size.max(1);
        let start = (page - 1).saturating_mul(page_size);
        let counters: Vec<Aggregate> =
            matching.into_iter().skip(start).take(page_size).collect();
        let has_next = start.saturating_add(page_size) < total;
        TopPage { counters, total, has_next }
    }

    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }

    pub fn total_events(&self) -> u64 {
        self.total_events.load(Ordering::Relaxed)
    }

    /// Revalidate cached values against the durable store.
    pub async fn reconcile(&self, store: &dyn CounterStore) {
        let keys: Vec<(String, String)> =
            self.counters.iter().map(|entry| entry.key().clone()).collect();

        for chunk in keys.chunks(RECONCILE_CHUNK) {
            let store_keys: Vec<String> = chunk
                .iter()
                .map(|(resource_id, counter_type)| counter_key(resource_id, counter_type))
                .collect();
            let values = match store.batch_get(&store_keys).await {
                Ok(values) => values,
                Err(e) => {
                    tracing::warn!(error = %e, "aggregate reconcile read failed");
                    return;
                }
            };
            for (key, value) in chunk.iter().zip(values) {
                if let Some(mut entry) = self.counters.get_mut(key) {
                    if entry.value != value {
                        tracing::debug!(
                            resource_id = %key.0,
                            counter_type = %key.1,
                            cached = entry.value,
                            durable = value,
                            "reconciling drifted aggregate"
                        );
                        entry.value = value;
                    }
                }
            }
        }
    }
}
