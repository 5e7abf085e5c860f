//! Server-side occupancy aggregation
//!
//! Each ingest resolves the device to its lot, then performs
//! read → add → write against the counter store while holding that lot's
//! mutex. Lots never share a mutation lock: the lock table itself is only
//! held long enough to fetch (or create) the per-lot mutex.
//!
//! Queries read the store directly without touching the per-lot mutexes, so
//! a reader may observe a value that is at most one in-flight mutation old.

use crate::domain::types::{DeltaEvent, DeviceKey, LotId, LotView};
use crate::infra::metrics::Metrics;
use crate::services::registry::Registry;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("counter store error: {0}")]
pub struct StoreError(pub String);

/// Read/write contract for the external counter storage
pub trait CounterStore: Send + Sync {
    /// Current count for a lot; unknown lots read as None
    fn read(&self, lot: &LotId) -> Result<Option<i64>, StoreError>;

    fn write(&self, lot: &LotId, count: i64) -> Result<(), StoreError>;

    /// Snapshot of every stored lot
    fn all(&self) -> Result<Vec<(LotId, i64)>, StoreError>;
}

/// In-process counter store
#[derive(Debug, Default)]
pub struct MemoryStore {
    counts: RwLock<FxHashMap<LotId, i64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CounterStore for MemoryStore {
    fn read(&self, lot: &LotId) -> Result<Option<i64>, StoreError> {
        Ok(self.counts.read().get(lot).copied())
    }

    fn write(&self, lot: &LotId, count: i64) -> Result<(), StoreError> {
        self.counts.write().insert(lot.clone(), count);
        Ok(())
    }

    fn all(&self) -> Result<Vec<(LotId, i64)>, StoreError> {
        Ok(self.counts.read().iter().map(|(lot, &count)| (lot.clone(), count)).collect())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IngestError {
    #[error("unknown device {0}")]
    UnknownDevice(DeviceKey),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of applying one event to a lot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub lot: LotId,
    pub net_delta: i64,
    pub car_count: i64,
}

pub struct OccupancyAggregator {
    registry: Arc<Registry>,
    store: Arc<dyn CounterStore>,
    lot_locks: RwLock<FxHashMap<LotId, Arc<Mutex<()>>>>,
    metrics: Arc<Metrics>,
}

impl OccupancyAggregator {
    pub fn new(registry: Arc<Registry>, store: Arc<dyn CounterStore>, metrics: Arc<Metrics>) -> Self {
        Self { registry, store, lot_locks: RwLock::new(FxHashMap::default()), metrics }
    }

    /// Aggregator over an in-memory store
    pub fn in_memory(registry: Arc<Registry>, metrics: Arc<Metrics>) -> Self {
        Self::new(registry, Arc::new(MemoryStore::new()), metrics)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Mutex serialising mutations of one lot
    fn lot_lock(&self, lot: &LotId) -> Arc<Mutex<()>> {
        if let Some(lock) = self.lot_locks.read().get(lot) {
            return lock.clone();
        }
        self.lot_locks.write().entry(lot.clone()).or_default().clone()
    }

    /// Apply one delta event
    ///
    /// Returns `Ok(None)` for a registered device that has no lot yet; the
    /// event is accepted but changes nothing.
    pub fn ingest(&self, event: DeltaEvent) -> Result<Option<Applied>, IngestError> {
        let start = Instant::now();
        let key = event.device_key;

        let lot = match self.registry.resolve(key) {
            Ok(Some(lot)) => lot,
            Ok(None) => {
                self.metrics.record_report_unassigned();
                debug!(device_key = %key, "report_for_unassigned_device");
                return Ok(None);
            }
            Err(_) => {
                self.metrics.record_report_unknown();
                info!(device_key = %key, "report_unknown_device");
                return Err(IngestError::UnknownDevice(key));
            }
        };

        let net_delta = event.net_delta();
        let lock = self.lot_lock(&lot);
        let car_count = {
            let _guard = lock.lock();
            let current = self.store.read(&lot)?.unwrap_or(0);
            let updated = current + net_delta;
            self.store.write(&lot, updated)?;
            updated
        };

        let latency_us = start.elapsed().as_micros() as u64;
        self.metrics.record_report_applied(event.delta.enter, event.delta.exit, latency_us);
        info!(
            device_key = %key,
            lot_id = %lot,
            enter = %event.delta.enter,
            exit = %event.delta.exit,
            car_count = %car_count,
            latency_us = %latency_us,
            "occupancy_updated"
        );

        Ok(Some(Applied { lot, net_delta, car_count }))
    }

    /// Current state of one lot, None if the lot has neither a counter nor devices
    pub fn query_lot(&self, lot: &LotId) -> Result<Option<LotView>, IngestError> {
        let count = self.store.read(lot)?;
        let devices = self.registry.devices_of(lot);
        if count.is_none() && devices.is_empty() {
            return Ok(None);
        }
        Ok(Some(LotView { id: lot.clone(), car_count: count.unwrap_or(0), devices }))
    }

    /// Current state of every known lot, ordered by id
    pub fn query_all(&self) -> Result<Vec<LotView>, IngestError> {
        let counts: FxHashMap<LotId, i64> = self.store.all()?.into_iter().collect();
        let mut devices = self.registry.devices_by_lot();

        let mut ids: BTreeSet<LotId> = counts.keys().cloned().collect();
        ids.extend(devices.keys().cloned());

        Ok(ids
            .into_iter()
            .map(|id| LotView {
                car_count: counts.get(&id).copied().unwrap_or(0),
                devices: devices.remove(&id).unwrap_or_default(),
                id,
            })
            .collect())
    }

    /// `query(None)` lists all lots, `query(Some(id))` one lot
    pub fn query(&self, lot: Option<&LotId>) -> Result<Vec<LotView>, IngestError> {
        match lot {
            Some(lot) => Ok(self.query_lot(lot)?.into_iter().collect()),
            None => self.query_all(),
        }
    }
}
