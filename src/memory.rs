//! Single-process reservation store.
//!
//! Ledgers live in a [`DashMap`](dashmap::DashMap) keyed by resource. Every
//! operation holds the resource's map entry for its whole duration, which is
//! what makes check-and-reserve indivisible across all of its dimensions.
//! State is not shared across processes; use the Redis store for that.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::{
    AdjustOutcome, AdmissionError, Dimension, DimensionLedger, LedgerEntry, LedgerUsage,
    RecordId, RecordStatus, Reservation, ReservationRequest, ReservationStore, ResourceKey,
    effective_limit,
};

/// Source of the store's notion of "now", in Unix milliseconds.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time in Unix milliseconds.
    fn now_ms(&self) -> u64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    /// A clock frozen at `now_ms`.
    pub fn new(now_ms: u64) -> Self {
        Self(AtomicU64::new(now_ms))
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let by = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.0.fetch_add(by, Ordering::SeqCst);
    }

    /// Move the clock to `now_ms`.
    pub fn set(&self, now_ms: u64) {
        self.0.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct RecordMeta {
    status: RecordStatus,
    slot_time_ms: u64,
}

#[derive(Debug, Default)]
struct ResourceLedgers {
    dimensions: HashMap<Dimension, DimensionLedger>,
    records: HashMap<RecordId, RecordMeta>,
    window_ms: u64,
}

impl ResourceLedgers {
    fn prune(&mut self, now_ms: u64) {
        for ledger in self.dimensions.values_mut() {
            ledger.prune(now_ms);
        }

        let window_ms = self.window_ms;
        self.records
            .retain(|_, meta| meta.slot_time_ms.saturating_add(window_ms) > now_ms);
    }

    /// Distinct live records across `dimensions` matching `pred` on slot time.
    fn count_records(
        &self,
        dimensions: impl Iterator<Item = Dimension>,
        now_ms: u64,
        pred: impl Fn(u64) -> bool,
    ) -> u64 {
        let mut seen: HashSet<&RecordId> = HashSet::new();

        for dimension in dimensions {
            let Some(ledger) = self.dimensions.get(&dimension) else {
                continue;
            };

            for entry in ledger.live(now_ms) {
                if pred(entry.slot_time_ms) {
                    seen.insert(&entry.record_id);
                }
            }
        }

        seen.len() as u64
    }

    fn is_empty(&self) -> bool {
        self.dimensions.values().all(DimensionLedger::is_empty)
    }
}

/// In-process implementation of [`ReservationStore`].
#[derive(Debug)]
pub struct InMemoryReservationStore {
    ledgers: DashMap<ResourceKey, ResourceLedgers>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryReservationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryReservationStore {
    /// A store driven by the wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// A store driven by `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            ledgers: DashMap::new(),
            clock,
        }
    }

    /// Status of a stored record, if it is still live.
    pub fn record_status(&self, key: &ResourceKey, record_id: &RecordId) -> Option<RecordStatus> {
        let now_ms = self.clock.now_ms();
        let ledgers = self.ledgers.get(key)?;
        let meta = ledgers.records.get(record_id)?;

        if meta.slot_time_ms.saturating_add(ledgers.window_ms) <= now_ms {
            return None;
        }

        Some(meta.status)
    }

    /// Number of resource keys holding state.
    pub fn resource_count(&self) -> usize {
        self.ledgers.len()
    }

    /// Prune every resource and forget the ones left without entries.
    ///
    /// Ledgers are otherwise only pruned when their resource is touched, so a
    /// long-running process with many short-lived keys should call this
    /// periodically.
    pub fn cleanup(&self) {
        let now_ms = self.clock.now_ms();

        self.ledgers.retain(|_, ledgers| {
            ledgers.prune(now_ms);
            !ledgers.is_empty()
        });
    }
}

#[async_trait]
impl ReservationStore for InMemoryReservationStore {
    async fn reserve(&self, request: &ReservationRequest) -> Result<Reservation, AdmissionError> {
        let now_ms = self.clock.now_ms();

        let mut guard = self.ledgers.entry(request.key.clone()).or_default();
        let ledgers = &mut *guard;

        ledgers.window_ms = request.window_ms;
        ledgers.prune(now_ms);

        let mut slot_time_ms = now_ms;

        for dimension in &request.dimensions {
            let ledger = ledgers
                .dimensions
                .entry(dimension.dimension)
                .or_insert_with(|| DimensionLedger::new(request.window_ms));
            ledger.set_window_ms(request.window_ms);
            ledger.prune(now_ms);

            let limit = effective_limit(dimension.limit, request.burst_multiplier);
            slot_time_ms = slot_time_ms.max(ledger.earliest_available(
                now_ms,
                dimension.amount,
                limit,
            ));
        }

        let queue_position = if slot_time_ms <= now_ms {
            0
        } else {
            ledgers.count_records(
                request.dimensions.iter().map(|d| d.dimension),
                now_ms,
                |slot| slot <= slot_time_ms,
            )
        };

        for dimension in &request.dimensions {
            if let Some(ledger) = ledgers.dimensions.get_mut(&dimension.dimension) {
                ledger.insert(LedgerEntry {
                    record_id: request.record_id.clone(),
                    amount: dimension.amount,
                    slot_time_ms,
                });
            }
        }

        ledgers.records.insert(
            request.record_id.clone(),
            RecordMeta {
                status: RecordStatus::Pending,
                slot_time_ms,
            },
        );

        Ok(Reservation {
            record_id: request.record_id.clone(),
            slot_time_ms,
            queue_position,
            now_ms,
        })
    }

    async fn adjust(
        &self,
        key: &ResourceKey,
        record_id: &RecordId,
        amounts: &[(Dimension, u64)],
    ) -> Result<AdjustOutcome, AdmissionError> {
        let now_ms = self.clock.now_ms();

        let Some(mut guard) = self.ledgers.get_mut(key) else {
            return Ok(AdjustOutcome::NotFound);
        };
        let ledgers = &mut *guard;

        ledgers.prune(now_ms);

        let mut adjusted = 0;
        for (dimension, amount) in amounts {
            let Some(ledger) = ledgers.dimensions.get_mut(dimension) else {
                continue;
            };

            if ledger.adjust_amount(record_id, *amount).is_some() {
                adjusted += 1;
            }
        }

        if adjusted == 0 {
            return Ok(AdjustOutcome::NotFound);
        }

        if let Some(meta) = ledgers.records.get_mut(record_id) {
            meta.status = RecordStatus::Adjusted;
        }

        Ok(AdjustOutcome::Adjusted {
            dimensions: adjusted,
        })
    }

    /// Ledgers here carry the window they were written with, so `_window_ms`
    /// is not consulted.
    async fn usage(
        &self,
        key: &ResourceKey,
        dimensions: &[Dimension],
        _window_ms: u64,
    ) -> Result<LedgerUsage, AdmissionError> {
        let now_ms = self.clock.now_ms();

        let Some(ledgers) = self.ledgers.get(key) else {
            return Ok(LedgerUsage {
                used: dimensions.iter().map(|d| (*d, 0)).collect(),
                queue_depth: 0,
            });
        };

        let used = dimensions
            .iter()
            .map(|d| {
                let used = ledgers
                    .dimensions
                    .get(d)
                    .map_or(0, |ledger| ledger.used(now_ms));
                (*d, used)
            })
            .collect();

        let queue_depth =
            ledgers.count_records(dimensions.iter().copied(), now_ms, |slot| slot > now_ms);

        Ok(LedgerUsage { used, queue_depth })
    }
}
