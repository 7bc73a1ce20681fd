//! Contract for the shared store that holds the ledgers.
//!
//! Each method is one indivisible operation against the store. In particular
//! [`ReservationStore::reserve`] must prune, check every dimension, and write
//! the reservation in a single step, or two racing callers could both see
//! room and both be admitted into it.
//!
//! Implementations retry transient failures themselves. An error returned
//! from any method is final.

use async_trait::async_trait;

use crate::{AdmissionError, BurstMultiplier, Dimension, RecordId, ResourceKey};

/// Amount requested against one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimensionRequest {
    /// Dimension charged.
    pub dimension: Dimension,
    /// Amount to reserve.
    pub amount: u64,
    /// Nominal limit, before the burst multiplier.
    pub limit: u64,
}

/// Everything the store needs to check and reserve in one step.
#[derive(Debug, Clone)]
pub struct ReservationRequest {
    /// Resource whose ledgers are checked.
    pub key: ResourceKey,
    /// Identifier under which the reservation is written.
    pub record_id: RecordId,
    /// Window length shared by every dimension, in milliseconds.
    pub window_ms: u64,
    /// Multiplier applied to every limit.
    pub burst_multiplier: BurstMultiplier,
    /// Active dimensions only.
    pub dimensions: Vec<DimensionRequest>,
}

/// A reservation written by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// Identifier the reservation was written under.
    pub record_id: RecordId,
    /// Unix time, in milliseconds, at which the reservation takes effect.
    pub slot_time_ms: u64,
    /// Records scheduled at or before this one; 0 if admitted immediately.
    pub queue_position: u64,
    /// Store clock when the reservation was written, in Unix milliseconds.
    pub now_ms: u64,
}

/// Result of rewriting a record's amounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustOutcome {
    /// The record was found and this many dimensions were rewritten.
    Adjusted {
        /// Number of dimension entries rewritten.
        dimensions: usize,
    },
    /// The record has expired or was never stored.
    NotFound,
    /// The store could not be reached; the correction was dropped.
    Unavailable,
}

/// Current usage of a resource key's ledgers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerUsage {
    /// Sum of live amounts per requested dimension.
    pub used: Vec<(Dimension, u64)>,
    /// Live records whose slot time is in the future.
    pub queue_depth: u64,
}

/// A store able to run the admission ledger operations atomically.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Prune, compute the earliest slot where every dimension has room, and
    /// write the reservation there.
    async fn reserve(&self, request: &ReservationRequest) -> Result<Reservation, AdmissionError>;

    /// Replace the amounts a record charged with absolute values.
    ///
    /// Dimensions the record has no entry for are skipped.
    async fn adjust(
        &self,
        key: &ResourceKey,
        record_id: &RecordId,
        amounts: &[(Dimension, u64)],
    ) -> Result<AdjustOutcome, AdmissionError>;

    /// Sum live amounts of `dimensions` and count future-scheduled records,
    /// without modifying anything.
    async fn usage(
        &self,
        key: &ResourceKey,
        dimensions: &[Dimension],
        window_ms: u64,
    ) -> Result<LedgerUsage, AdmissionError>;
}
