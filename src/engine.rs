//! The admission algorithm.
//!
//! [`AdmissionEngine`] turns a request into per-dimension amounts, hands them
//! to the store as one atomic check-and-reserve, and converts the resulting
//! slot into a wait time. It never sleeps: honoring the wait is the caller's
//! job.
//!
//! # Failure behavior
//!
//! This engine fails **open**. When the store stays unreachable after the
//! store's retries, `acquire` admits immediately under a local record id that
//! is never persisted, `adjust` drops the correction, and `status` reports
//! nothing. Only configuration mistakes and fatal store errors (bad
//! credentials, a broken script) reach the caller.

use std::{sync::Arc, time::Duration};

use crate::{
    AcquireResult, AdjustOutcome, AdmissionError, DimensionRequest, RateLimitConfig, RecordId,
    RecordStatus, ReservationRequest, ReservationStore, ResourceKey, StatusReporter,
    StatusSnapshot, TokenUsage,
    memory::{Clock, SystemClock},
};

/// Computes admission slots against a shared [`ReservationStore`].
#[derive(Clone)]
pub struct AdmissionEngine {
    store: Arc<dyn ReservationStore>,
    status: StatusReporter,
}

impl AdmissionEngine {
    /// Create an engine backed by `store`.
    pub fn new(store: Arc<dyn ReservationStore>) -> Self {
        Self {
            status: StatusReporter::new(store.clone()),
            store,
        }
    }

    /// The store reservations are written to.
    pub fn store(&self) -> &Arc<dyn ReservationStore> {
        &self.store
    }

    /// Read-only reporter sharing this engine's store.
    pub fn status_reporter(&self) -> &StatusReporter {
        &self.status
    }

    /// Reserve capacity for `usage` under `config` and tell the caller when to proceed.
    ///
    /// The slowest active dimension decides the slot. The reservation is
    /// written at that slot whether or not the caller ends up waiting for it.
    ///
    /// # Errors
    ///
    /// Only fatal store errors are returned. Store unavailability yields a
    /// fail-open result with `wait_time == 0` and `queue_position == 0`.
    pub async fn acquire(
        &self,
        key: &ResourceKey,
        config: &RateLimitConfig,
        usage: &TokenUsage,
    ) -> Result<AcquireResult, AdmissionError> {
        let amounts = usage.requested_amounts(config);

        if amounts.is_empty() {
            return Ok(Self::admit_unconditionally(RecordStatus::Pending));
        }

        let request = ReservationRequest {
            key: key.clone(),
            record_id: RecordId::generate(),
            window_ms: config.window_size_seconds().as_millis(),
            burst_multiplier: config.burst_multiplier(),
            dimensions: amounts
                .into_iter()
                .map(|(dimension, amount)| {
                    let capacity = config.effective_limit(dimension);
                    if amount > capacity {
                        tracing::warn!(
                            resource = %key,
                            %dimension,
                            amount,
                            capacity,
                            "Requested amount exceeds dimension capacity"
                        );
                    }

                    DimensionRequest {
                        dimension,
                        amount,
                        limit: config.limit(dimension),
                    }
                })
                .collect(),
        };

        let reservation = match self.store.reserve(&request).await {
            Ok(reservation) => reservation,
            Err(err) if err.is_transient() => {
                tracing::warn!(
                    resource = %key,
                    error = %err,
                    "Store unavailable, admitting without reservation"
                );
                return Ok(Self::admit_unconditionally(RecordStatus::FailOpenLocal));
            }
            Err(err) => return Err(err),
        };

        let wait_time =
            Duration::from_millis(reservation.slot_time_ms.saturating_sub(reservation.now_ms));

        tracing::debug!(
            resource = %key,
            record_id = %reservation.record_id,
            slot_time_ms = reservation.slot_time_ms,
            wait_ms = wait_time.as_millis() as u64,
            queue_position = reservation.queue_position,
            "Reserved capacity"
        );

        Ok(AcquireResult {
            record_id: reservation.record_id,
            slot_time_ms: reservation.slot_time_ms,
            wait_time,
            queue_position: reservation.queue_position,
            status: RecordStatus::Pending,
        })
    }

    /// Replace a record's estimated amounts with actual usage.
    ///
    /// Values are absolute, so repeating a call with the same values changes
    /// nothing. Records that expired or were never stored are ignored.
    ///
    /// # Errors
    ///
    /// Only fatal store errors are returned; unavailability yields
    /// [`AdjustOutcome::Unavailable`].
    pub async fn adjust(
        &self,
        key: &ResourceKey,
        record_id: &RecordId,
        actual: &TokenUsage,
    ) -> Result<AdjustOutcome, AdmissionError> {
        if record_id.is_local() {
            tracing::debug!(resource = %key, record_id = %record_id, "Ignoring adjust of unpersisted record");
            return Ok(AdjustOutcome::NotFound);
        }

        let amounts = actual.actual_amounts();
        if amounts.is_empty() {
            return Ok(AdjustOutcome::NotFound);
        }

        match self.store.adjust(key, record_id, &amounts).await {
            Ok(outcome) => {
                tracing::debug!(resource = %key, record_id = %record_id, ?outcome, "Adjusted record");
                Ok(outcome)
            }
            Err(err) if err.is_transient() => {
                tracing::warn!(
                    resource = %key,
                    record_id = %record_id,
                    error = %err,
                    "Store unavailable, dropping adjustment"
                );
                Ok(AdjustOutcome::Unavailable)
            }
            Err(err) => Err(err),
        }
    }

    /// Current usage of `key` under `config`. See [`StatusReporter::snapshot`].
    pub async fn status(
        &self,
        key: &ResourceKey,
        config: &RateLimitConfig,
    ) -> Result<Option<StatusSnapshot>, AdmissionError> {
        self.status.snapshot(key, config).await
    }

    fn admit_unconditionally(status: RecordStatus) -> AcquireResult {
        AcquireResult {
            record_id: RecordId::generate_local(),
            slot_time_ms: SystemClock.now_ms(),
            wait_time: Duration::ZERO,
            queue_position: 0,
            status,
        }
    }
}
