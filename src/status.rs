use std::sync::Arc;

use crate::{
    AdmissionError, Dimension, DimensionStatus, RateLimitConfig, ReservationStore, ResourceKey,
    StatusSnapshot,
};

/// Read-only view over a resource key's ledgers.
#[derive(Clone)]
pub struct StatusReporter {
    store: Arc<dyn ReservationStore>,
}

impl StatusReporter {
    pub(crate) fn new(store: Arc<dyn ReservationStore>) -> Self {
        Self { store }
    }

    /// Usage against each active dimension of `config`, plus the number of
    /// records scheduled in the future.
    ///
    /// Returns `Ok(None)` when the store could not be reached after retries.
    /// Only fatal store errors are returned as errors.
    pub async fn snapshot(
        &self,
        key: &ResourceKey,
        config: &RateLimitConfig,
    ) -> Result<Option<StatusSnapshot>, AdmissionError> {
        let dimensions: Vec<Dimension> = config.active_dimensions().collect();

        let usage = match self
            .store
            .usage(key, &dimensions, config.window_size_seconds().as_millis())
            .await
        {
            Ok(usage) => usage,
            Err(err) if err.is_transient() => {
                tracing::warn!(resource = %key, error = %err, "Store unavailable, no status");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        let dimensions = dimensions
            .into_iter()
            .map(|dimension| DimensionStatus {
                dimension,
                used: usage
                    .used
                    .iter()
                    .find(|(d, _)| *d == dimension)
                    .map_or(0, |(_, used)| *used),
                limit: config.effective_limit(dimension),
            })
            .collect();

        Ok(Some(StatusSnapshot {
            resource: key.clone(),
            dimensions,
            queue_depth: usage.queue_depth,
        }))
    }
}
