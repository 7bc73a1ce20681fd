//! Caller-facing entrypoint binding one resource key and its quotas to an engine.

use std::sync::Arc;

use crate::{
    AcquireResult, AdjustOutcome, AdmissionEngine, AdmissionError, InMemoryReservationStore,
    RateLimitConfig, RecordId, ResourceKey, StatusSnapshot, TokenUsage,
    redis::{RedisConnectionManager, RedisConnectionOptions, RedisReservationStore},
    runtime::async_sleep,
};

/// Rate limiter for a single resource key.
///
/// Wraps an [`AdmissionEngine`] with the key and [`RateLimitConfig`] every
/// call uses. Cheap to clone; clones share the engine and its store.
///
/// # Examples
///
/// ```ignore
/// use llm_admission::{RateLimitConfig, RateLimiter, TokenUsage};
///
/// let config = RateLimitConfig::split(4_000_000, 128_000, 360)?;
/// let limiter = RateLimiter::connect("redis://localhost:6379", "gemini-1.5-pro", config).await?;
///
/// let result = limiter.acquire_split(5000, 2048).await?;
/// tokio::time::sleep(result.wait_time).await;
/// // call the model ...
/// limiter.adjust(&result.record_id, &TokenUsage::output(3000)).await?;
/// ```
#[derive(Clone)]
pub struct RateLimiter {
    engine: AdmissionEngine,
    key: ResourceKey,
    config: Arc<RateLimitConfig>,
}

impl RateLimiter {
    /// Create a limiter for `key` on an existing engine.
    pub fn new(engine: AdmissionEngine, key: ResourceKey, config: RateLimitConfig) -> Self {
        Self {
            engine,
            key,
            config: Arc::new(config),
        }
    }

    /// Create a limiter whose state lives in this process only.
    pub fn in_memory(key: ResourceKey, config: RateLimitConfig) -> Self {
        Self::new(
            AdmissionEngine::new(Arc::new(InMemoryReservationStore::new())),
            key,
            config,
        )
    }

    /// Create a limiter sharing state through the Redis server at `url`.
    pub async fn connect(
        url: &str,
        key: &str,
        config: RateLimitConfig,
    ) -> Result<Self, AdmissionError> {
        let key = ResourceKey::try_from(key)?;
        let connections =
            RedisConnectionManager::connect(RedisConnectionOptions::from_url(url)?).await?;

        Ok(Self::from_connections(connections, key, config))
    }

    /// Create a limiter sharing state through an existing connection pool.
    pub fn from_connections(
        connections: RedisConnectionManager,
        key: ResourceKey,
        config: RateLimitConfig,
    ) -> Self {
        let store = RedisReservationStore::new(connections, None);
        Self::new(AdmissionEngine::new(Arc::new(store)), key, config)
    }

    /// Resource key every call is made under.
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Quotas every call is checked against.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// The underlying engine.
    pub fn engine(&self) -> &AdmissionEngine {
        &self.engine
    }

    /// Reserve capacity for `usage`. See [`AdmissionEngine::acquire`].
    pub async fn acquire(&self, usage: &TokenUsage) -> Result<AcquireResult, AdmissionError> {
        self.engine.acquire(&self.key, &self.config, usage).await
    }

    /// Reserve capacity for a combined token count.
    pub async fn acquire_tokens(&self, tokens: u64) -> Result<AcquireResult, AdmissionError> {
        self.acquire(&TokenUsage::tokens(tokens)).await
    }

    /// Reserve capacity for separate input and output token counts.
    pub async fn acquire_split(
        &self,
        input: u64,
        output: u64,
    ) -> Result<AcquireResult, AdmissionError> {
        self.acquire(&TokenUsage::split(input, output)).await
    }

    /// Reserve capacity for `usage` and sleep until the reserved slot.
    pub async fn acquire_and_wait(
        &self,
        usage: &TokenUsage,
    ) -> Result<AcquireResult, AdmissionError> {
        let result = self.acquire(usage).await?;

        if !result.wait_time.is_zero() {
            async_sleep(result.wait_time).await;
        }

        Ok(result)
    }

    /// Correct a reservation with actual usage. See [`AdmissionEngine::adjust`].
    pub async fn adjust(
        &self,
        record_id: &RecordId,
        actual: &TokenUsage,
    ) -> Result<AdjustOutcome, AdmissionError> {
        self.engine.adjust(&self.key, record_id, actual).await
    }

    /// Current usage of the key. `Ok(None)` when the store is unreachable.
    pub async fn status(&self) -> Result<Option<StatusSnapshot>, AdmissionError> {
        self.engine.status(&self.key, &self.config).await
    }
}
