use std::{fmt, ops::Deref, sync::Arc, time::Duration};

use crate::AdmissionError;

/// One independently limited quantity tracked for a resource key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dimension {
    /// Input and output tokens counted together.
    Tokens,
    /// Prompt (input) tokens.
    InputTokens,
    /// Completion (output) tokens.
    OutputTokens,
    /// Requests issued, one per acquisition.
    Requests,
}

impl Dimension {
    /// Every dimension, in a stable order.
    pub const ALL: [Dimension; 4] = [
        Dimension::Tokens,
        Dimension::InputTokens,
        Dimension::OutputTokens,
        Dimension::Requests,
    ];

    /// Short, key-safe name of the dimension.
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Tokens => "tokens",
            Dimension::InputTokens => "input",
            Dimension::OutputTokens => "output",
            Dimension::Requests => "requests",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated identifier under which quotas are tracked (usually a model name).
///
/// Constraints:
/// - Must not be empty
/// - Must not be longer than 255 bytes
/// - Must not contain colons
///
/// The same rules apply to key prefixes, which is why Redis key prefixes are
/// also expressed as a [`ResourceKey`].
#[derive(Debug, Clone, PartialEq, PartialOrd, Hash, Eq)]
pub struct ResourceKey(Arc<str>);

impl ResourceKey {
    /// The default Redis key prefix.
    pub fn default_prefix() -> Self {
        Self(Arc::from("llm_admission"))
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Deref for ResourceKey {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ResourceKey {
    type Error = AdmissionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            Err(AdmissionError::InvalidResourceKey(
                "resource key must not be empty".to_string(),
            ))
        } else if value.len() > 255 {
            Err(AdmissionError::InvalidResourceKey(
                "resource key must not be longer than 255 characters".to_string(),
            ))
        } else if value.contains(':') {
            Err(AdmissionError::InvalidResourceKey(
                "resource key must not contain colons".to_string(),
            ))
        } else {
            Ok(Self(Arc::from(value)))
        }
    }
}

impl TryFrom<&str> for ResourceKey {
    type Error = AdmissionError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_string())
    }
}

const LOCAL_RECORD_PREFIX: &str = "local-";

/// Opaque identifier of a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(Arc<str>);

impl RecordId {
    /// A fresh identifier for a reservation that will be written to the store.
    pub fn generate() -> Self {
        Self(Arc::from(uuid::Uuid::new_v4().to_string()))
    }

    /// A fresh identifier for a fail-open admission that is never persisted.
    pub fn generate_local() -> Self {
        Self(Arc::from(format!(
            "{LOCAL_RECORD_PREFIX}{}",
            uuid::Uuid::new_v4()
        )))
    }

    /// Returns `true` if this identifier was minted for a fail-open admission.
    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_RECORD_PREFIX)
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a consumption record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    /// Written by an acquisition and not corrected since.
    Pending,
    /// Its amounts were replaced with actual usage.
    Adjusted,
    /// Admitted while the store was unreachable; never persisted.
    FailOpenLocal,
}

impl RecordStatus {
    /// Name used when persisting the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Adjusted => "adjusted",
            RecordStatus::FailOpenLocal => "fail_open_local",
        }
    }
}

/// Sliding window duration, in seconds.
///
/// Must be at least 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WindowSizeSeconds(u64);

impl WindowSizeSeconds {
    /// The window in milliseconds.
    pub fn as_millis(&self) -> u64 {
        self.0.saturating_mul(1000)
    }
}

impl Default for WindowSizeSeconds {
    /// One minute, the window LLM providers quote their TPM/RPM limits over.
    fn default() -> Self {
        Self(60)
    }
}

impl Deref for WindowSizeSeconds {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u64> for WindowSizeSeconds {
    type Error = AdmissionError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value < 1 {
            Err(AdmissionError::InvalidConfig(
                "Window size must be at least 1".to_string(),
            ))
        } else {
            Ok(Self(value))
        }
    }
}

/// Multiplier applied to every configured limit.
///
/// Must be finite and greater than 0. Defaults to `1.0`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct BurstMultiplier(f64);

impl Default for BurstMultiplier {
    fn default() -> Self {
        Self(1f64)
    }
}

impl Deref for BurstMultiplier {
    type Target = f64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<f64> for BurstMultiplier {
    type Error = AdmissionError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if !value.is_finite() || value <= 0f64 {
            Err(AdmissionError::InvalidConfig(
                "Burst multiplier must be greater than 0".to_string(),
            ))
        } else {
            Ok(Self(value))
        }
    }
}

/// Capacity of a dimension once the burst multiplier is applied.
pub fn effective_limit(limit: u64, burst_multiplier: BurstMultiplier) -> u64 {
    (limit as f64 * *burst_multiplier).floor() as u64
}

/// Quotas for one resource key.
///
/// A dimension is active iff its limit is non-zero. A configuration with no
/// active dimension admits everything immediately.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    tpm: u64,
    input_tpm: u64,
    output_tpm: u64,
    rpm: u64,
    window_size_seconds: WindowSizeSeconds,
    burst_multiplier: BurstMultiplier,
}

impl RateLimitConfig {
    /// Build a validated configuration.
    ///
    /// `tpm` limits input and output tokens together, `input_tpm` and
    /// `output_tpm` limit them separately, and `rpm` limits requests. Pass 0 to
    /// leave a dimension unlimited.
    pub fn new(
        tpm: u64,
        input_tpm: u64,
        output_tpm: u64,
        rpm: u64,
        window_size_seconds: WindowSizeSeconds,
        burst_multiplier: BurstMultiplier,
    ) -> Result<Self, AdmissionError> {
        let config = Self {
            tpm,
            input_tpm,
            output_tpm,
            rpm,
            window_size_seconds,
            burst_multiplier,
        };

        for dimension in Dimension::ALL {
            let limit = config.limit(dimension);
            if limit > 0 && effective_limit(limit, burst_multiplier) == 0 {
                return Err(AdmissionError::InvalidConfig(format!(
                    "effective {dimension} limit rounds to zero ({limit} x {})",
                    *burst_multiplier
                )));
            }
        }

        Ok(config)
    }

    /// Combined-token quota over a one minute window.
    pub fn combined(tpm: u64, rpm: u64) -> Result<Self, AdmissionError> {
        Self::new(
            tpm,
            0,
            0,
            rpm,
            WindowSizeSeconds::default(),
            BurstMultiplier::default(),
        )
    }

    /// Separate input and output token quotas over a one minute window.
    pub fn split(input_tpm: u64, output_tpm: u64, rpm: u64) -> Result<Self, AdmissionError> {
        Self::new(
            0,
            input_tpm,
            output_tpm,
            rpm,
            WindowSizeSeconds::default(),
            BurstMultiplier::default(),
        )
    }

    /// Nominal limit of `dimension`, before the burst multiplier.
    pub fn limit(&self, dimension: Dimension) -> u64 {
        match dimension {
            Dimension::Tokens => self.tpm,
            Dimension::InputTokens => self.input_tpm,
            Dimension::OutputTokens => self.output_tpm,
            Dimension::Requests => self.rpm,
        }
    }

    /// Returns `true` if `dimension` is checked.
    pub fn is_active(&self, dimension: Dimension) -> bool {
        self.limit(dimension) > 0
    }

    /// Active dimensions, in [`Dimension::ALL`] order.
    pub fn active_dimensions(&self) -> impl Iterator<Item = Dimension> + '_ {
        Dimension::ALL.into_iter().filter(|d| self.is_active(*d))
    }

    /// Sliding window duration.
    pub fn window_size_seconds(&self) -> WindowSizeSeconds {
        self.window_size_seconds
    }

    /// Multiplier applied to every limit.
    pub fn burst_multiplier(&self) -> BurstMultiplier {
        self.burst_multiplier
    }

    /// Capacity of `dimension` with the burst multiplier applied.
    pub fn effective_limit(&self, dimension: Dimension) -> u64 {
        effective_limit(self.limit(dimension), self.burst_multiplier)
    }
}

/// Token counts attached to an acquisition or to a later correction.
///
/// Fields left as `None` are derived or skipped, see
/// [`TokenUsage::requested_amounts`] and [`TokenUsage::actual_amounts`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    /// Input and output tokens together.
    pub combined: Option<u64>,
    /// Input tokens.
    pub input: Option<u64>,
    /// Output tokens.
    pub output: Option<u64>,
}

impl TokenUsage {
    /// Usage expressed as a combined token count.
    pub fn tokens(combined: u64) -> Self {
        Self {
            combined: Some(combined),
            ..Self::default()
        }
    }

    /// Usage expressed as separate input and output counts.
    pub fn split(input: u64, output: u64) -> Self {
        Self {
            combined: None,
            input: Some(input),
            output: Some(output),
        }
    }

    /// Usage correcting only the output count.
    pub fn output(output: u64) -> Self {
        Self {
            output: Some(output),
            ..Self::default()
        }
    }

    /// Usage correcting only the input count.
    pub fn input(input: u64) -> Self {
        Self {
            input: Some(input),
            ..Self::default()
        }
    }

    fn derived_combined(&self) -> Option<u64> {
        match (self.combined, self.input, self.output) {
            (Some(combined), _, _) => Some(combined),
            (None, Some(input), Some(output)) => Some(input.saturating_add(output)),
            _ => None,
        }
    }

    /// Per-dimension amounts to reserve under `config`, active dimensions only.
    ///
    /// Combined tokens come from `combined`, or from `input + output` when no
    /// combined value is given. The requests dimension always contributes 1.
    pub fn requested_amounts(&self, config: &RateLimitConfig) -> Vec<(Dimension, u64)> {
        config
            .active_dimensions()
            .map(|dimension| {
                let amount = match dimension {
                    Dimension::Tokens => self.combined.unwrap_or_else(|| {
                        self.input
                            .unwrap_or(0)
                            .saturating_add(self.output.unwrap_or(0))
                    }),
                    Dimension::InputTokens => self.input.unwrap_or(0),
                    Dimension::OutputTokens => self.output.unwrap_or(0),
                    Dimension::Requests => 1,
                };

                (dimension, amount)
            })
            .collect()
    }

    /// Absolute per-dimension amounts to write over a record's estimate.
    ///
    /// Only dimensions with a known actual value are returned; combined tokens
    /// are known when given explicitly or when both parts are given. Requests
    /// are never corrected.
    pub fn actual_amounts(&self) -> Vec<(Dimension, u64)> {
        let mut amounts = Vec::with_capacity(3);

        if let Some(combined) = self.derived_combined() {
            amounts.push((Dimension::Tokens, combined));
        }
        if let Some(input) = self.input {
            amounts.push((Dimension::InputTokens, input));
        }
        if let Some(output) = self.output {
            amounts.push((Dimension::OutputTokens, output));
        }

        amounts
    }
}

/// Outcome of an acquisition.
///
/// Admission is cooperative: the engine only computes when the caller may
/// proceed. The caller is expected to wait for [`AcquireResult::wait_time`]
/// before calling the rate limited resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireResult {
    /// Identifier to pass to `adjust` once actual usage is known.
    pub record_id: RecordId,
    /// Unix time, in milliseconds, at which the reservation takes effect.
    pub slot_time_ms: u64,
    /// How long the caller should wait before proceeding.
    pub wait_time: Duration,
    /// Number of records scheduled at or before this one. Advisory only.
    pub queue_position: u64,
    /// `Pending` for stored reservations, `FailOpenLocal` when the store was
    /// unreachable and admission was unconditional.
    pub status: RecordStatus,
}

impl AcquireResult {
    /// Returns `true` if the caller may proceed without waiting.
    pub fn is_immediate(&self) -> bool {
        self.wait_time.is_zero()
    }

    /// Returns `true` if this admission bypassed the store.
    pub fn is_fail_open(&self) -> bool {
        self.status == RecordStatus::FailOpenLocal
    }
}

/// Usage of one dimension against its capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimensionStatus {
    /// Which dimension this is.
    pub dimension: Dimension,
    /// Sum of unexpired amounts.
    pub used: u64,
    /// Capacity with the burst multiplier applied.
    pub limit: u64,
}

impl DimensionStatus {
    /// Capacity left right now, or 0 if usage is at or over the limit.
    pub fn available(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }
}

/// Point-in-time view of a resource key's ledgers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    /// Resource the snapshot describes.
    pub resource: ResourceKey,
    /// One entry per active dimension.
    pub dimensions: Vec<DimensionStatus>,
    /// Records whose slot time is still in the future.
    pub queue_depth: u64,
}

impl StatusSnapshot {
    /// Status of `dimension`, if it is active.
    pub fn dimension(&self, dimension: Dimension) -> Option<&DimensionStatus> {
        self.dimensions.iter().find(|d| d.dimension == dimension)
    }
}
