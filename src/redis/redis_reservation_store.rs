use std::sync::Arc;

use async_trait::async_trait;
use redis::Script;

use crate::{
    AdjustOutcome, AdmissionError, Dimension, LedgerUsage, RecordId, RecordStatus, Reservation,
    ReservationRequest, ReservationStore, ResourceKey, StoreError, StoreErrorKind,
    redis::{RedisConnectionManager, RedisKeyGenerator},
};

// Shared by the scripts below. Sets are walked in pages so no single
// `unpack` exceeds the Lua C stack, whatever the number of live entries.
const SCRIPT_PRELUDE: &str = r#"
    local PAGE = 1000

    local function int(n)
        return string.format("%d", n)
    end

    local function server_now_ms()
        local time_array = redis.call("TIME")
        return tonumber(time_array[1]) * 1000 + math.floor(tonumber(time_array[2]) / 1000)
    end

    local function sum_amounts(amounts_key, ids)
        local sum = 0
        if #ids > 0 then
            local values = redis.call("HMGET", amounts_key, unpack(ids))
            for j = 1, #values do
                sum = sum + (tonumber(values[j]) or 0)
            end
        end
        return sum
    end

    -- sum of entries with slot <= cutoff, without removing them
    local function sum_expired(slots_key, amounts_key, cutoff_ms)
        local sum = 0
        local offset = 0
        while true do
            local expired = redis.call("ZRANGE", slots_key, "-inf", cutoff_ms, "BYSCORE", "LIMIT", offset, PAGE)
            sum = sum + sum_amounts(amounts_key, expired)
            if #expired < PAGE then
                return sum
            end
            offset = offset + PAGE
        end
    end

    -- distinct records with a slot in the score range, across dimensions
    local function count_records(slots_keys, min, max)
        local seen = {}
        local count = 0
        for i = 1, #slots_keys do
            local ids = redis.call("ZRANGE", slots_keys[i], min, max, "BYSCORE")
            for j = 1, #ids do
                if not seen[ids[j]] then
                    seen[ids[j]] = true
                    count = count + 1
                end
            end
        end
        return count
    end
"#;

const RESERVE_SCRIPT: &str = r#"
    local function evict(slots_key, amounts_key, totals_key, records_key, cutoff_ms)
        while true do
            local expired = redis.call("ZRANGE", slots_key, "-inf", cutoff_ms, "BYSCORE", "LIMIT", 0, PAGE)
            if #expired == 0 then
                break
            end

            redis.call("DECRBY", totals_key, int(sum_amounts(amounts_key, expired)))
            redis.call("HDEL", amounts_key, unpack(expired))
            redis.call("ZREM", slots_key, unpack(expired))
            redis.call("HDEL", records_key, unpack(expired))

            if #expired < PAGE then
                break
            end
        end

        if redis.call("ZCARD", slots_key) == 0 then
            redis.call("DEL", totals_key)
        end
    end

    -- walks live entries in expiry order until enough has been released
    local function earliest_available(slots_key, amounts_key, now_ms, window_ms, used, needed, limit)
        if used + needed <= limit then
            return now_ms
        end

        local released = 0
        local available_at = now_ms
        local offset = 0
        while true do
            local page = redis.call("ZRANGE", slots_key, offset, offset + PAGE - 1, "WITHSCORES")
            if #page == 0 then
                return available_at
            end

            local ids = {}
            for j = 1, #page, 2 do
                ids[#ids + 1] = page[j]
            end

            local values = redis.call("HMGET", amounts_key, unpack(ids))
            for j = 1, #ids do
                released = released + (tonumber(values[j]) or 0)
                available_at = tonumber(page[2 * j]) + window_ms
                if used + needed - released <= limit then
                    return available_at
                end
            end

            offset = offset + PAGE
        end
    end

    local now_ms = server_now_ms()

    local records_key = KEYS[1]
    local expiries_key = KEYS[2]
    local dimension_count = (#KEYS - 2) / 3

    local record_id = ARGV[1]
    local window_ms = tonumber(ARGV[2])
    local burst_multiplier = tonumber(ARGV[3])
    local pending_status = ARGV[4]

    redis.call("ZREMRANGEBYSCORE", expiries_key, "-inf", now_ms)

    local slot_time_ms = now_ms
    local slots_keys = {}

    for i = 1, dimension_count do
        local slots_key = KEYS[3 * i]
        local amounts_key = KEYS[3 * i + 1]
        local totals_key = KEYS[3 * i + 2]
        local needed = tonumber(ARGV[3 + 2 * i])
        local limit = math.floor(tonumber(ARGV[4 + 2 * i]) * burst_multiplier)

        slots_keys[i] = slots_key

        evict(slots_key, amounts_key, totals_key, records_key, now_ms - window_ms)

        local used = math.max(0, tonumber(redis.call("GET", totals_key)) or 0)
        local available_at = earliest_available(slots_key, amounts_key, now_ms, window_ms, used, needed, limit)
        if available_at > slot_time_ms then
            slot_time_ms = available_at
        end
    end

    local queue_position = 0
    if slot_time_ms > now_ms then
        queue_position = count_records(slots_keys, "-inf", slot_time_ms)
    end

    -- write the reservation and keep keys alive until their last entry expires
    for i = 1, dimension_count do
        local slots_key = KEYS[3 * i]
        local amounts_key = KEYS[3 * i + 1]
        local totals_key = KEYS[3 * i + 2]

        redis.call("ZADD", slots_key, slot_time_ms, record_id)
        redis.call("HSET", amounts_key, record_id, ARGV[3 + 2 * i])
        redis.call("INCRBY", totals_key, ARGV[3 + 2 * i])

        local last = redis.call("ZRANGE", slots_key, -1, -1, "WITHSCORES")
        local key_ttl_ms = tonumber(last[2]) + window_ms - now_ms

        redis.call("PEXPIRE", slots_key, key_ttl_ms)
        redis.call("PEXPIRE", amounts_key, key_ttl_ms)
        redis.call("PEXPIRE", totals_key, key_ttl_ms)
    end

    redis.call("ZADD", expiries_key, slot_time_ms + window_ms, record_id)
    redis.call("HSET", records_key, record_id, pending_status)

    local last = redis.call("ZRANGE", expiries_key, -1, -1, "WITHSCORES")
    local ttl_ms = tonumber(last[2]) - now_ms
    redis.call("PEXPIRE", expiries_key, ttl_ms)
    redis.call("PEXPIRE", records_key, ttl_ms)

    return {slot_time_ms, queue_position, now_ms}
"#;

const ADJUST_SCRIPT: &str = r#"
    local now_ms = server_now_ms()

    local records_key = KEYS[1]
    local expiries_key = KEYS[2]
    local dimension_count = (#KEYS - 2) / 2

    local record_id = ARGV[1]
    local adjusted_status = ARGV[2]

    -- expired records are gone even if nothing has evicted them yet
    local expiry_ms = redis.call("ZSCORE", expiries_key, record_id)
    if not expiry_ms or tonumber(expiry_ms) <= now_ms then
        return 0
    end

    local adjusted = 0
    for i = 1, dimension_count do
        local amounts_key = KEYS[1 + 2 * i]
        local totals_key = KEYS[2 + 2 * i]
        local amount = ARGV[2 + i]

        local previous = redis.call("HGET", amounts_key, record_id)
        if previous then
            redis.call("HSET", amounts_key, record_id, amount)
            redis.call("INCRBY", totals_key, int(tonumber(amount) - tonumber(previous)))
            adjusted = adjusted + 1
        end
    end

    if adjusted > 0 then
        redis.call("HSET", records_key, record_id, adjusted_status)
    end

    return adjusted
"#;

const USAGE_SCRIPT: &str = r#"
    local now_ms = server_now_ms()

    local window_ms = tonumber(ARGV[1])
    local dimension_count = #KEYS / 3

    local result = {}
    local slots_keys = {}

    for i = 1, dimension_count do
        local slots_key = KEYS[3 * i - 2]
        local amounts_key = KEYS[3 * i - 1]
        local totals_key = KEYS[3 * i]

        slots_keys[i] = slots_key

        -- read-only: entries past their window are subtracted, not evicted
        local total = tonumber(redis.call("GET", totals_key)) or 0
        local used = total - sum_expired(slots_key, amounts_key, now_ms - window_ms)
        if used < 0 then
            used = 0
        end

        result[i] = used
    end

    result[dimension_count + 1] = count_records(slots_keys, "(" .. now_ms, "+inf")

    return result
"#;

struct DimensionKeys {
    slots: Arc<str>,
    amounts: Arc<str>,
    totals: Arc<str>,
}

/// [`ReservationStore`] backed by Redis.
///
/// Every operation is a single Lua script, so check-and-reserve is atomic
/// within Redis across all dimensions of a resource. Timestamps come from the
/// Redis server clock, so callers on different hosts agree on "now".
///
/// # Requirements
///
/// - **Redis:** >= 6.2.0 (`ZRANGE ... BYSCORE`)
///
/// # Examples
///
/// ```ignore
/// use std::sync::Arc;
/// use llm_admission::redis::{RedisConnectionManager, RedisConnectionOptions, RedisReservationStore};
/// use llm_admission::AdmissionEngine;
///
/// let connections = RedisConnectionManager::connect(RedisConnectionOptions::default()).await?;
/// let engine = AdmissionEngine::new(Arc::new(RedisReservationStore::new(connections, None)));
/// ```
pub struct RedisReservationStore {
    connections: RedisConnectionManager,
    key_generator: RedisKeyGenerator,
    reserve_script: Script,
    adjust_script: Script,
    usage_script: Script,
}

impl RedisReservationStore {
    /// Create a store issuing its scripts through `connections`.
    ///
    /// Keys are namespaced under `prefix`, or `llm_admission` when `None`.
    pub fn new(connections: RedisConnectionManager, prefix: Option<ResourceKey>) -> Self {
        let prefix = prefix.unwrap_or_else(ResourceKey::default_prefix);

        Self {
            connections,
            key_generator: RedisKeyGenerator::new(prefix),
            reserve_script: Script::new(&format!("{SCRIPT_PRELUDE}{RESERVE_SCRIPT}")),
            adjust_script: Script::new(&format!("{SCRIPT_PRELUDE}{ADJUST_SCRIPT}")),
            usage_script: Script::new(&format!("{SCRIPT_PRELUDE}{USAGE_SCRIPT}")),
        }
    }

    /// The pool scripts are issued through.
    pub fn connections(&self) -> &RedisConnectionManager {
        &self.connections
    }

    fn dimension_keys(&self, key: &ResourceKey, dimension: Dimension) -> DimensionKeys {
        DimensionKeys {
            slots: self.key_generator.get_slots_key(key, dimension),
            amounts: self.key_generator.get_amounts_key(key, dimension),
            totals: self.key_generator.get_totals_key(key, dimension),
        }
    }
}

#[async_trait]
impl ReservationStore for RedisReservationStore {
    async fn reserve(&self, request: &ReservationRequest) -> Result<Reservation, AdmissionError> {
        let records_key = self.key_generator.get_records_key(&request.key);
        let expiries_key = self.key_generator.get_expiries_key(&request.key);
        let dimension_keys: Vec<DimensionKeys> = request
            .dimensions
            .iter()
            .map(|d| self.dimension_keys(&request.key, d.dimension))
            .collect();

        let (slot_time_ms, queue_position, now_ms): (u64, u64, u64) = self
            .connections
            .execute(|mut connection| {
                let mut invocation = self.reserve_script.prepare_invoke();
                invocation.key(&*records_key).key(&*expiries_key);
                for keys in &dimension_keys {
                    invocation
                        .key(&*keys.slots)
                        .key(&*keys.amounts)
                        .key(&*keys.totals);
                }

                invocation
                    .arg(request.record_id.as_str())
                    .arg(request.window_ms)
                    .arg(*request.burst_multiplier)
                    .arg(RecordStatus::Pending.as_str());
                for dimension in &request.dimensions {
                    invocation.arg(dimension.amount).arg(dimension.limit);
                }

                async move { Ok(invocation.invoke_async(&mut *connection).await?) }
            })
            .await?;

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
        let records_key = self.key_generator.get_records_key(key);
        let expiries_key = self.key_generator.get_expiries_key(key);
        let dimension_keys: Vec<DimensionKeys> = amounts
            .iter()
            .map(|(dimension, _)| self.dimension_keys(key, *dimension))
            .collect();

        let adjusted: usize = self
            .connections
            .execute(|mut connection| {
                let mut invocation = self.adjust_script.prepare_invoke();
                invocation
                    .key(&*records_key)
                    .key(&*expiries_key)
                    .arg(record_id.as_str())
                    .arg(RecordStatus::Adjusted.as_str());
                for (keys, (_, amount)) in dimension_keys.iter().zip(amounts) {
                    invocation.key(&*keys.amounts).key(&*keys.totals).arg(*amount);
                }

                async move { Ok(invocation.invoke_async(&mut *connection).await?) }
            })
            .await?;

        Ok(match adjusted {
            0 => AdjustOutcome::NotFound,
            dimensions => AdjustOutcome::Adjusted { dimensions },
        })
    }

    async fn usage(
        &self,
        key: &ResourceKey,
        dimensions: &[Dimension],
        window_ms: u64,
    ) -> Result<LedgerUsage, AdmissionError> {
        let dimension_keys: Vec<DimensionKeys> = dimensions
            .iter()
            .map(|d| self.dimension_keys(key, *d))
            .collect();

        let values: Vec<u64> = self
            .connections
            .execute(|mut connection| {
                let mut invocation = self.usage_script.prepare_invoke();
                for keys in &dimension_keys {
                    invocation
                        .key(&*keys.slots)
                        .key(&*keys.amounts)
                        .key(&*keys.totals);
                }
                invocation.arg(window_ms);

                async move { Ok(invocation.invoke_async(&mut *connection).await?) }
            })
            .await?;

        let Some((queue_depth, used)) = values.split_last() else {
            return Err(AdmissionError::Store(StoreError::new(
                StoreErrorKind::Protocol,
                "empty reply from usage script",
            )));
        };

        Ok(LedgerUsage {
            used: dimensions.iter().copied().zip(used.iter().copied()).collect(),
            queue_depth: *queue_depth,
        })
    }
}
