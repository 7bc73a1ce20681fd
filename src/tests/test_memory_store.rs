use std::{sync::Arc, thread, time::Duration};

use rand::{Rng, SeedableRng, rngs::StdRng};

use super::runtime::{block_on, ms};
use crate::{
    AdjustOutcome, AdmissionEngine, BurstMultiplier, Dimension, InMemoryReservationStore,
    ManualClock, RateLimitConfig, RateLimiter, RecordId, RecordStatus, ResourceKey, TokenUsage,
    WindowSizeSeconds,
};

const T0: u64 = 1_700_000_000_000;
const WINDOW_MS: u64 = 60_000;

struct Harness {
    clock: Arc<ManualClock>,
    store: Arc<InMemoryReservationStore>,
    limiter: RateLimiter,
}

fn harness(config: RateLimitConfig) -> Harness {
    let clock = Arc::new(ManualClock::new(T0));
    let store = Arc::new(InMemoryReservationStore::with_clock(clock.clone()));
    let engine = AdmissionEngine::new(store.clone());
    let limiter = RateLimiter::new(engine, ResourceKey::try_from("gpt-4").unwrap(), config);

    Harness {
        clock,
        store,
        limiter,
    }
}

fn used(h: &Harness, dimension: Dimension) -> u64 {
    block_on(h.limiter.status())
        .unwrap()
        .unwrap()
        .dimension(dimension)
        .unwrap()
        .used
}

#[test]
fn third_request_waits_for_first_to_expire() {
    let h = harness(RateLimitConfig::combined(100_000, 100).unwrap());

    let first = block_on(h.limiter.acquire_tokens(40_000)).unwrap();
    assert_eq!(first.wait_time, Duration::ZERO);
    assert_eq!(first.queue_position, 0);
    assert_eq!(first.status, RecordStatus::Pending);

    let second = block_on(h.limiter.acquire_tokens(40_000)).unwrap();
    assert_eq!(second.wait_time, Duration::ZERO);
    assert_eq!(second.queue_position, 0);

    let third = block_on(h.limiter.acquire_tokens(40_000)).unwrap();
    assert_eq!(ms(third.wait_time), WINDOW_MS);
    assert_eq!(third.slot_time_ms, T0 + WINDOW_MS);
    assert_eq!(third.queue_position, 2);

    // forward reservations count immediately
    let snapshot = block_on(h.limiter.status()).unwrap().unwrap();
    assert_eq!(snapshot.dimension(Dimension::Tokens).unwrap().used, 120_000);
    assert_eq!(snapshot.dimension(Dimension::Requests).unwrap().used, 3);
    assert_eq!(snapshot.queue_depth, 1);
}

#[test]
fn later_requests_queue_behind_forward_reservations() {
    let h = harness(RateLimitConfig::combined(100_000, 0).unwrap());

    for _ in 0..3 {
        block_on(h.limiter.acquire_tokens(40_000)).unwrap();
    }

    let fourth = block_on(h.limiter.acquire_tokens(40_000)).unwrap();
    assert_eq!(fourth.slot_time_ms, T0 + WINDOW_MS);
    assert_eq!(fourth.queue_position, 3);

    let fifth = block_on(h.limiter.acquire_tokens(40_000)).unwrap();
    assert_eq!(fifth.slot_time_ms, T0 + 2 * WINDOW_MS);

    assert_eq!(block_on(h.limiter.status()).unwrap().unwrap().queue_depth, 3);
}

#[test]
fn split_output_adjust_leaves_input_unchanged() {
    let h = harness(RateLimitConfig::split(4_000_000, 128_000, 360).unwrap());

    let result = block_on(h.limiter.acquire_split(5000, 2048)).unwrap();
    assert!(result.is_immediate());
    assert_eq!(used(&h, Dimension::OutputTokens), 2048);

    let outcome = block_on(h.limiter.adjust(&result.record_id, &TokenUsage::output(3000))).unwrap();
    assert_eq!(outcome, AdjustOutcome::Adjusted { dimensions: 1 });

    assert_eq!(used(&h, Dimension::InputTokens), 5000);
    assert_eq!(used(&h, Dimension::OutputTokens), 3000);
    assert_eq!(used(&h, Dimension::Requests), 1);

    assert_eq!(
        h.store.record_status(h.limiter.key(), &result.record_id),
        Some(RecordStatus::Adjusted)
    );
}

#[test]
fn slowest_dimension_decides_the_slot() {
    let h = harness(RateLimitConfig::combined(100_000, 2).unwrap());

    block_on(h.limiter.acquire_tokens(10)).unwrap();
    h.clock.advance(Duration::from_secs(5));
    block_on(h.limiter.acquire_tokens(10)).unwrap();

    // plenty of tokens left, but only two requests per window
    let third = block_on(h.limiter.acquire_tokens(10)).unwrap();
    assert_eq!(third.slot_time_ms, T0 + WINDOW_MS);
    assert_eq!(ms(third.wait_time), WINDOW_MS - 5000);
}

#[test]
fn burst_multiplier_raises_capacity() {
    let config = RateLimitConfig::new(
        100_000,
        0,
        0,
        0,
        WindowSizeSeconds::default(),
        BurstMultiplier::try_from(1.5f64).unwrap(),
    )
    .unwrap();
    let h = harness(config);

    for _ in 0..3 {
        assert!(block_on(h.limiter.acquire_tokens(50_000)).unwrap().is_immediate());
    }
    assert!(!block_on(h.limiter.acquire_tokens(1)).unwrap().is_immediate());
}

#[test]
fn oversized_request_is_admitted_into_an_empty_window() {
    let h = harness(RateLimitConfig::combined(100_000, 0).unwrap());

    let big = block_on(h.limiter.acquire_tokens(150_000)).unwrap();
    assert!(big.is_immediate());

    let next = block_on(h.limiter.acquire_tokens(1)).unwrap();
    assert_eq!(next.slot_time_ms, T0 + WINDOW_MS);
}

#[test]
fn pass_through_config_admits_everything() {
    let h = harness(RateLimitConfig::combined(0, 0).unwrap());

    for _ in 0..10 {
        let result = block_on(h.limiter.acquire_tokens(1_000_000)).unwrap();
        assert!(result.is_immediate());
        assert_eq!(result.queue_position, 0);
    }

    assert_eq!(h.store.resource_count(), 0);
    let snapshot = block_on(h.limiter.status()).unwrap().unwrap();
    assert!(snapshot.dimensions.is_empty());
}

#[test]
fn lowering_an_estimate_frees_capacity() {
    let h = harness(RateLimitConfig::combined(100_000, 0).unwrap());

    let first = block_on(h.limiter.acquire_tokens(40_000)).unwrap();
    block_on(h.limiter.acquire_tokens(40_000)).unwrap();

    block_on(h.limiter.adjust(&first.record_id, &TokenUsage::tokens(10_000))).unwrap();
    assert_eq!(used(&h, Dimension::Tokens), 50_000);

    assert!(block_on(h.limiter.acquire_tokens(40_000)).unwrap().is_immediate());
}

#[test]
fn raising_an_estimate_is_accepted_over_the_limit() {
    let h = harness(RateLimitConfig::combined(100_000, 0).unwrap());

    let first = block_on(h.limiter.acquire_tokens(40_000)).unwrap();
    block_on(h.limiter.adjust(&first.record_id, &TokenUsage::tokens(120_000))).unwrap();

    let snapshot = block_on(h.limiter.status()).unwrap().unwrap();
    let tokens = snapshot.dimension(Dimension::Tokens).unwrap();
    assert_eq!(tokens.used, 120_000);
    assert_eq!(tokens.available(), 0);

    assert!(!block_on(h.limiter.acquire_tokens(1)).unwrap().is_immediate());
}

#[test]
fn adjust_is_idempotent() {
    let h = harness(RateLimitConfig::combined(100_000, 0).unwrap());
    let result = block_on(h.limiter.acquire_tokens(40_000)).unwrap();

    for _ in 0..3 {
        let outcome =
            block_on(h.limiter.adjust(&result.record_id, &TokenUsage::tokens(25_000))).unwrap();
        assert_eq!(outcome, AdjustOutcome::Adjusted { dimensions: 1 });
        assert_eq!(used(&h, Dimension::Tokens), 25_000);
    }
}

#[test]
fn adjust_of_unknown_or_expired_record_is_a_no_op() {
    let h = harness(RateLimitConfig::combined(100_000, 0).unwrap());

    let unknown = RecordId::from("never-stored".to_string());
    assert_eq!(
        block_on(h.limiter.adjust(&unknown, &TokenUsage::tokens(1))).unwrap(),
        AdjustOutcome::NotFound
    );

    let result = block_on(h.limiter.acquire_tokens(40_000)).unwrap();
    h.clock.advance(Duration::from_millis(WINDOW_MS));

    assert_eq!(
        block_on(h.limiter.adjust(&result.record_id, &TokenUsage::tokens(1))).unwrap(),
        AdjustOutcome::NotFound
    );
    assert_eq!(h.store.record_status(h.limiter.key(), &result.record_id), None);
    assert_eq!(used(&h, Dimension::Tokens), 0);
}

#[test]
fn adjust_of_inactive_dimension_is_not_found() {
    let h = harness(RateLimitConfig::combined(100_000, 0).unwrap());
    let result = block_on(h.limiter.acquire_tokens(40_000)).unwrap();

    assert_eq!(
        block_on(h.limiter.adjust(&result.record_id, &TokenUsage::output(10))).unwrap(),
        AdjustOutcome::NotFound
    );
    assert_eq!(used(&h, Dimension::Tokens), 40_000);
}

#[test]
fn entries_expire_after_the_window() {
    let h = harness(RateLimitConfig::combined(100_000, 0).unwrap());

    block_on(h.limiter.acquire_tokens(40_000)).unwrap();
    h.clock.advance(Duration::from_millis(WINDOW_MS - 1));
    assert_eq!(used(&h, Dimension::Tokens), 40_000);

    h.clock.advance(Duration::from_millis(1));
    assert_eq!(used(&h, Dimension::Tokens), 0);
}

#[test]
fn cleanup_forgets_idle_resources() {
    let h = harness(RateLimitConfig::combined(100_000, 0).unwrap());
    let other = RateLimiter::new(
        h.limiter.engine().clone(),
        ResourceKey::try_from("claude").unwrap(),
        h.limiter.config().clone(),
    );

    block_on(h.limiter.acquire_tokens(10)).unwrap();
    h.clock.advance(Duration::from_secs(30));
    block_on(other.acquire_tokens(10)).unwrap();
    assert_eq!(h.store.resource_count(), 2);

    h.clock.advance(Duration::from_secs(30));
    h.store.cleanup();
    assert_eq!(h.store.resource_count(), 1);

    h.clock.advance(Duration::from_secs(30));
    h.store.cleanup();
    assert_eq!(h.store.resource_count(), 0);
}

#[test]
fn honoring_wait_times_never_exceeds_the_limit() {
    const LIMIT: u64 = 10_000;

    let h = harness(RateLimitConfig::combined(LIMIT, 0).unwrap());
    let mut rng = StdRng::seed_from_u64(7);

    for _ in 0..500 {
        let result = block_on(h.limiter.acquire_tokens(rng.random_range(1..=LIMIT))).unwrap();
        assert_eq!(result.queue_position == 0, result.wait_time.is_zero());

        h.clock.set(result.slot_time_ms);
        assert!(used(&h, Dimension::Tokens) <= LIMIT);

        h.clock.advance(Duration::from_millis(rng.random_range(0..2000)));
    }
}

#[test]
fn concurrent_acquisitions_never_overcommit_a_window() {
    const LIMIT: u64 = 20_000;
    const THREADS: u64 = 8;
    const PER_THREAD: u64 = 25;

    let h = harness(RateLimitConfig::combined(LIMIT, 0).unwrap());

    let reservations: Vec<(u64, u64)> = thread::scope(|scope| {
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let limiter = h.limiter.clone();
                let amount = (t + 1) * 500;

                scope.spawn(move || {
                    (0..PER_THREAD)
                        .map(|_| {
                            let result =
                                futures::executor::block_on(limiter.acquire_tokens(amount))
                                    .unwrap();
                            assert_eq!(result.queue_position == 0, result.wait_time.is_zero());

                            (result.slot_time_ms, amount)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect()
    });

    assert_eq!(reservations.len() as u64, THREADS * PER_THREAD);

    // usage only grows when an entry starts, so checking each slot time is enough
    for (instant, _) in &reservations {
        let active: u64 = reservations
            .iter()
            .filter(|(slot, _)| slot <= instant && *instant < slot + WINDOW_MS)
            .map(|(_, amount)| amount)
            .sum();

        assert!(active <= LIMIT, "{active} > {LIMIT} at {instant}");
    }
}
