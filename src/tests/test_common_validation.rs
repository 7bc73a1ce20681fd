use crate::{
    AdmissionError, BurstMultiplier, Dimension, RateLimitConfig, RecordId, ResourceKey,
    TokenUsage, WindowSizeSeconds, effective_limit,
};

fn message(err: AdmissionError) -> String {
    match err {
        AdmissionError::InvalidConfig(msg) | AdmissionError::InvalidResourceKey(msg) => msg,
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn window_size_seconds_try_from_validates_min_1() {
    let w = WindowSizeSeconds::try_from(1u64).unwrap();
    assert_eq!(*w, 1u64);
    assert_eq!(w.as_millis(), 1000);

    assert_eq!(
        message(WindowSizeSeconds::try_from(0u64).unwrap_err()),
        "Window size must be at least 1"
    );

    assert_eq!(*WindowSizeSeconds::default(), 60);
}

#[test]
fn burst_multiplier_try_from_validates_positive_and_finite() {
    let b = BurstMultiplier::try_from(1.5f64).unwrap();
    assert_eq!(*b, 1.5f64);

    for bad in [0f64, -1f64, f64::NAN, f64::INFINITY] {
        assert_eq!(
            message(BurstMultiplier::try_from(bad).unwrap_err()),
            "Burst multiplier must be greater than 0"
        );
    }

    assert_eq!(*BurstMultiplier::default(), 1f64);
}

#[test]
fn effective_limit_floors_the_product() {
    let b = BurstMultiplier::try_from(1.5f64).unwrap();
    assert_eq!(effective_limit(100, b), 150);
    assert_eq!(effective_limit(3, b), 4);

    let b = BurstMultiplier::try_from(0.5f64).unwrap();
    assert_eq!(effective_limit(3, b), 1);
    assert_eq!(effective_limit(1, b), 0);
}

#[test]
fn resource_key_try_from_validates_rules() {
    let key = ResourceKey::try_from("gpt-4").unwrap();
    assert_eq!(key.as_str(), "gpt-4");
    assert_eq!(&*key, "gpt-4");

    assert_eq!(
        message(ResourceKey::try_from("").unwrap_err()),
        "resource key must not be empty"
    );
    assert_eq!(
        message(ResourceKey::try_from("a".repeat(256)).unwrap_err()),
        "resource key must not be longer than 255 characters"
    );
    assert_eq!(
        message(ResourceKey::try_from("openai:gpt-4").unwrap_err()),
        "resource key must not contain colons"
    );

    assert!(ResourceKey::try_from("a".repeat(255)).is_ok());
}

#[test]
fn record_id_local_prefix_marks_fail_open_ids() {
    let stored = RecordId::generate();
    let local = RecordId::generate_local();

    assert!(!stored.is_local());
    assert!(local.is_local());
    assert!(local.as_str().starts_with("local-"));
    assert_ne!(RecordId::generate(), stored);
}

#[test]
fn rate_limit_config_rejects_limits_that_round_to_zero() {
    let half = BurstMultiplier::try_from(0.5f64).unwrap();

    let err = RateLimitConfig::new(0, 0, 0, 1, WindowSizeSeconds::default(), half).unwrap_err();
    assert!(message(err).starts_with("effective requests limit rounds to zero"));

    // inactive dimensions are not checked
    let config = RateLimitConfig::new(0, 0, 0, 2, WindowSizeSeconds::default(), half).unwrap();
    assert_eq!(config.effective_limit(Dimension::Requests), 1);
}

#[test]
fn rate_limit_config_reports_active_dimensions() {
    let combined = RateLimitConfig::combined(100_000, 100).unwrap();
    assert_eq!(
        combined.active_dimensions().collect::<Vec<_>>(),
        vec![Dimension::Tokens, Dimension::Requests]
    );

    let split = RateLimitConfig::split(4_000_000, 128_000, 0).unwrap();
    assert_eq!(
        split.active_dimensions().collect::<Vec<_>>(),
        vec![Dimension::InputTokens, Dimension::OutputTokens]
    );
    assert!(!split.is_active(Dimension::Requests));

    let pass_through = RateLimitConfig::combined(0, 0).unwrap();
    assert_eq!(pass_through.active_dimensions().count(), 0);
}

#[test]
fn requested_amounts_cover_active_dimensions_only() {
    let config = RateLimitConfig::new(
        100_000,
        50_000,
        0,
        100,
        WindowSizeSeconds::default(),
        BurstMultiplier::default(),
    )
    .unwrap();

    assert_eq!(
        TokenUsage::split(5000, 2048).requested_amounts(&config),
        vec![
            (Dimension::Tokens, 7048),
            (Dimension::InputTokens, 5000),
            (Dimension::Requests, 1),
        ]
    );

    // explicit combined wins over the parts
    let usage = TokenUsage {
        combined: Some(9000),
        input: Some(5000),
        output: Some(2048),
    };
    assert_eq!(usage.requested_amounts(&config)[0], (Dimension::Tokens, 9000));

    // missing parts count as zero
    assert_eq!(
        TokenUsage::tokens(500).requested_amounts(&config),
        vec![
            (Dimension::Tokens, 500),
            (Dimension::InputTokens, 0),
            (Dimension::Requests, 1),
        ]
    );
}

#[test]
fn actual_amounts_skip_unknown_values() {
    assert_eq!(
        TokenUsage::output(3000).actual_amounts(),
        vec![(Dimension::OutputTokens, 3000)]
    );

    assert_eq!(
        TokenUsage::split(5000, 3000).actual_amounts(),
        vec![
            (Dimension::Tokens, 8000),
            (Dimension::InputTokens, 5000),
            (Dimension::OutputTokens, 3000),
        ]
    );

    assert_eq!(
        TokenUsage::tokens(4210).actual_amounts(),
        vec![(Dimension::Tokens, 4210)]
    );

    assert!(TokenUsage::default().actual_amounts().is_empty());
}
