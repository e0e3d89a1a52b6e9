//! Fuzz target for backoff computation.
//!
//! This tests that retry and rejoin backoffs never panic and always stay
//! within their configured ceilings, whatever the policy numbers are.

#![no_main]

use coordination_engine::coordination::rejoin_backoff;
use coordination_engine::messaging::{BackoffStrategy, RetryPolicy};
use coordination_engine::SessionConfig;
use libfuzzer_sys::fuzz_target;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::Duration;

fuzz_target!(|data: (u32, u32, u32, u8, u8, u64)| {
    let (attempt, base_ms, max_ms, multiplier, strategy, seed) = data;
    let mut rng = StdRng::seed_from_u64(seed);

    let policy = RetryPolicy {
        max_attempts: 10,
        base_delay_ms: u64::from(base_ms),
        max_delay_ms: u64::from(max_ms),
        strategy: match strategy % 4 {
            0 => BackoffStrategy::Fixed,
            1 => BackoffStrategy::Linear,
            2 => BackoffStrategy::Exponential,
            _ => BackoffStrategy::ExponentialJitter,
        },
        multiplier: 1.0 + f64::from(multiplier) / 16.0,
        jitter_factor: 0.1,
    };
    let delay = policy.calculate_backoff_with(attempt, &mut rng);
    assert!(delay <= Duration::from_millis(u64::from(max_ms)));

    let config = SessionConfig {
        initial_backoff_ms: u64::from(base_ms),
        max_backoff_ms: u64::from(max_ms),
        backoff_multiplier: 1.0 + f64::from(multiplier) / 16.0,
        backoff_jitter: 0.1,
        ..SessionConfig::default()
    };
    let rejoin = rejoin_backoff(&config, attempt % 64, &mut rng);
    assert!(rejoin.as_secs_f64() * 1000.0 <= f64::from(max_ms) * 1.1 + 1.0);
});
