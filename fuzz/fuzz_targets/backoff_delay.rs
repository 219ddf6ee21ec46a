#![no_main]

use std::time::Duration;

use libfuzzer_sys::fuzz_target;
use mender_retry::{BackoffConfig, calculate_delay};

fuzz_target!(|data: (u32, u64, u64, u8)| {
    let (attempt, base_ms, max_ms, jitter_byte) = data;

    let attempt = attempt % 100 + 1; // 1-100
    let base_delay = Duration::from_millis(base_ms % 10_000 + 1);
    let max_delay = Duration::from_millis(max_ms % 300_000 + 100);
    let jitter = (jitter_byte as f64) / 255.0; // 0.0-1.0

    let config = BackoffConfig { max_attempts: 100, base_delay, max_delay, jitter };

    let delay = calculate_delay(&config, attempt);

    // Without jitter the result is exactly the capped exponential delay.
    if jitter == 0.0 {
        assert!(delay <= max_delay);
    }
});
