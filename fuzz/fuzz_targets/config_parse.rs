#![no_main]

use deathwatch_core::GuardianConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(config) = GuardianConfig::from_toml(text) else {
        return;
    };

    // Validated configs never produce a zero-length sampling period.
    let t = &config.thresholds;
    assert!(!t.heartbeat_interval().is_zero());
    assert!(!t.lag_sample_interval().is_zero());
    assert!(!t.memory_sample_interval().is_zero());
    assert!(!t.lag_resolution().is_zero());
    assert!(t.rss_alarm_mb > 0.0 && t.lag_alarm_ms > 0.0);
});
