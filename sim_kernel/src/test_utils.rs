//! Test utilities
//!
//! Helpers for tests that boot a [`Platform`](crate::Platform) and need to
//! wait for its threads to get somewhere.

use crate::config::KernelConfig;
use dtu::DtuConfig;
use std::thread;
use std::time::{Duration, Instant};

/// A small machine: eight PEs, 64 KiB of memory and short poll intervals
pub fn small_config() -> KernelConfig {
    KernelConfig {
        dtu: DtuConfig {
            max_pes: 8,
            mem_size: 64 * 1024,
            wait_timeout_us: 50,
            engine_idle_us: 50,
        },
        ..KernelConfig::default()
    }
}

/// Polls `predicate` until it holds or `timeout` passed
///
/// Returns whether the predicate held in the end.
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_config_is_valid() {
        assert!(small_config().validate().is_ok());
    }

    #[test]
    fn test_wait_until() {
        let mut calls = 0;
        assert!(wait_until(Duration::from_secs(1), || {
            calls += 1;
            calls == 3
        }));
        assert!(!wait_until(Duration::from_millis(5), || false));
    }
}
