//! Environment variable utilities
//!
//! # Usage
//!
//! ```ignore
//! use sluice_core::env::{env_get, env_get_bool, env_get_duration_ms};
//!
//! let threads: usize = env_get("SLUICE_THREAD_COUNT", 4);
//! let no_delay = env_get_bool("SLUICE_NO_DELAY", true);
//! let heartbeat = env_get_duration_ms("SLUICE_HEARTBEAT_MS", Duration::from_secs(1));
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Get environment variable parsed as `T`, or return `default`
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable as boolean
///
/// Accepts "1", "true", "yes", "on" as true and "0", "false", "no", "off"
/// as false (case-insensitive). Anything else, including unset, returns
/// the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Get environment variable as optional value
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Get a millisecond count as a [`Duration`]
#[inline]
pub fn env_get_duration_ms(key: &str, default: Duration) -> Duration {
    env_get_opt::<u64>(key)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__SLUICE_TEST_UNSET_12345__", 42);
        assert_eq!(val, 42);
        assert_eq!(env_get_opt::<u16>("__SLUICE_TEST_UNSET_12345__"), None);
    }

    #[test]
    fn test_env_get_parses() {
        std::env::set_var("__SLUICE_TEST_THREADS__", " 6 ");
        let val: usize = env_get("__SLUICE_TEST_THREADS__", 1);
        assert_eq!(val, 6);
        std::env::remove_var("__SLUICE_TEST_THREADS__");
    }

    #[test]
    fn test_env_get_bool() {
        std::env::set_var("__SLUICE_TEST_BOOL__", "off");
        assert!(!env_get_bool("__SLUICE_TEST_BOOL__", true));
        std::env::set_var("__SLUICE_TEST_BOOL__", "Yes");
        assert!(env_get_bool("__SLUICE_TEST_BOOL__", false));
        std::env::set_var("__SLUICE_TEST_BOOL__", "maybe");
        assert!(env_get_bool("__SLUICE_TEST_BOOL__", true));
        std::env::remove_var("__SLUICE_TEST_BOOL__");
    }

    #[test]
    fn test_env_get_duration() {
        std::env::set_var("__SLUICE_TEST_MS__", "250");
        assert_eq!(
            env_get_duration_ms("__SLUICE_TEST_MS__", Duration::ZERO),
            Duration::from_millis(250)
        );
        std::env::set_var("__SLUICE_TEST_MS__", "abc");
        assert_eq!(
            env_get_duration_ms("__SLUICE_TEST_MS__", Duration::from_secs(1)),
            Duration::from_secs(1)
        );
        std::env::remove_var("__SLUICE_TEST_MS__");
    }
}
