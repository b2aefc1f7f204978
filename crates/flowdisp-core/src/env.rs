//! Environment variable helpers
//!
//! Every runtime knob can be overridden from the environment.
//!
//! ```ignore
//! use flowdisp_core::env::{env_get, env_get_bool};
//!
//! let limit: usize = env_get("FDP_DEFAULT_QLIMIT", 256);
//! let direct = env_get_bool("FDP_DIRECT_DISPATCH", true);
//! ```

use std::str::FromStr;

/// Parse an environment variable as `T`, falling back to `default`
///
/// Unset variables and values that fail to parse both yield `default`.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Parse an environment variable as a boolean
///
/// "1", "true", "yes" and "on" are true; "0", "false", "no" and "off" are
/// false (case-insensitive). Anything else, or unset, yields `default`.
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

/// Parse an environment variable as `T` if it is set and valid
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
