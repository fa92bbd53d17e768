//! Environment helpers: centralized dotenv loading and ergonomic getters.
//! Call `init_env()` once early in each binary (or rely on lazy Once).
use std::str::FromStr;
use std::sync::Once;

static INIT: Once = Once::new();

/// Load .env exactly once. Safe to call many times.
pub fn init_env() {
    INIT.call_once(|| {
        let _ = dotenv::dotenv();
    });
}

/// Get required env var; error if missing.
pub fn env_req(key: &str) -> anyhow::Result<String> {
    init_env();
    std::env::var(key).map_err(|_| anyhow::anyhow!("missing env var {key}"))
}

/// Get optional env var (None if unset or empty).
pub fn env_opt(key: &str) -> Option<String> {
    init_env();
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Get parsed value with default fallback.
pub fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr + Clone,
{
    init_env();
    match std::env::var(key) {
        Ok(raw) => raw.parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Boolean flag: 1/true/on/yes (case-insensitive) count as set.
pub fn env_flag(key: &str, default: bool) -> bool {
    init_env();
    match std::env::var(key) {
        Ok(raw) => {
            let v = raw.trim().to_ascii_lowercase();
            matches!(v.as_str(), "1" | "true" | "on" | "yes" | "y" | "t")
        }
        Err(_) => default,
    }
}

/// Comma-separated list of integers, e.g. "10,30,300,900".
pub fn env_list_u64(key: &str, default: &[u64]) -> Vec<u64> {
    init_env();
    match std::env::var(key) {
        Ok(raw) => {
            let parsed: Vec<u64> = raw
                .split(',')
                .filter_map(|part| part.trim().parse::<u64>().ok())
                .collect();
            if parsed.is_empty() {
                default.to_vec()
            } else {
                parsed
            }
        }
        Err(_) => default.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_list_u64_falls_back_on_garbage() {
        std::env::set_var("SLURSBOT_TEST_RETRIES", "not,a,number");
        assert_eq!(env_list_u64("SLURSBOT_TEST_RETRIES", &[10, 30]), vec![10, 30]);
        std::env::remove_var("SLURSBOT_TEST_RETRIES");
    }

    #[test]
    fn env_list_u64_parses_schedule() {
        std::env::set_var("SLURSBOT_TEST_SCHEDULE", "10, 30,300 ,900");
        assert_eq!(
            env_list_u64("SLURSBOT_TEST_SCHEDULE", &[1]),
            vec![10, 30, 300, 900]
        );
        std::env::remove_var("SLURSBOT_TEST_SCHEDULE");
    }
}
