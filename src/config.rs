use std::{fs, path::Path, time::Duration};

use serde::Deserialize;

/// Engine configuration, loadable from TOML.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// number of async worker threads, range [1, 32768), defaults to 16
    pub async_worker_thread_number: u16,
    /// safety limits applied to pagination, loops, and retries
    pub limits: Limits,
}

/// Safety-limit constants. Defaults are operator-overridable via config.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Limits {
    /// maximum pages fetched by one fetch-all-pages sequence
    pub max_pages: u64,
    /// maximum aggregate items fetched by one fetch-all-pages sequence
    pub max_items: usize,
    /// wall-clock budget for one fetch-all-pages sequence, in seconds
    pub page_budget_seconds: u64,
    /// maximum simultaneous steps across the whole run
    pub max_parallel_steps: usize,
    /// maximum simultaneous in-flight iterations inside one loop step
    pub max_loop_concurrency: usize,
    /// default gateway call timeout, in seconds (steps may raise it)
    pub call_timeout_seconds: u64,
    /// default additional retry attempts when a retry policy omits a count
    pub default_retry_count: u64,
    /// default delay between retry attempts, in seconds
    pub default_retry_delay_seconds: u64,
    /// sessions idle beyond this many seconds are swept
    pub session_idle_seconds: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_pages: 100,
            max_items: 10_000,
            page_budget_seconds: 120,
            max_parallel_steps: 8,
            max_loop_concurrency: 5,
            call_timeout_seconds: 30,
            default_retry_count: 3,
            default_retry_delay_seconds: 1,
            session_idle_seconds: 1800,
        }
    }
}

impl Limits {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_seconds)
    }

    pub fn page_budget(&self) -> Duration {
        Duration::from_secs(self.page_budget_seconds)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            async_worker_thread_number: 16,
            limits: Limits::default(),
        }
    }
}

impl Config {
    pub fn create<T: AsRef<Path>>(path: T) -> Self {
        let data = fs::read_to_string(path.as_ref()).expect(&format!("failed to load config file {:?}", path.as_ref()));

        Self::load_from_str(data.as_str())
    }

    pub fn load_from_str(toml_str: &str) -> Self {
        let config = toml::from_str::<Config>(toml_str).expect("failed to parse the toml str");
        config
    }
}

#[cfg(test)]
mod test {
    use crate::Config;

    #[test]
    fn test_config_deserialize() {
        let toml_str = r#"
        async_worker_thread_number = 10

        [limits]
        max_pages = 20
        max_items = 500
        "#;
        let config = Config::load_from_str(toml_str);
        assert_eq!(config.async_worker_thread_number, 10);
        assert_eq!(config.limits.max_pages, 20);
        assert_eq!(config.limits.max_items, 500);
        // untouched fields keep their defaults
        assert_eq!(config.limits.page_budget_seconds, 120);
        assert_eq!(config.limits.max_loop_concurrency, 5);
    }

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.async_worker_thread_number, 16);
        assert_eq!(config.limits.max_pages, 100);
        assert_eq!(config.limits.max_items, 10_000);
        assert_eq!(config.limits.session_idle_seconds, 1800);
    }
}
