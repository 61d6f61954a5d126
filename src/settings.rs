//! Environment-driven engine configuration.
//!
//! Every field has a default so the struct is always constructable; a
//! bare `stampede` run works against localhost with one local node.

use std::env;

#[derive(Debug, Clone)]
pub struct Settings {
    /// Master host the slaves connect to.
    pub master: String,

    /// Control-channel port. 0 lets the master pick an ephemeral port.
    pub master_port: u16,

    /// Addresses expected to register before jobs are dispatched.
    pub slaves: Vec<String>,

    /// Per-worker run length in seconds; `<= 0` runs until an explicit
    /// stop arrives.
    pub worker_timeout: i64,

    /// Queue poll interval of the worker stop notice, in seconds.
    pub worker_check_interval: u64,

    /// Test duration in seconds used by the launchers.
    pub test_duration: u64,
}

impl Settings {
    /// Parses the configuration from environment variables.
    pub fn from_env() -> Self {
        let master = env::var("MASTER").unwrap_or_else(|_| "127.0.0.1".to_string());

        let master_port = env::var("MASTER_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(9001);

        let slaves: Vec<String> = env::var("SLAVES")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        let slaves = if slaves.is_empty() {
            vec!["127.0.0.1".to_string()]
        } else {
            slaves
        };

        let worker_timeout = env::var("WORKER_TIMEOUT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(-1);

        let worker_check_interval = env::var("WORKER_CHECK_INTERVAL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);

        let test_duration = env::var("TEST_DURATION")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);

        Self {
            master,
            master_port,
            slaves,
            worker_timeout,
            worker_check_interval,
            test_duration,
        }
    }

    /// Settings for unit tests: localhost, one node, short intervals.
    #[cfg(test)]
    pub fn for_testing() -> Self {
        Self {
            master: "127.0.0.1".to_string(),
            master_port: 0,
            slaves: vec!["127.0.0.1".to_string()],
            worker_timeout: -1,
            worker_check_interval: 1,
            test_duration: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "MASTER",
            "MASTER_PORT",
            "SLAVES",
            "WORKER_TIMEOUT",
            "WORKER_CHECK_INTERVAL",
            "TEST_DURATION",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn defaults_when_environment_is_empty() {
        clear_env();
        let settings = Settings::from_env();
        assert_eq!(settings.master, "127.0.0.1");
        assert_eq!(settings.master_port, 9001);
        assert_eq!(settings.slaves, vec!["127.0.0.1".to_string()]);
        assert_eq!(settings.worker_timeout, -1);
        assert_eq!(settings.worker_check_interval, 1);
        assert_eq!(settings.test_duration, 60);
    }

    #[test]
    #[serial]
    fn environment_overrides_are_parsed() {
        clear_env();
        env::set_var("MASTER", "10.0.0.5");
        env::set_var("MASTER_PORT", "9100");
        env::set_var("SLAVES", "10.0.0.6, 10.0.0.7");
        env::set_var("WORKER_TIMEOUT", "30");
        env::set_var("TEST_DURATION", "120");

        let settings = Settings::from_env();
        assert_eq!(settings.master, "10.0.0.5");
        assert_eq!(settings.master_port, 9100);
        assert_eq!(
            settings.slaves,
            vec!["10.0.0.6".to_string(), "10.0.0.7".to_string()]
        );
        assert_eq!(settings.worker_timeout, 30);
        assert_eq!(settings.test_duration, 120);
        clear_env();
    }

    #[test]
    #[serial]
    fn malformed_numbers_fall_back_to_defaults() {
        clear_env();
        env::set_var("MASTER_PORT", "not-a-port");
        env::set_var("WORKER_TIMEOUT", "soon");
        let settings = Settings::from_env();
        assert_eq!(settings.master_port, 9001);
        assert_eq!(settings.worker_timeout, -1);
        clear_env();
    }
}
