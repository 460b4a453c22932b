use pulse_core::notify::NotificationPolicy;
use pulse_core::schedule::SchedulePolicy;
use pulse_core::wire::DEFAULT_MAX_FRAME_BYTES;
use serde::{Deserialize, Serialize};
use std::{
    env, fs, io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use url::Url;

pub const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8000/ws/schedules";
pub const DEFAULT_API_BASE: &str = "http://127.0.0.1:8000";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid url {value:?}: {source}")]
    Url {
        value: String,
        #[source]
        source: url::ParseError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub base_delay_ms: u64,
    pub multiplier: u32,
    pub max_delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            multiplier: 2,
            max_delay_ms: 30_000,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given reconnect attempt, counting from 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let cap = self.max_delay_ms.max(1);
        let factor = u64::from(self.multiplier.max(1));
        let mut delay = self.base_delay_ms.max(1);
        for _ in 1..attempt {
            if delay >= cap {
                break;
            }
            delay = delay.saturating_mul(factor);
        }
        Duration::from_millis(delay.min(cap))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatPolicy {
    pub ping_interval_ms: u64,
    /// Silence longer than this marks the socket stale.
    pub timeout_ms: u64,
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self {
            ping_interval_ms: 10_000,
            timeout_ms: 30_000,
        }
    }
}

impl HeartbeatPolicy {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }
}

/// On-disk policy overrides. Every table and key is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyFile {
    pub reconnect: ReconnectPolicy,
    pub heartbeat: HeartbeatPolicy,
    pub notifications: NotificationPolicy,
    pub schedule: SchedulePolicy,
}

pub fn load_policy_file(path: &Path) -> Result<PolicyFile, ConfigError> {
    if !path.exists() {
        return Ok(PolicyFile::default());
    }
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub ws_url: Url,
    pub api_base: Url,
    pub client_id: String,
    pub max_frame_bytes: usize,
    pub reconnect: ReconnectPolicy,
    pub heartbeat: HeartbeatPolicy,
    pub notifications: NotificationPolicy,
    pub schedule: SchedulePolicy,
}

impl ClientConfig {
    pub fn new(ws_url: Url, api_base: Url) -> Self {
        Self {
            ws_url,
            api_base,
            client_id: resolve_client_id(""),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            reconnect: ReconnectPolicy::default(),
            heartbeat: HeartbeatPolicy::default(),
            notifications: NotificationPolicy::default(),
            schedule: SchedulePolicy::default(),
        }
    }

    pub fn with_policies(mut self, policies: PolicyFile) -> Self {
        self.reconnect = policies.reconnect;
        self.heartbeat = policies.heartbeat;
        self.notifications = policies.notifications;
        self.schedule = policies.schedule;
        self
    }
}

pub fn parse_url(value: &str) -> Result<Url, ConfigError> {
    Url::parse(value.trim()).map_err(|source| ConfigError::Url {
        value: value.to_string(),
        source,
    })
}

pub fn env_true(key: &str) -> bool {
    match env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn resolve_value(flag: &str, key: &str, fallback: impl FnOnce() -> String) -> String {
    if !flag.trim().is_empty() {
        return flag.trim().to_string();
    }
    if let Ok(value) = env::var(key) {
        if !value.trim().is_empty() {
            return value.trim().to_string();
        }
    }
    fallback()
}

pub fn resolve_ws_url(flag: &str) -> String {
    resolve_value(flag, "PULSE_WS_URL", || DEFAULT_WS_URL.to_string())
}

pub fn resolve_api_base(flag: &str) -> String {
    resolve_value(flag, "PULSE_API_BASE", || DEFAULT_API_BASE.to_string())
}

/// Empty unless configured; an empty dir means stdout only.
pub fn resolve_log_dir(flag: &str) -> String {
    resolve_value(flag, "PULSE_LOG_DIR", String::new)
}

pub fn resolve_client_id(flag: &str) -> String {
    resolve_value(flag, "PULSE_CLIENT_ID", || {
        format!("pid-{}", std::process::id())
    })
}

pub fn resolve_config_path(flag: &str) -> PathBuf {
    let value = resolve_value(flag, "PULSE_CONFIG_PATH", String::new);
    if !value.is_empty() {
        return PathBuf::from(value);
    }
    config_dir().join("pulse/monitor.toml")
}

fn config_dir() -> PathBuf {
    if let Ok(path) = env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(path);
    }
    env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".config")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reconnect_delays_double_up_to_the_cap() {
        let policy = ReconnectPolicy::default();
        let delays = (1..=7)
            .map(|attempt| policy.delay_for(attempt).as_secs())
            .collect::<Vec<_>>();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(policy.delay_for(500), Duration::from_secs(30));
    }

    #[test]
    fn missing_policy_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let policies = load_policy_file(&dir.path().join("absent.toml")).expect("load");
        assert_eq!(policies, PolicyFile::default());
        assert_eq!(policies.heartbeat.timeout(), Duration::from_secs(30));
        assert_eq!(policies.notifications.capacity, 5);
    }

    #[test]
    fn partial_policy_file_keeps_remaining_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            "[heartbeat]\ntimeout_ms = 5000\n\n[notifications]\ncapacity = 8\n\n[schedule]\nat_risk_window_hours = 48"
        )
        .expect("write");

        let policies = load_policy_file(file.path()).expect("load");
        assert_eq!(policies.heartbeat.timeout_ms, 5_000);
        assert_eq!(policies.heartbeat.ping_interval_ms, 10_000);
        assert_eq!(policies.notifications.capacity, 8);
        assert_eq!(policies.schedule.at_risk_window_hours, 48);
        assert_eq!(policies.schedule.bottleneck_gap_pct, 15.0);
        assert_eq!(policies.reconnect, ReconnectPolicy::default());
    }

    #[test]
    fn malformed_policy_file_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "[reconnect\nbase_delay_ms = ").expect("write");
        let err = load_policy_file(file.path()).expect_err("malformed");
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn flag_wins_over_env_and_default() {
        env::set_var("PULSE_TEST_RESOLVE_KEY", "from-env");
        assert_eq!(
            resolve_value(" from-flag ", "PULSE_TEST_RESOLVE_KEY", || "fallback".to_string()),
            "from-flag"
        );
        assert_eq!(
            resolve_value("", "PULSE_TEST_RESOLVE_KEY", || "fallback".to_string()),
            "from-env"
        );
        assert_eq!(
            resolve_value("", "PULSE_TEST_RESOLVE_KEY_UNSET", || "fallback".to_string()),
            "fallback"
        );
        env::remove_var("PULSE_TEST_RESOLVE_KEY");
    }

    #[test]
    fn log_file_is_opt_in() {
        env::remove_var("PULSE_LOG_DIR");
        assert_eq!(resolve_log_dir(""), "");
        assert_eq!(resolve_log_dir("/var/log/pulse"), "/var/log/pulse");
    }

    #[test]
    fn invalid_url_is_reported() {
        assert!(parse_url("ws://127.0.0.1:9/ws").is_ok());
        assert!(matches!(parse_url("not a url"), Err(ConfigError::Url { .. })));
    }
}
