use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Reconnect delays in milliseconds, indexed by consecutive failed attempts.
/// The last value is the cap.
pub const DEFAULT_BACKOFF_MS: [u64; 10] = [0, 1000, 1000, 1000, 3000, 3000, 3000, 3000, 3000, 5000];

/// Agent-level configuration: control channel, timers and local surfaces
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// WebSocket URL of the coordinator
    pub control_url: String,
    /// Prefix of the per-process client identifier sent in `register`
    pub client_id_prefix: String,
    /// Reconnect delay table in ms (monotonic non-decreasing, last entry is the cap)
    pub backoff_ms: Vec<u64>,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Upper bound on waiting for a provisioned worker to report ready
    #[serde(with = "humantime_serde")]
    pub provision_timeout: Duration,
    /// Max terminal frames held while the control channel is down
    pub outbox_capacity: usize,
    /// Port of the local status/metrics HTTP server (0 disables it)
    pub status_port: u16,
    /// Directory for persisted worker snapshot and activity log
    pub state_dir: Option<PathBuf>,
    pub retry: RetryConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            control_url: "ws://127.0.0.1:8765/ws".to_string(),
            client_id_prefix: "relay".to_string(),
            backoff_ms: DEFAULT_BACKOFF_MS.to_vec(),
            heartbeat_interval: Duration::from_secs(10),
            provision_timeout: Duration::from_secs(30),
            outbox_capacity: 256,
            status_port: 9090,
            state_dir: None,
            retry: RetryConfig::default(),
        }
    }
}

/// Recovery sequence parameters used by the retry coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Blocked reports tolerated per job before `MAX_RETRIES_EXCEEDED`
    pub attempt_budget: u32,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Overall ceiling of one recovery session
    #[serde(with = "humantime_serde")]
    pub recovery_timeout: Duration,
    /// How long a worker must have been idle before a job resumes on it
    #[serde(with = "humantime_serde")]
    pub stability_window: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempt_budget: 5,
            poll_interval: Duration::from_secs(1),
            recovery_timeout: Duration::from_secs(30),
            stability_window: Duration::from_millis(3000),
        }
    }
}

/// Headless Chrome worker host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TabPoolConfig {
    /// true = headless (faster, detectable), false = headfull (slower, better stealth)
    pub headless: bool,
    /// Path to browser binary. If None, uses default Chrome/Chromium auto-detection.
    pub browser_path: Option<PathBuf>,
    pub window_size: (u32, u32),
    /// How often each tab's challenge sensor is sampled
    #[serde(with = "humantime_serde")]
    pub sensor_interval: Duration,
    /// How long a job waits for its tab to become idle before `PREPARATION_TIMEOUT`
    #[serde(with = "humantime_serde")]
    pub preparation_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub navigation_timeout: Duration,
    pub stealth: StealthLevel,
}

impl Default for TabPoolConfig {
    fn default() -> Self {
        Self {
            headless: true,
            browser_path: None,
            window_size: (1920, 1080),
            sensor_interval: Duration::from_millis(500),
            preparation_timeout: Duration::from_secs(20),
            navigation_timeout: Duration::from_secs(30),
            stealth: StealthLevel::default(),
        }
    }
}

/// How much the Chrome launch is tuned to look like a regular browser
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StealthLevel {
    /// Plain launch flags
    Off,
    /// Hide automation markers (`--disable-blink-features=AutomationControlled`)
    #[default]
    Basic,
}

impl FromStr for StealthLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "basic" => Ok(Self::Basic),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_carry_fixed_timings() {
        let config = AgentConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.provision_timeout, Duration::from_secs(30));
        assert_eq!(config.retry.attempt_budget, 5);
        assert_eq!(config.retry.poll_interval, Duration::from_secs(1));
        assert_eq!(config.retry.recovery_timeout, Duration::from_secs(30));
        assert_eq!(config.retry.stability_window, Duration::from_millis(3000));
        assert!(config.backoff_ms.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(TabPoolConfig::default().preparation_timeout, Duration::from_secs(20));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: AgentConfig = serde_json::from_str(
            r#"{"control_url":"ws://coordinator:9000/ws","retry":{"poll_interval":"250ms"}}"#,
        )
        .unwrap();
        assert_eq!(config.control_url, "ws://coordinator:9000/ws");
        assert_eq!(config.retry.poll_interval, Duration::from_millis(250));
        assert_eq!(config.retry.attempt_budget, 5);
        assert_eq!(config.outbox_capacity, 256);
    }

    #[test]
    fn test_stealth_from_str() {
        assert_eq!("OFF".parse::<StealthLevel>(), Ok(StealthLevel::Off));
        assert_eq!("basic".parse::<StealthLevel>(), Ok(StealthLevel::Basic));
        assert!("paranoid".parse::<StealthLevel>().is_err());
    }
}
