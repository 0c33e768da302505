//! Daemon configuration.
//!
//! Loaded once at startup from TOML. A missing file yields the
//! defaults; a file that exists but does not parse or validate is a
//! configuration error and the daemon exits with the config exit code
//! before any monitoring starts.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;
use vigil_common::VigilError;

use crate::machine::Thresholds;

pub const CONFIG_PATH: &str = "/etc/vigil/config.toml";

fn default_heartbeat_interval_secs() -> f64 {
    10.0
}

fn default_coop_stall_threshold_secs() -> f64 {
    300.0
}

fn default_coop_check_interval_secs() -> f64 {
    5.0
}

fn default_watchdog_check_interval_secs() -> f64 {
    5.0
}

fn default_watchdog_stall_threshold_secs() -> f64 {
    30.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Business-loop heartbeat cadence.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: f64,

    /// Cooperative loop guard: heartbeat age that counts as a stall.
    #[serde(default = "default_coop_stall_threshold_secs")]
    pub coop_stall_threshold_secs: f64,

    /// Cooperative monitor tick cadence, independent of the thread
    /// watchdog's polling rate.
    #[serde(default = "default_coop_check_interval_secs")]
    pub coop_check_interval_secs: f64,

    /// Thread watchdog polling interval.
    #[serde(default = "default_watchdog_check_interval_secs")]
    pub watchdog_check_interval_secs: f64,

    /// Thread watchdog stall threshold. Much tighter than the
    /// cooperative one on purpose: the thread sees stalls the wedged
    /// scheduler cannot.
    #[serde(default = "default_watchdog_stall_threshold_secs")]
    pub watchdog_stall_threshold_secs: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            coop_stall_threshold_secs: default_coop_stall_threshold_secs(),
            coop_check_interval_secs: default_coop_check_interval_secs(),
            watchdog_check_interval_secs: default_watchdog_check_interval_secs(),
            watchdog_stall_threshold_secs: default_watchdog_stall_threshold_secs(),
        }
    }
}

fn default_safe_mode_ttl_secs() -> f64 {
    600.0
}

fn default_success_cycles() -> u32 {
    3
}

fn default_warn_error_threshold() -> u32 {
    3
}

fn default_critical_error_threshold() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Maximum continuous time in SAFE_MODE before FATAL.
    #[serde(default = "default_safe_mode_ttl_secs")]
    pub safe_mode_ttl_secs: f64,

    /// Consecutive successful recovery cycles required per climb.
    #[serde(default = "default_success_cycles")]
    pub success_cycles: u32,

    /// Consecutive errors before RUNNING degrades.
    #[serde(default = "default_warn_error_threshold")]
    pub warn_error_threshold: u32,

    /// Consecutive errors before SAFE_MODE.
    #[serde(default = "default_critical_error_threshold")]
    pub critical_error_threshold: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        RecoveryConfig {
            safe_mode_ttl_secs: default_safe_mode_ttl_secs(),
            success_cycles: default_success_cycles(),
            warn_error_threshold: default_warn_error_threshold(),
            critical_error_threshold: default_critical_error_threshold(),
        }
    }
}

fn default_chaos_enabled() -> bool {
    false
}

fn default_chaos_max_duration_secs() -> f64 {
    600.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChaosConfig {
    /// Off unless explicitly enabled; never enable in production.
    #[serde(default = "default_chaos_enabled")]
    pub enabled: bool,

    #[serde(default = "default_chaos_max_duration_secs")]
    pub max_duration_secs: f64,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        ChaosConfig {
            enabled: default_chaos_enabled(),
            max_duration_secs: default_chaos_max_duration_secs(),
        }
    }
}

fn default_socket_path() -> String {
    "/run/vigil/vigild.sock".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        ControlConfig {
            socket_path: default_socket_path(),
        }
    }
}

fn default_pulse_interval_secs() -> f64 {
    10.0
}

fn default_supervisor_timeout_secs() -> f64 {
    30.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisionConfig {
    /// Supervisor keep-alive cadence.
    #[serde(default = "default_pulse_interval_secs")]
    pub pulse_interval_secs: f64,

    /// Supervisor-side watchdog timeout this daemon is configured
    /// against. The pulse must fit at least twice into it.
    #[serde(default = "default_supervisor_timeout_secs")]
    pub supervisor_timeout_secs: f64,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        SupervisionConfig {
            pulse_interval_secs: default_pulse_interval_secs(),
            supervisor_timeout_secs: default_supervisor_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub chaos: ChaosConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub supervision: SupervisionConfig,
}

impl DaemonConfig {
    /// Load from `path`. Missing file means defaults; anything else
    /// that goes wrong is a configuration error.
    pub fn load(path: &Path) -> Result<Self, VigilError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                info!("no config at {}, using defaults", path.display());
                let config = DaemonConfig::default();
                config.validate()?;
                return Ok(config);
            }
            Err(err) => {
                return Err(VigilError::Configuration(format!(
                    "cannot read {}: {}",
                    path.display(),
                    err
                )))
            }
        };
        let config: DaemonConfig = toml::from_str(&content).map_err(|err| {
            VigilError::Configuration(format!("cannot parse {}: {}", path.display(), err))
        })?;
        config.validate()?;
        info!("config loaded from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), VigilError> {
        let m = &self.monitor;
        for (name, value) in [
            ("monitor.heartbeat_interval_secs", m.heartbeat_interval_secs),
            ("monitor.coop_stall_threshold_secs", m.coop_stall_threshold_secs),
            ("monitor.coop_check_interval_secs", m.coop_check_interval_secs),
            ("monitor.watchdog_check_interval_secs", m.watchdog_check_interval_secs),
            ("monitor.watchdog_stall_threshold_secs", m.watchdog_stall_threshold_secs),
            ("recovery.safe_mode_ttl_secs", self.recovery.safe_mode_ttl_secs),
            ("chaos.max_duration_secs", self.chaos.max_duration_secs),
            ("supervision.pulse_interval_secs", self.supervision.pulse_interval_secs),
            ("supervision.supervisor_timeout_secs", self.supervision.supervisor_timeout_secs),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(VigilError::Configuration(format!(
                    "{} must be a positive number, got {}",
                    name, value
                )));
            }
        }

        if m.watchdog_stall_threshold_secs >= m.coop_stall_threshold_secs {
            return Err(VigilError::Configuration(format!(
                "watchdog_stall_threshold_secs ({}) must be below coop_stall_threshold_secs ({}); \
                 the thread watchdog is the tighter ring",
                m.watchdog_stall_threshold_secs, m.coop_stall_threshold_secs
            )));
        }
        if m.coop_check_interval_secs >= m.coop_stall_threshold_secs {
            return Err(VigilError::Configuration(format!(
                "coop_check_interval_secs ({}) must be below coop_stall_threshold_secs ({})",
                m.coop_check_interval_secs, m.coop_stall_threshold_secs
            )));
        }
        if m.heartbeat_interval_secs >= m.watchdog_stall_threshold_secs {
            return Err(VigilError::Configuration(format!(
                "heartbeat_interval_secs ({}) must be below watchdog_stall_threshold_secs ({})",
                m.heartbeat_interval_secs, m.watchdog_stall_threshold_secs
            )));
        }
        if self.supervision.pulse_interval_secs * 2.0 > self.supervision.supervisor_timeout_secs {
            return Err(VigilError::Configuration(format!(
                "pulse_interval_secs ({}) must fit at least twice into supervisor_timeout_secs ({})",
                self.supervision.pulse_interval_secs, self.supervision.supervisor_timeout_secs
            )));
        }
        if self.recovery.warn_error_threshold == 0
            || self.recovery.warn_error_threshold >= self.recovery.critical_error_threshold
        {
            return Err(VigilError::Configuration(format!(
                "warn_error_threshold ({}) must be nonzero and below critical_error_threshold ({})",
                self.recovery.warn_error_threshold, self.recovery.critical_error_threshold
            )));
        }
        if self.recovery.success_cycles == 0 {
            return Err(VigilError::Configuration(
                "recovery.success_cycles must be nonzero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            warn_errors: self.recovery.warn_error_threshold,
            critical_errors: self.recovery.critical_error_threshold,
            recovery_cycles: self.recovery.success_cycles,
            safe_mode_ttl: Duration::from_secs_f64(self.recovery.safe_mode_ttl_secs),
        }
    }
}
