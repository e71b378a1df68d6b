//! Configuration management for the Redfire clock synchronization engine

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub general: GeneralConfig,
    pub windows: WindowConfig,
    pub estimator: EstimatorConfig,
    pub service: ServiceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Name of the synchronization peer (reference server) this instance tracks
    pub peer_name: String,
    pub description: String,
}

/// Window sizes, all measured in stamp counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowConfig {
    pub warmup_win: u64,
    pub shift_win: u64,
    pub plocal_win: u64,
    pub offset_win: u64,
    /// Width of the search window for the next long-baseline phat stamp
    pub jsearch_win: u64,
    pub history_win: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimatorConfig {
    /// Nominal counter frequency; only seeds the period before the first pair exists
    pub counter_frequency_hz: f64,
    /// SKM timescale in seconds
    pub skm_scale: f64,
    /// Timestamping noise limit in seconds
    pub ts_limit: f64,
    /// Pessimistic bound on the rate error used to age point errors
    pub rate_err_bound: f64,
    /// Absolute "excellent" threshold for phat candidates (relative rate error)
    pub best_skm_rate: f64,
    pub offset_ratio: f64,
    pub offset_quality_factor: f64,
    pub plocal_quality: f64,
    pub phat_sanity: f64,
    pub plocal_sanity: f64,
    /// Offset sanity floor in seconds
    pub offset_sanity_min: f64,
    /// Offset sanity growth in seconds per second since the last reliable estimate
    pub offset_sanity_rate: f64,
    /// Upward level shift threshold in seconds
    pub shift_threshold: f64,
    pub warmup_winratio: u64,
    pub plocal_winratio: u64,
    pub rollover_fussiness: f64,
    pub using_plocal: bool,
    pub plocal_in_warmup: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Capacity of the stamp channel feeding the engine
    pub channel_capacity: usize,
    /// Emit one diagnostic event per processed stamp
    pub emit_diagnostics: bool,
    /// Optional JSON-lines file receiving the per-stamp diagnostic records
    pub telemetry_file: Option<String>,
    /// Published parameters older than this (seconds of counter time) are stale
    pub stale_after: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "compact")]
    Compact,
    #[serde(rename = "full")]
    Full,
}

impl WindowConfig {
    /// Derive stamp-count windows from wall-time scales (seconds).
    pub fn from_timescales(poll_period: f64, skm_scale: f64, history_scale: f64) -> Result<Self> {
        if !(poll_period.is_finite() && poll_period > 0.0) {
            return Err(Error::invalid_config("poll period must be positive"));
        }
        let stamps = |secs: f64| (secs / poll_period).ceil() as u64;

        let warmup_win = 100;
        let shift_win = stamps(2.0 * skm_scale).max(warmup_win + 1);
        let plocal_win = stamps(5.0 * skm_scale).max(warmup_win + 1);
        let offset_win = stamps(skm_scale).max(2);
        let jsearch_win = warmup_win;
        let mut history_win = stamps(history_scale)
            .max(2 * (warmup_win + shift_win) + 2)
            .max(2 * plocal_win);
        if history_win % 2 == 1 {
            history_win += 1;
        }

        let windows = Self {
            warmup_win,
            shift_win,
            plocal_win,
            offset_win,
            jsearch_win,
            history_win,
        };
        windows.validate()?;
        Ok(windows)
    }

    /// Check the ordering invariants the pipeline relies on.
    pub fn validate(&self) -> Result<()> {
        let half = self.history_win / 2;

        if self.warmup_win < 2 {
            return Err(Error::invalid_config("warmup_win must be at least 2"));
        }
        if self.offset_win < 2 {
            return Err(Error::invalid_config("offset_win must be at least 2"));
        }
        if self.jsearch_win == 0 {
            return Err(Error::invalid_config("jsearch_win must be positive"));
        }
        if self.warmup_win >= self.shift_win {
            return Err(Error::invalid_config("warmup_win must be smaller than shift_win"));
        }
        if self.warmup_win >= self.plocal_win {
            return Err(Error::invalid_config("warmup_win must be smaller than plocal_win"));
        }
        if self.warmup_win >= half {
            return Err(Error::invalid_config("warmup_win must be smaller than history_win/2"));
        }
        if half <= self.warmup_win + self.shift_win {
            return Err(Error::invalid_config(
                "history_win/2 must exceed warmup_win + shift_win",
            ));
        }
        if self.plocal_win > half {
            return Err(Error::invalid_config("plocal_win must not exceed history_win/2"));
        }
        if self.jsearch_win > half {
            return Err(Error::invalid_config("jsearch_win must not exceed history_win/2"));
        }
        if self.offset_win > half {
            return Err(Error::invalid_config("offset_win must not exceed history_win/2"));
        }

        Ok(())
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            warmup_win: 100,
            shift_win: 128,
            plocal_win: 320,
            offset_win: 64,
            jsearch_win: 100,
            history_win: 37_800,
        }
    }
}

impl EstimatorConfig {
    /// Offset weighting scale in seconds
    pub fn eoffset(&self) -> f64 {
        self.offset_ratio * self.ts_limit
    }

    /// Point error below which an offset window is considered usable
    pub fn eoffset_quality(&self) -> f64 {
        self.offset_quality_factor * self.eoffset()
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("counter_frequency_hz", self.counter_frequency_hz),
            ("skm_scale", self.skm_scale),
            ("ts_limit", self.ts_limit),
            ("rate_err_bound", self.rate_err_bound),
            ("best_skm_rate", self.best_skm_rate),
            ("offset_ratio", self.offset_ratio),
            ("offset_quality_factor", self.offset_quality_factor),
            ("plocal_quality", self.plocal_quality),
            ("phat_sanity", self.phat_sanity),
            ("plocal_sanity", self.plocal_sanity),
            ("offset_sanity_min", self.offset_sanity_min),
            ("offset_sanity_rate", self.offset_sanity_rate),
            ("shift_threshold", self.shift_threshold),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(Error::invalid_config(format!("{} must be positive and finite", name)));
            }
        }

        if self.warmup_winratio == 0 || self.plocal_winratio == 0 {
            return Err(Error::invalid_config("window ratios must be positive"));
        }
        if !(self.rollover_fussiness > 0.0 && self.rollover_fussiness <= 1.0) {
            return Err(Error::invalid_config("rollover_fussiness must be in (0, 1]"));
        }

        Ok(())
    }
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            counter_frequency_hz: 1e9,
            skm_scale: 1024.0,
            ts_limit: 15e-6,
            rate_err_bound: 5e-7,
            best_skm_rate: 2e-7,
            offset_ratio: 6.0,
            offset_quality_factor: 3.0,
            plocal_quality: 8e-7,
            phat_sanity: 1.5e-6,
            plocal_sanity: 1.5e-6,
            offset_sanity_min: 1.5e-3,
            offset_sanity_rate: 1e-5,
            shift_threshold: 1.5e-4,
            warmup_winratio: 4,
            plocal_winratio: 5,
            rollover_fussiness: 0.5,
            using_plocal: true,
            plocal_in_warmup: false,
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            emit_diagnostics: false,
            telemetry_file: None,
            stale_after: 3600.0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            format: LogFormat::Full,
        }
    }
}

impl SyncConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: SyncConfig = toml::from_str(&contents)
            .map_err(|e| Error::parse(format!("Invalid TOML: {}", e)))?;
        Ok(config)
    }

    pub fn load_from_env() -> Result<Self> {
        let mut settings = config::Config::builder();

        // Load from environment variables with CLOCKSYNC_ prefix, e.g.
        // CLOCKSYNC_WINDOWS__WARMUP_WIN=100
        settings = settings.add_source(
            config::Environment::with_prefix("CLOCKSYNC")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
        );

        let config = settings.build()?;
        let sync_config = config.try_deserialize()?;
        Ok(sync_config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::internal(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.windows.validate()?;
        self.estimator.validate()?;

        if self.service.channel_capacity == 0 {
            return Err(Error::invalid_config("service channel capacity must be positive"));
        }
        if !(self.service.stale_after.is_finite() && self.service.stale_after > 0.0) {
            return Err(Error::invalid_config("stale_after must be positive"));
        }

        Ok(())
    }

    pub fn default_config() -> Self {
        Self {
            general: GeneralConfig {
                peer_name: "ntp-server-1".to_string(),
                description: "Redfire bidirectional clock synchronization".to_string(),
            },
            windows: WindowConfig::default(),
            estimator: EstimatorConfig::default(),
            service: ServiceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SyncConfig::default_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_window_invariants() {
        let mut windows = WindowConfig::default();
        windows.shift_win = windows.warmup_win;
        assert!(windows.validate().is_err());

        let mut windows = WindowConfig::default();
        windows.plocal_win = windows.warmup_win - 1;
        assert!(windows.validate().is_err());

        let mut windows = WindowConfig::default();
        windows.history_win = 2 * (windows.warmup_win + windows.shift_win);
        assert!(windows.validate().is_err());

        let mut windows = WindowConfig::default();
        windows.history_win = 2 * (windows.warmup_win + windows.shift_win) + 2;
        windows.plocal_win = windows.history_win;
        assert!(windows.validate().is_err());
    }

    #[test]
    fn test_windows_from_timescales() {
        let windows = WindowConfig::from_timescales(16.0, 1024.0, 7.0 * 86400.0).unwrap();
        assert_eq!(windows, WindowConfig::default());

        let fast = WindowConfig::from_timescales(1.0, 64.0, 3600.0).unwrap();
        assert!(fast.validate().is_ok());
        assert_eq!(fast.offset_win, 64);

        assert!(WindowConfig::from_timescales(0.0, 1024.0, 3600.0).is_err());
    }

    #[test]
    fn test_estimator_validation() {
        let mut estimator = EstimatorConfig::default();
        estimator.ts_limit = f64::NAN;
        assert!(estimator.validate().is_err());

        let mut estimator = EstimatorConfig::default();
        estimator.rollover_fussiness = 1.5;
        assert!(estimator.validate().is_err());

        let estimator = EstimatorConfig::default();
        assert!((estimator.eoffset() - 9e-5).abs() < 1e-12);
        assert!((estimator.eoffset_quality() - 2.7e-4).abs() < 1e-12);
    }

    #[test]
    fn test_config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clocksync.toml");

        let mut config = SyncConfig::default_config();
        config.general.peer_name = "stratum1.example.net".to_string();
        config.service.telemetry_file = Some("/tmp/diag.jsonl".to_string());
        config.save_to_file(&path).unwrap();

        let loaded = SyncConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[windows\nwarmup_win = ").unwrap();

        assert!(matches!(SyncConfig::load_from_file(&path), Err(Error::Parse(_))));
    }
}
