//! Registry configuration: recording mode and snapshot geometry.
//!
//! Settings arrive as a comma separated `key=value` string, the same shape the
//! settings notifier hands over:
//!
//! ```text
//! mode=HISTORICAL_MODE_ENABLED_ACTIVE,baseIntervalMillis=900000,intervalMultiplier=10
//! ```
//!
//! Missing keys keep their defaults. Anything malformed rejects the whole
//! string so a half-applied update can never change the on-disk geometry.

use std::path::PathBuf;

/// Default width of the live window and of depth-0 slots (15 minutes).
pub const DEFAULT_BASE_INTERVAL_MS: i64 = 15 * 60 * 1000;

/// Default growth factor between consecutive depths.
pub const DEFAULT_MULTIPLIER: i64 = 10;

/// Widest accepted base interval (one year).
pub const MAX_BASE_INTERVAL_MS: i64 = 365 * 24 * 60 * 60 * 1000;

/// Largest accepted growth factor between depths.
pub const MAX_MULTIPLIER: i64 = 1_000;

/// Hard cap on the number of depth files.
pub const DEFAULT_MAX_DEPTH: usize = 32;

const KEY_MODE: &str = "mode";
const KEY_BASE_INTERVAL: &str = "baseIntervalMillis";
const KEY_MULTIPLIER: &str = "intervalMultiplier";

/// Whether history is collected and kept.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HistoricalMode {
    /// Nothing is recorded; stored history is deleted.
    Disabled,
    /// Stored history is kept and queryable, nothing new is recorded.
    EnabledPassive,
    /// Live events are recorded.
    EnabledActive,
}

impl HistoricalMode {
    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim() {
            "HISTORICAL_MODE_DISABLED" | "disabled" => Ok(Self::Disabled),
            "HISTORICAL_MODE_ENABLED_PASSIVE" | "passive" => Ok(Self::EnabledPassive),
            "HISTORICAL_MODE_ENABLED_ACTIVE" | "active" => Ok(Self::EnabledActive),
            other => Err(format!("Unknown historical mode: {}", other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "HISTORICAL_MODE_DISABLED",
            Self::EnabledPassive => "HISTORICAL_MODE_ENABLED_PASSIVE",
            Self::EnabledActive => "HISTORICAL_MODE_ENABLED_ACTIVE",
        }
    }

    #[inline]
    pub fn is_enabled(self) -> bool {
        self != Self::Disabled
    }
}

impl std::fmt::Display for HistoricalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mode plus snapshot geometry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PersistenceParams {
    pub mode: HistoricalMode,
    /// Width of the live window and of depth-0 slots
    pub base_interval_ms: i64,
    /// Each depth's slots are this many times wider than the previous depth's
    pub multiplier: i64,
}

impl Default for PersistenceParams {
    fn default() -> Self {
        Self {
            mode: HistoricalMode::EnabledActive,
            base_interval_ms: DEFAULT_BASE_INTERVAL_MS,
            multiplier: DEFAULT_MULTIPLIER,
        }
    }
}

impl PersistenceParams {
    pub fn new(mode: HistoricalMode, base_interval_ms: i64, multiplier: i64) -> Self {
        Self {
            mode,
            base_interval_ms,
            multiplier,
        }
    }

    /// Parse a settings string on top of the defaults.
    pub fn parse(settings: &str) -> Result<Self, String> {
        let mut params = Self::default();
        for pair in settings.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("Malformed setting (expected key=value): {}", pair))?;
            let value = value.trim();
            match key.trim() {
                KEY_MODE => params.mode = HistoricalMode::parse(value)?,
                KEY_BASE_INTERVAL => {
                    params.base_interval_ms = value
                        .parse()
                        .map_err(|e| format!("Invalid {}: {} ({})", KEY_BASE_INTERVAL, value, e))?;
                }
                KEY_MULTIPLIER => {
                    params.multiplier = value
                        .parse()
                        .map_err(|e| format!("Invalid {}: {} ({})", KEY_MULTIPLIER, value, e))?;
                }
                other => return Err(format!("Unknown setting: {}", other)),
            }
        }
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(1..=MAX_BASE_INTERVAL_MS).contains(&self.base_interval_ms) {
            return Err(format!(
                "{} must be between 1 and {}, got {}",
                KEY_BASE_INTERVAL, MAX_BASE_INTERVAL_MS, self.base_interval_ms
            ));
        }
        if !(2..=MAX_MULTIPLIER).contains(&self.multiplier) {
            return Err(format!(
                "{} must be between 2 and {}, got {}",
                KEY_MULTIPLIER, MAX_MULTIPLIER, self.multiplier
            ));
        }
        Ok(())
    }

    /// True when switching to `other` changes the on-disk layout.
    pub fn geometry_differs(&self, other: &PersistenceParams) -> bool {
        self.base_interval_ms != other.base_interval_ms || self.multiplier != other.multiplier
    }
}

/// Everything needed to open a registry.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Directory holding one file per depth plus the layout header
    pub history_dir: PathBuf,
    pub params: PersistenceParams,
    /// Depth files beyond this are never written
    pub max_depth: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            history_dir: PathBuf::from("./var/data/history"),
            params: PersistenceParams::default(),
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl RegistryConfig {
    pub fn new(history_dir: impl Into<PathBuf>, params: PersistenceParams) -> Self {
        Self {
            history_dir: history_dir.into(),
            params,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}
