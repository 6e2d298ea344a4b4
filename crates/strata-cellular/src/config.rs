use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::retry::RetryTable;
use crate::types::RadioAccessTechnology;

pub const DEFAULT_QUEUE_CAPACITY: usize = 32;
const MIN_QUEUE_CAPACITY: usize = 4;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CellularConfigInput {
    pub sim_pin: Option<String>,
    pub plmn: Option<String>,
    pub radio_access_technology: Option<RadioAccessTechnology>,
    pub retry_timeouts_s: Option<Vec<u64>>,
    pub startup_delay_max_ms: Option<u64>,
    pub queue_capacity: Option<usize>,
    pub timeouts: TimeoutsInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimeoutsInput {
    pub power_on_ms: Option<u64>,
    pub sim_pin_ms: Option<u64>,
    pub network_ms: Option<u64>,
    pub registration_ms: Option<u64>,
    pub connect_ms: Option<u64>,
}

/// Collaborator response timeouts applied before each state's operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationTimeouts {
    pub power_on: Duration,
    pub sim_pin: Duration,
    pub network: Duration,
    pub registration: Duration,
    pub connect: Duration,
}

impl Default for OperationTimeouts {
    fn default() -> Self {
        Self {
            power_on: Duration::from_secs(1),
            sim_pin: Duration::from_secs(1),
            network: Duration::from_secs(10),
            registration: Duration::from_secs(180),
            connect: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CellularConfig {
    pub sim_pin: Option<String>,
    /// Operator to pin registration to. `None` accepts any network.
    pub plmn: Option<String>,
    pub radio_access_technology: Option<RadioAccessTechnology>,
    pub retry: RetryTable,
    /// Upper bound of the randomized delay between a cold Init and PowerOn.
    pub startup_delay_max: Duration,
    pub queue_capacity: usize,
    pub timeouts: OperationTimeouts,
}

impl Default for CellularConfig {
    fn default() -> Self {
        Self {
            sim_pin: None,
            plmn: None,
            radio_access_technology: None,
            retry: RetryTable::default(),
            startup_delay_max: Duration::ZERO,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            timeouts: OperationTimeouts::default(),
        }
    }
}

impl CellularConfigInput {
    pub fn resolve(self) -> Result<CellularConfig, ConfigError> {
        let defaults = OperationTimeouts::default();
        let ms_or = |v: Option<u64>, d: Duration| v.map(Duration::from_millis).unwrap_or(d);
        let timeouts = OperationTimeouts {
            power_on: ms_or(self.timeouts.power_on_ms, defaults.power_on),
            sim_pin: ms_or(self.timeouts.sim_pin_ms, defaults.sim_pin),
            network: ms_or(self.timeouts.network_ms, defaults.network),
            registration: ms_or(self.timeouts.registration_ms, defaults.registration),
            connect: ms_or(self.timeouts.connect_ms, defaults.connect),
        };

        let retry = match self.retry_timeouts_s {
            Some(secs) => RetryTable::from_secs(&secs),
            None => RetryTable::default(),
        };

        Ok(CellularConfig {
            sim_pin: validate_pin(self.sim_pin.as_deref())?,
            plmn: validate_plmn(self.plmn.as_deref())?,
            radio_access_technology: self.radio_access_technology,
            retry,
            startup_delay_max: Duration::from_millis(self.startup_delay_max_ms.unwrap_or(0)),
            queue_capacity: self
                .queue_capacity
                .unwrap_or(DEFAULT_QUEUE_CAPACITY)
                .max(MIN_QUEUE_CAPACITY),
            timeouts,
        })
    }
}

impl CellularConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(CellularConfig::default());
        }
        let parsed: CellularConfigInput = toml::from_str(input)?;
        parsed.resolve()
    }
}

/// Blank means "no PIN". Otherwise 4-8 ASCII digits.
pub fn validate_pin(pin: Option<&str>) -> Result<Option<String>, ConfigError> {
    let Some(pin) = pin.map(str::trim).filter(|p| !p.is_empty()) else {
        return Ok(None);
    };
    if (4..=8).contains(&pin.len()) && pin.bytes().all(|b| b.is_ascii_digit()) {
        Ok(Some(pin.to_string()))
    } else {
        Err(ConfigError::InvalidPin)
    }
}

/// Blank means "any operator". Otherwise MCC+MNC, 5-6 ASCII digits.
pub fn validate_plmn(plmn: Option<&str>) -> Result<Option<String>, ConfigError> {
    let Some(plmn) = plmn.map(str::trim).filter(|p| !p.is_empty()) else {
        return Ok(None);
    };
    if (5..=6).contains(&plmn.len()) && plmn.bytes().all(|b| b.is_ascii_digit()) {
        Ok(Some(plmn.to_string()))
    } else {
        Err(ConfigError::InvalidPlmn(plmn.to_string()))
    }
}
