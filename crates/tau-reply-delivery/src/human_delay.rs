//! Randomized pacing between consecutive block replies.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

const NATURAL_MIN_DELAY_MS: u64 = 800;
const NATURAL_MAX_DELAY_MS: u64 = 2_500;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HumanDelayMode {
    #[default]
    Off,
    Natural,
    Custom,
}

/// Delay policy applied before every block reply except the first one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct HumanDelayConfig {
    pub mode: HumanDelayMode,
    /// Lower bound used by `custom` mode.
    pub min_ms: u64,
    /// Upper bound used by `custom` mode.
    pub max_ms: u64,
}

impl HumanDelayConfig {
    pub fn off() -> Self {
        Self::default()
    }

    pub fn natural() -> Self {
        Self {
            mode: HumanDelayMode::Natural,
            ..Self::default()
        }
    }

    pub fn custom(min_ms: u64, max_ms: u64) -> Self {
        Self {
            mode: HumanDelayMode::Custom,
            min_ms,
            max_ms,
        }
    }

    /// Returns the inclusive millisecond range, or `None` when pacing is disabled.
    pub fn range_ms(&self) -> Option<(u64, u64)> {
        match self.mode {
            HumanDelayMode::Off => None,
            HumanDelayMode::Natural => Some((NATURAL_MIN_DELAY_MS, NATURAL_MAX_DELAY_MS)),
            HumanDelayMode::Custom => {
                let (low, high) = if self.min_ms <= self.max_ms {
                    (self.min_ms, self.max_ms)
                } else {
                    (self.max_ms, self.min_ms)
                };
                if high == 0 {
                    None
                } else {
                    Some((low, high))
                }
            }
        }
    }

    pub fn sample(&self) -> Option<Duration> {
        let (low, high) = self.range_ms()?;
        let delay_ms = if low == high {
            low
        } else {
            rand::thread_rng().gen_range(low..=high)
        };
        Some(Duration::from_millis(delay_ms))
    }
}
