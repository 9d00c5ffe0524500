//! Exponential backoff schedules.
//!
//! Used for two purposes that share the same curve:
//! - polling an axis' settling predicate after a write ([`crate::axis::SettlePolicy`])
//! - spacing retries of transient driver failures ([`crate::engine::RetryPolicy`])
//!
//! The default curve waits 30ms, then grows by a factor of 1.5 per attempt up to a
//! 200ms ceiling (30, 45, 67.5, 101.25, 151.875, 200, 200, ...).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff curve.
///
/// # Example
///
/// ```rust
/// use daq_sequencer::backoff::Backoff;
/// use std::time::Duration;
///
/// let delays: Vec<Duration> = Backoff::default().delays().take(3).collect();
/// assert_eq!(delays[0], Duration::from_millis(30));
/// assert_eq!(delays[1], Duration::from_millis(45));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    /// First delay
    #[serde(with = "humantime_serde", default = "default_initial")]
    pub initial: Duration,
    /// Growth factor applied after each delay (>= 1.0)
    #[serde(default = "default_factor")]
    pub factor: f64,
    /// Ceiling for any single delay
    #[serde(with = "humantime_serde", default = "default_max")]
    pub max: Duration,
}

fn default_initial() -> Duration {
    Duration::from_millis(30)
}

fn default_factor() -> f64 {
    1.5
}

fn default_max() -> Duration {
    Duration::from_millis(200)
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: default_initial(),
            factor: default_factor(),
            max: default_max(),
        }
    }
}

impl Backoff {
    /// Constant delay, no growth.
    pub fn constant(delay: Duration) -> Self {
        Self {
            initial: delay,
            factor: 1.0,
            max: delay,
        }
    }

    /// Delay before the `n`th retry (0-based).
    pub fn delay_for(&self, n: u32) -> Duration {
        let grown = self.initial.as_secs_f64() * self.factor.powi(n.min(64) as i32);
        let capped = grown.min(self.max.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Infinite iterator over successive delays.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0u32..).map(move |n| self.delay_for(n))
    }

    /// Semantic checks used by configuration validation.
    pub fn validate(&self) -> Result<(), String> {
        if !self.factor.is_finite() || self.factor < 1.0 {
            return Err(format!("backoff factor must be >= 1.0, got {}", self.factor));
        }
        if self.max < self.initial {
            return Err("backoff max must be >= initial".to_string());
        }
        Ok(())
    }
}
