//! Backoff table configuration.

use serde::Deserialize;

/// Penalty in seconds for each backoff level.
pub const DEFAULT_BACKOFF_LUT: [u32; 10] = [0, 2, 4, 8, 16, 32, 64, 128, 256, 512];

/// Seconds without a new failure before the level drops by one.
pub const DEFAULT_DECAY_LUT: [u32; 10] = [4, 4, 8, 16, 30, 30, 30, 30, 30, 30];

/// Backoff configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub lut: Vec<u32>,
    pub decay_lut: Vec<u32>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            lut: DEFAULT_BACKOFF_LUT.to_vec(),
            decay_lut: DEFAULT_DECAY_LUT.to_vec(),
        }
    }
}

impl BackoffConfig {
    /// Validate the backoff tables.
    pub fn validate(&self) -> Result<(), String> {
        if self.lut.is_empty() {
            return Err("backoff.lut must not be empty".into());
        }
        if self.lut.len() != self.decay_lut.len() {
            return Err(format!(
                "backoff.lut has {} entries but backoff.decay_lut has {}",
                self.lut.len(),
                self.decay_lut.len()
            ));
        }
        if self.lut.iter().any(|v| *v > i32::MAX as u32) {
            return Err("backoff.lut values must fit in a signed 32-bit integer".into());
        }
        Ok(())
    }
}
