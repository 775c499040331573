//! Log-distance path loss estimate
//!
//! `distance = 10 ^ ((reference - rssi) / (10 * n))`, where `reference` is the
//! signal strength measured at one meter and `n` the environmental
//! attenuation factor (2.0 in open air). The result is clamped because the
//! model produces absurd values for very weak or very strong readings; the
//! bounds are policy, not physics.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Signal strength reported by radios that have no reading
pub const INVALID_RSSI: i16 = 0;

/// Calibration and clamp bounds of the distance estimate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistanceModel {
    /// Expected RSSI at one meter (dBm)
    pub reference_power: i16,
    /// Path loss exponent
    pub environmental_factor: f64,
    /// Smallest distance ever reported (meters)
    pub min_distance: f64,
    /// Largest distance ever reported (meters)
    pub max_distance: f64,
}

impl Default for DistanceModel {
    fn default() -> Self {
        Self {
            reference_power: -59,
            environmental_factor: 2.0,
            min_distance: 0.01,
            max_distance: 200.0,
        }
    }
}

impl DistanceModel {
    /// Estimate the distance for `rssi` given the strength expected at one meter.
    ///
    /// Returns `None` for the invalid-reading sentinel and when the model
    /// cannot produce a positive value (a NaN factor, inverted or non-positive
    /// bounds).
    pub fn estimate(&self, rssi: i16, reference_at_1m: i16) -> Option<f64> {
        if rssi == INVALID_RSSI {
            return None;
        }

        let ratio = (f64::from(reference_at_1m) - f64::from(rssi))
            / (10.0 * self.environmental_factor);
        let distance = 10f64.powf(ratio);
        if distance.is_nan() || !(self.min_distance <= self.max_distance) {
            return None;
        }

        // Overflow and underflow land on the bounds
        let clamped = distance.clamp(self.min_distance, self.max_distance);
        (clamped > 0.0).then_some(clamped)
    }

    /// Estimate using this model's own reference power
    pub fn estimate_default(&self, rssi: i16) -> Option<f64> {
        self.estimate(rssi, self.reference_power)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.environmental_factor.is_finite() && self.environmental_factor > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "distance.environmental_factor must be positive, got {}",
                self.environmental_factor
            )));
        }
        if !(self.min_distance > 0.0 && self.min_distance < self.max_distance) {
            return Err(ConfigError::Invalid(format!(
                "distance bounds must satisfy 0 < min < max, got [{}, {}]",
                self.min_distance, self.max_distance
            )));
        }
        Ok(())
    }
}

/// Estimate with the default calibration
pub fn estimate_distance(rssi: i16, reference_at_1m: i16) -> Option<f64> {
    DistanceModel::default().estimate(rssi, reference_at_1m)
}
