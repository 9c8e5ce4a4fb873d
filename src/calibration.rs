use crate::config::EngineConfig;
use crate::types::{haversine_distance, AccelSample, GpsFix, GyroSample};
use log::{info, warn};

/// Result of a calibration pass. Gravity is a scalar magnitude: the device
/// orientation is not fixed, so axis-wise gravity removal would bake in a
/// mounting assumption that breaks the first time the phone shifts.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Calibration {
    pub gravity_mag: f64,
    pub gyro_bias: (f64, f64, f64),
    pub accel_samples: usize,
    pub gyro_samples: usize,
    pub complete: bool,
}

impl Default for Calibration {
    fn default() -> Self {
        Calibration {
            gravity_mag: crate::types::STANDARD_GRAVITY,
            gyro_bias: (0.0, 0.0, 0.0),
            accel_samples: 0,
            gyro_samples: 0,
            complete: false,
        }
    }
}

impl Calibration {
    pub fn bias_magnitude(&self) -> f64 {
        let (x, y, z) = self.gyro_bias;
        (x * x + y * y + z * z).sqrt()
    }
}

/// Startup calibration: accumulate a stationary window (~3 s) and estimate
/// the gravity magnitude and gyro zero-rate bias from sample means.
pub struct InitialCalibrator {
    window_secs: f64,
    min_samples: usize,
    first_ts: Option<f64>,
    accel_mag_sum: f64,
    accel_count: usize,
    gyro_sum: (f64, f64, f64),
    gyro_count: usize,
}

impl InitialCalibrator {
    pub fn new(config: &EngineConfig) -> Self {
        InitialCalibrator {
            window_secs: config.calib_window_secs,
            min_samples: config.calib_min_samples,
            first_ts: None,
            accel_mag_sum: 0.0,
            accel_count: 0,
            gyro_sum: (0.0, 0.0, 0.0),
            gyro_count: 0,
        }
    }

    pub fn feed_accel(&mut self, sample: &AccelSample) {
        self.first_ts.get_or_insert(sample.timestamp);
        self.accel_mag_sum += sample.magnitude();
        self.accel_count += 1;
    }

    pub fn feed_gyro(&mut self, sample: &GyroSample) {
        self.first_ts.get_or_insert(sample.timestamp);
        self.gyro_sum.0 += sample.x;
        self.gyro_sum.1 += sample.y;
        self.gyro_sum.2 += sample.z;
        self.gyro_count += 1;
    }

    /// The window is done once enough time AND enough samples have passed.
    pub fn ready(&self, now: f64) -> bool {
        match self.first_ts {
            Some(first) => now - first >= self.window_secs && self.accel_count >= self.min_samples,
            None => false,
        }
    }

    /// Time alone can also end the window; with too few samples the result is
    /// marked incomplete and defaults stand in.
    pub fn expired(&self, now: f64) -> bool {
        self.first_ts
            .map(|first| now - first >= self.window_secs * 3.0)
            .unwrap_or(false)
    }

    pub fn finish(&self) -> Calibration {
        let complete = self.accel_count >= self.min_samples;
        let gravity_mag = if self.accel_count > 0 {
            self.accel_mag_sum / self.accel_count as f64
        } else {
            crate::types::STANDARD_GRAVITY
        };
        let gyro_bias = if self.gyro_count > 0 {
            let n = self.gyro_count as f64;
            (
                self.gyro_sum.0 / n,
                self.gyro_sum.1 / n,
                self.gyro_sum.2 / n,
            )
        } else {
            (0.0, 0.0, 0.0)
        };
        if complete {
            info!(
                "[CALIB] gravity {:.3} m/s², gyro bias ({:.5}, {:.5}, {:.5}) rad/s from {} samples",
                gravity_mag, gyro_bias.0, gyro_bias.1, gyro_bias.2, self.accel_count
            );
        } else {
            warn!(
                "[CALIB] only {} accel samples in the window, keeping defaults",
                self.accel_count
            );
        }
        Calibration {
            gravity_mag,
            gyro_bias,
            accel_samples: self.accel_count,
            gyro_samples: self.gyro_count,
            complete,
        }
    }
}

/// GPS-based stationarity: speed under 0.1 m/s and total movement under
/// max(5 m, 1.5·accuracy) since the anchor fix. Any violation re-anchors.
pub struct StationaryTracker {
    dwell_secs: f64,
    speed_limit: f64,
    anchor: Option<GpsFix>,
    stationary_since: Option<f64>,
}

impl StationaryTracker {
    pub fn new(config: &EngineConfig) -> Self {
        StationaryTracker {
            dwell_secs: config.recalib_dwell_secs,
            speed_limit: config.stationary_gps_speed,
            anchor: None,
            stationary_since: None,
        }
    }

    pub fn feed_gps(&mut self, fix: &GpsFix) {
        if fix.speed >= self.speed_limit {
            self.anchor = None;
            self.stationary_since = None;
            return;
        }
        match &self.anchor {
            None => {
                self.anchor = Some(fix.clone());
                self.stationary_since = Some(fix.timestamp);
            }
            Some(anchor) => {
                let moved = haversine_distance(
                    anchor.latitude,
                    anchor.longitude,
                    fix.latitude,
                    fix.longitude,
                );
                let allowed = (1.5 * fix.accuracy).max(5.0);
                if moved > allowed {
                    self.anchor = Some(fix.clone());
                    self.stationary_since = Some(fix.timestamp);
                }
            }
        }
    }

    pub fn stationary_for_dwell(&self, now: f64) -> bool {
        self.stationary_since
            .map(|since| now - since >= self.dwell_secs)
            .unwrap_or(false)
    }

    pub fn stationary_secs(&self, now: f64) -> f64 {
        self.stationary_since.map(|s| (now - s).max(0.0)).unwrap_or(0.0)
    }
}

/// Bound on the recalibration accumulators; one refinement never needs more.
const RECAL_MAX_SAMPLES: usize = 2048;

/// Re-estimates gravity magnitude and gyro bias during long stationary
/// periods and adopts them atomically when they moved past the thresholds.
pub struct DynamicRecalibrator {
    min_samples: usize,
    gravity_delta: f64,
    bias_delta: f64,
    accel_mag_sum: f64,
    accel_count: usize,
    gyro_sum: (f64, f64, f64),
    gyro_count: usize,
    pub refinements: u64,
}

impl DynamicRecalibrator {
    pub fn new(config: &EngineConfig) -> Self {
        DynamicRecalibrator {
            min_samples: config.calib_min_samples,
            gravity_delta: config.recalib_gravity_delta,
            bias_delta: config.recalib_bias_delta,
            accel_mag_sum: 0.0,
            accel_count: 0,
            gyro_sum: (0.0, 0.0, 0.0),
            gyro_count: 0,
            refinements: 0,
        }
    }

    pub fn accumulate(&mut self, accel: &AccelSample, gyro: Option<&GyroSample>) {
        if self.accel_count < RECAL_MAX_SAMPLES {
            self.accel_mag_sum += accel.magnitude();
            self.accel_count += 1;
        }
        if let Some(gyro) = gyro {
            if self.gyro_count < RECAL_MAX_SAMPLES {
                self.gyro_sum.0 += gyro.x;
                self.gyro_sum.1 += gyro.y;
                self.gyro_sum.2 += gyro.z;
                self.gyro_count += 1;
            }
        }
    }

    pub fn reset(&mut self) {
        self.accel_mag_sum = 0.0;
        self.accel_count = 0;
        self.gyro_sum = (0.0, 0.0, 0.0);
        self.gyro_count = 0;
    }

    /// Compute fresh estimates and return an updated calibration when either
    /// moved beyond its adoption threshold. Accumulators clear either way.
    pub fn try_refine(&mut self, current: &Calibration) -> Option<Calibration> {
        if self.accel_count < self.min_samples {
            return None;
        }
        let new_gravity = self.accel_mag_sum / self.accel_count as f64;
        let new_bias = if self.gyro_count > 0 {
            let n = self.gyro_count as f64;
            (
                self.gyro_sum.0 / n,
                self.gyro_sum.1 / n,
                self.gyro_sum.2 / n,
            )
        } else {
            current.gyro_bias
        };

        let gravity_moved = (new_gravity - current.gravity_mag).abs() > self.gravity_delta;
        let bias_drift = {
            let d = (
                new_bias.0 - current.gyro_bias.0,
                new_bias.1 - current.gyro_bias.1,
                new_bias.2 - current.gyro_bias.2,
            );
            (d.0 * d.0 + d.1 * d.1 + d.2 * d.2).sqrt()
        };
        let bias_moved = bias_drift > self.bias_delta;

        let accel_count = self.accel_count;
        let gyro_count = self.gyro_count;
        self.reset();

        if !gravity_moved && !bias_moved {
            return None;
        }

        self.refinements += 1;
        info!(
            "[CALIB] refinement #{}: gravity {:.3} m/s², bias drift {:.5} rad/s",
            self.refinements, new_gravity, bias_drift
        );
        Some(Calibration {
            gravity_mag: new_gravity,
            gyro_bias: new_bias,
            accel_samples: accel_count,
            gyro_samples: gyro_count,
            complete: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn accel(t: f64, x: f64, y: f64, z: f64) -> AccelSample {
        AccelSample { timestamp: t, x, y, z }
    }

    fn gyro(t: f64, x: f64, y: f64, z: f64) -> GyroSample {
        GyroSample { timestamp: t, x, y, z }
    }

    fn fix(t: f64, lat: f64, lon: f64, speed: f64, accuracy: f64) -> GpsFix {
        GpsFix {
            timestamp: t,
            latitude: lat,
            longitude: lon,
            altitude: None,
            accuracy,
            speed,
            bearing: None,
        }
    }

    #[test]
    fn initial_calibration_estimates_magnitude_and_bias() {
        let config = EngineConfig::default();
        let mut calib = InitialCalibrator::new(&config);
        for i in 0..200 {
            let t = i as f64 * 0.02;
            // Tilted device: gravity is split across axes but |a| stays g.
            calib.feed_accel(&accel(t, 3.0, 4.0, 8.43, ));
            calib.feed_gyro(&gyro(t, 0.003, -0.002, 0.001));
        }
        assert!(calib.ready(4.0));
        let result = calib.finish();
        assert!(result.complete);
        let expected = (3.0f64 * 3.0 + 4.0 * 4.0 + 8.43 * 8.43).sqrt();
        assert_relative_eq!(result.gravity_mag, expected, epsilon = 1e-9);
        assert_relative_eq!(result.gyro_bias.0, 0.003, epsilon = 1e-12);
        assert_relative_eq!(result.gyro_bias.2, 0.001, epsilon = 1e-12);
    }

    #[test]
    fn sparse_window_is_incomplete_and_defaults() {
        let config = EngineConfig::default();
        let mut calib = InitialCalibrator::new(&config);
        for i in 0..5 {
            calib.feed_accel(&accel(i as f64 * 0.02, 0.0, 0.0, 9.81));
        }
        assert!(!calib.ready(10.0));
        let result = calib.finish();
        assert!(!result.complete);
    }

    #[test]
    fn stationary_tracker_requires_dwell() {
        let config = EngineConfig::default();
        let mut tracker = StationaryTracker::new(&config);
        tracker.feed_gps(&fix(0.0, 32.2, -110.9, 0.0, 4.0));
        assert!(!tracker.stationary_for_dwell(10.0));
        tracker.feed_gps(&fix(31.0, 32.2, -110.9, 0.05, 4.0));
        assert!(tracker.stationary_for_dwell(31.0));
    }

    #[test]
    fn movement_or_speed_resets_dwell() {
        let config = EngineConfig::default();
        let mut tracker = StationaryTracker::new(&config);
        tracker.feed_gps(&fix(0.0, 32.2, -110.9, 0.0, 4.0));

        // Speed violation resets.
        tracker.feed_gps(&fix(10.0, 32.2, -110.9, 5.0, 4.0));
        assert!(!tracker.stationary_for_dwell(45.0));

        // Re-anchor, then drift past max(5 m, 1.5·accuracy) resets again.
        tracker.feed_gps(&fix(20.0, 32.2, -110.9, 0.0, 4.0));
        tracker.feed_gps(&fix(30.0, 32.2006, -110.9, 0.0, 4.0)); // ~66 m north
        assert!(!tracker.stationary_for_dwell(51.0));
        assert!(tracker.stationary_for_dwell(61.0));
    }

    #[test]
    fn recalibration_adopts_only_past_threshold() {
        let config = EngineConfig::default();
        let mut recal = DynamicRecalibrator::new(&config);
        let current = Calibration {
            gravity_mag: 9.80,
            gyro_bias: (0.001, 0.0, 0.0),
            accel_samples: 100,
            gyro_samples: 100,
            complete: true,
        };

        // Small change: below both thresholds, nothing adopted.
        for i in 0..100 {
            recal.accumulate(
                &accel(i as f64, 0.0, 0.0, 9.85),
                Some(&gyro(i as f64, 0.0011, 0.0, 0.0)),
            );
        }
        assert!(recal.try_refine(&current).is_none());

        // Gravity moved by ~0.7 m/s²: adopted.
        for i in 0..100 {
            recal.accumulate(&accel(i as f64, 0.0, 0.0, 10.5), None);
        }
        let updated = recal.try_refine(&current).expect("adoption");
        assert_relative_eq!(updated.gravity_mag, 10.5, epsilon = 1e-9);

        // Bias drift alone also triggers adoption.
        for i in 0..100 {
            recal.accumulate(
                &accel(i as f64, 0.0, 0.0, 9.80),
                Some(&gyro(i as f64, 0.01, 0.0, 0.0)),
            );
        }
        let updated = recal.try_refine(&current).expect("bias adoption");
        assert_relative_eq!(updated.gyro_bias.0, 0.01, epsilon = 1e-9);
        assert_eq!(recal.refinements, 2);
    }
}
