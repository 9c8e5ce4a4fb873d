use crate::filters::ekf::Ekf13State;
use crate::types::{BoundedRing, GpsFix};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Resident set size in MB from `/proc/self/status`; 0.0 where unavailable.
pub fn resident_memory_mb() -> f64 {
    if let Ok(content) = std::fs::read_to_string("/proc/self/status") {
        for line in content.lines() {
            if let Some(rest) = line.strip_prefix("VmRSS:") {
                if let Some(kb) = rest.split_whitespace().next() {
                    if let Ok(kb) = kb.parse::<f64>() {
                        return kb / 1024.0;
                    }
                }
            }
        }
    }
    0.0
}

/// Validation metrics exported with the session and summarised on the
/// dashboard line.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalMetrics {
    pub duration_seconds: f64,
    pub bias_magnitude: f64,
    pub bias_convergence_seconds: Option<f64>,
    pub quat_norm_min: f64,
    pub quat_norm_max: f64,
    pub quat_rate_max: f64,
    pub stationary_gyro_residual: f64,
    pub heading_error_deg_mean: Option<f64>,
    pub ekf_distance_m: f64,
    pub comp_distance_m: f64,
    pub gps_distance_m: f64,
    pub ekf_distance_error_pct: Option<f64>,
    pub comp_distance_error_pct: Option<f64>,
    pub kalman_gain_norm: f64,
    pub covariance_trace: f64,
    pub update_micros_p50: u64,
    pub update_micros_p95: u64,
    pub update_micros_p99: u64,
    pub peak_memory_mb: f64,
    pub dropped_dt: u64,
    pub numerical_resets: u64,
}

/// Bias magnitude that counts as "converged away from zero".
const BIAS_CONVERGED_RADS: f64 = 0.001;

pub struct MetricsCollector {
    started_ts: Option<f64>,
    last_ts: f64,

    bias_magnitude: f64,
    bias_convergence_ts: Option<f64>,

    quat_norm_min: f64,
    quat_norm_max: f64,
    quat_rate_max: f64,
    last_quat: Option<(f64, (f64, f64, f64, f64))>,

    stationary_residual: f64,

    heading_err_sum: f64,
    heading_err_count: u64,

    gps_distance: f64,
    last_fix: Option<GpsFix>,
    ekf_distance: f64,
    comp_distance: f64,

    gain_norm: f64,
    covariance_trace: f64,
    dropped_dt: u64,
    numerical_resets: u64,

    update_micros: BoundedRing<u64>,
    peak_memory_mb: f64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        MetricsCollector {
            started_ts: None,
            last_ts: 0.0,
            bias_magnitude: 0.0,
            bias_convergence_ts: None,
            quat_norm_min: f64::INFINITY,
            quat_norm_max: f64::NEG_INFINITY,
            quat_rate_max: 0.0,
            last_quat: None,
            stationary_residual: 0.0,
            heading_err_sum: 0.0,
            heading_err_count: 0,
            gps_distance: 0.0,
            last_fix: None,
            ekf_distance: 0.0,
            comp_distance: 0.0,
            gain_norm: 0.0,
            covariance_trace: 0.0,
            dropped_dt: 0,
            numerical_resets: 0,
            update_micros: BoundedRing::new(4096),
            peak_memory_mb: 0.0,
        }
    }

    /// Per-sample EKF tap.
    pub fn on_ekf_state(&mut self, timestamp: f64, state: &Ekf13State, gain_norm: f64) {
        self.started_ts.get_or_insert(timestamp);
        self.last_ts = timestamp;

        let (bx, by, bz) = state.gyro_bias;
        self.bias_magnitude = (bx * bx + by * by + bz * bz).sqrt();
        if self.bias_convergence_ts.is_none() && self.bias_magnitude > BIAS_CONVERGED_RADS {
            self.bias_convergence_ts = Some(timestamp);
        }

        self.quat_norm_min = self.quat_norm_min.min(state.quat_norm);
        self.quat_norm_max = self.quat_norm_max.max(state.quat_norm);
        if let Some((prev_ts, prev_q)) = self.last_quat {
            let dt = timestamp - prev_ts;
            if dt > 1e-6 {
                let (w, x, y, z) = state.quaternion;
                let dq = ((w - prev_q.0).powi(2)
                    + (x - prev_q.1).powi(2)
                    + (y - prev_q.2).powi(2)
                    + (z - prev_q.3).powi(2))
                .sqrt();
                self.quat_rate_max = self.quat_rate_max.max(dq / dt);
            }
        }
        self.last_quat = Some((timestamp, state.quaternion));

        self.gain_norm = gain_norm;
        self.covariance_trace = state.covariance_trace;
        self.ekf_distance = state.distance;
        self.dropped_dt = state.dropped_dt;
        self.numerical_resets = state.numerical_resets;
    }

    /// Bias-corrected gyro magnitude observed while stationary.
    pub fn on_stationary_residual(&mut self, residual: f64) {
        self.stationary_residual = residual;
    }

    pub fn on_comp_distance(&mut self, distance: f64) {
        self.comp_distance = distance;
    }

    /// GPS tap: accumulates the haversine reference track, and the heading
    /// error sample when the fix carries a bearing. With bearing absent the
    /// heading metric simply stays inactive.
    pub fn on_gps(&mut self, fix: &GpsFix, ekf_heading_deg: f64) {
        if let Some(prev) = &self.last_fix {
            self.gps_distance += crate::types::haversine_distance(
                prev.latitude,
                prev.longitude,
                fix.latitude,
                fix.longitude,
            );
        }
        if let Some(bearing) = fix.bearing {
            if fix.speed > 2.0 {
                let mut err = (ekf_heading_deg - bearing).abs() % 360.0;
                if err > 180.0 {
                    err = 360.0 - err;
                }
                self.heading_err_sum += err;
                self.heading_err_count += 1;
            }
        }
        self.last_fix = Some(fix.clone());
    }

    pub fn on_update_duration(&mut self, elapsed: Duration) {
        self.update_micros.push(elapsed.as_micros() as u64);
    }

    pub fn on_memory(&mut self, memory_mb: f64) {
        self.peak_memory_mb = self.peak_memory_mb.max(memory_mb);
    }

    pub fn peak_memory_mb(&self) -> f64 {
        self.peak_memory_mb
    }

    pub fn heading_error_deg_mean(&self) -> Option<f64> {
        if self.heading_err_count == 0 {
            None
        } else {
            Some(self.heading_err_sum / self.heading_err_count as f64)
        }
    }

    fn percentile(&self, p: f64) -> u64 {
        let mut sorted: Vec<u64> = self.update_micros.iter().copied().collect();
        if sorted.is_empty() {
            return 0;
        }
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    fn distance_error_pct(&self, filter_distance: f64) -> Option<f64> {
        if self.gps_distance > 1.0 {
            Some(100.0 * (filter_distance - self.gps_distance).abs() / self.gps_distance)
        } else {
            None
        }
    }

    /// One-line summary logged every 30 s.
    pub fn dashboard_line(&self) -> String {
        format!(
            "[METRICS] bias {:.4} rad/s (conv {}) | |q| [{:.6}, {:.6}] | residual {:.4} | \
             dist ekf {:.0}m gps {:.0}m | gain {:.3} | trace {:.1} | upd p95 {}us | mem {:.1}MB",
            self.bias_magnitude,
            self.bias_convergence_ts
                .and_then(|t| self.started_ts.map(|s| format!("{:.0}s", t - s)))
                .unwrap_or_else(|| "-".into()),
            if self.quat_norm_min.is_finite() { self.quat_norm_min } else { 0.0 },
            if self.quat_norm_max.is_finite() { self.quat_norm_max } else { 0.0 },
            self.stationary_residual,
            self.ekf_distance,
            self.gps_distance,
            self.gain_norm,
            self.covariance_trace,
            self.percentile(0.95),
            self.peak_memory_mb,
        )
    }

    pub fn export(&self) -> FinalMetrics {
        FinalMetrics {
            duration_seconds: self
                .started_ts
                .map(|s| (self.last_ts - s).max(0.0))
                .unwrap_or(0.0),
            bias_magnitude: self.bias_magnitude,
            bias_convergence_seconds: self
                .bias_convergence_ts
                .and_then(|t| self.started_ts.map(|s| t - s)),
            quat_norm_min: if self.quat_norm_min.is_finite() {
                self.quat_norm_min
            } else {
                0.0
            },
            quat_norm_max: if self.quat_norm_max.is_finite() {
                self.quat_norm_max
            } else {
                0.0
            },
            quat_rate_max: self.quat_rate_max,
            stationary_gyro_residual: self.stationary_residual,
            heading_error_deg_mean: self.heading_error_deg_mean(),
            ekf_distance_m: self.ekf_distance,
            comp_distance_m: self.comp_distance,
            gps_distance_m: self.gps_distance,
            ekf_distance_error_pct: self.distance_error_pct(self.ekf_distance),
            comp_distance_error_pct: self.distance_error_pct(self.comp_distance),
            kalman_gain_norm: self.gain_norm,
            covariance_trace: self.covariance_trace,
            update_micros_p50: self.percentile(0.50),
            update_micros_p95: self.percentile(0.95),
            update_micros_p99: self.percentile(0.99),
            peak_memory_mb: self.peak_memory_mb,
            dropped_dt: self.dropped_dt,
            numerical_resets: self.numerical_resets,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
