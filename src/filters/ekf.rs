//! 13-state extended Kalman filter.
//!
//! State vector layout:
//! [0-3]:   quaternion (w, x, y, z), device frame → local ENU
//! [4-6]:   gyroscope bias [rad/s]
//! [7-9]:   velocity in ENU [m/s]
//! [10-12]: position in ENU [m], origin at the first GPS fix

use crate::calibration::Calibration;
use crate::config::EngineConfig;
use crate::filters::{AdvanceContext, FilterKind, FilterOutput, MotionFilter};
use crate::types::{haversine_distance, latlon_to_enu, GpsFix, Sample};
use log::{error, warn};
use nalgebra::DMatrix;
use ndarray::{arr1, Array1, Array2};
use serde::{Deserialize, Serialize};

const STATE_DIM: usize = 13;

/// Quaternion drift past this before renormalisation indicates numerical
/// trouble upstream and is logged.
const QUAT_DRIFT_WARN: f64 = 1e-2;

/// Extra variance on the stationary gyro-bias update beyond sensor noise:
/// "stationary" is a judgment, not a guarantee [rad²/s²].
const GYRO_STATIONARY_SLACK_VAR: f64 = 1e-4;

/// Escalating regularisers applied when the covariance loses positive
/// definiteness.
const PSD_REGULARISERS: [f64; 3] = [1e-9, 1e-6, 1e-3];

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Ekf13State {
    pub quaternion: (f64, f64, f64, f64),
    pub gyro_bias: (f64, f64, f64),
    pub velocity: (f64, f64, f64),
    pub position: (f64, f64, f64),
    pub quat_norm: f64,
    pub heading_deg: f64,
    pub uncertainty_m: f64,
    pub covariance_trace: f64,
    pub covariance_diag: [f64; 8],
    pub distance: f64,
    pub gps_updates: u64,
    pub accel_updates: u64,
    pub gyro_updates: u64,
    pub predicts: u64,
    pub dropped_dt: u64,
    pub numerical_resets: u64,
}

pub struct Ekf13 {
    state: Array1<f64>,
    covariance: Array2<f64>,

    // Process noise densities, scaled by Δt at prediction time.
    q_quat: f64,
    q_bias: f64,
    q_vel: f64,
    q_pos: f64,

    r_accel_var: f64,
    r_gyro_var: f64,
    gps_fallback_var: f64,
    gps_vel_var: f64,
    accel_gate: f64,
    max_dt: f64,

    gravity_mag: f64,
    origin: Option<(f64, f64)>,
    last_fix: Option<(f64, f64)>,
    last_predict_ts: Option<f64>,
    accumulated_distance: f64,
    /// When gyro fusion is on, only gyro samples advance the prediction;
    /// letting accel samples predict with ω = 0 would halve every rotation.
    gyro_drives_prediction: bool,
    heading_initialized: bool,

    // Last state/covariance known finite, for NaN/Inf recovery.
    last_good: Option<(Array1<f64>, Array2<f64>)>,

    last_gain_norm: f64,
    last_output_ts: f64,

    gps_updates: u64,
    accel_updates: u64,
    gyro_updates: u64,
    predicts: u64,
    dropped_dt: u64,
    numerical_resets: u64,
    quat_warnings: u64,
}

impl Ekf13 {
    pub fn new(config: &EngineConfig) -> Self {
        let mut state = Array1::<f64>::zeros(STATE_DIM);
        state[0] = 1.0; // identity attitude

        let mut covariance = Array2::<f64>::zeros((STATE_DIM, STATE_DIM));
        let diag = [
            0.01, 0.01, 0.01, 0.01, // quaternion
            0.01, 0.01, 0.01, // gyro bias
            10.0, 10.0, 10.0, // velocity
            100.0, 100.0, 100.0, // position
        ];
        for (i, v) in diag.iter().enumerate() {
            covariance[[i, i]] = *v;
        }

        Ekf13 {
            state,
            covariance,
            q_quat: config.q_quat,
            q_bias: config.q_bias,
            q_vel: config.q_vel,
            q_pos: config.q_pos,
            r_accel_var: config.accel_noise_std * config.accel_noise_std,
            r_gyro_var: config.gyro_noise_std * config.gyro_noise_std + GYRO_STATIONARY_SLACK_VAR,
            gps_fallback_var: config.gps_noise_std * config.gps_noise_std,
            gps_vel_var: config.gps_vel_std * config.gps_vel_std,
            accel_gate: config.accel_gate_mps2,
            max_dt: config.max_dt_secs,
            gravity_mag: crate::types::STANDARD_GRAVITY,
            origin: None,
            last_fix: None,
            last_predict_ts: None,
            accumulated_distance: 0.0,
            gyro_drives_prediction: config.enable_gyro,
            heading_initialized: false,
            last_good: None,
            last_gain_norm: 0.0,
            last_output_ts: 0.0,
            gps_updates: 0,
            accel_updates: 0,
            gyro_updates: 0,
            predicts: 0,
            dropped_dt: 0,
            numerical_resets: 0,
            quat_warnings: 0,
        }
    }

    /// Seed gravity magnitude and the initial bias estimate from calibration.
    pub fn set_calibration(&mut self, calib: &Calibration) {
        self.gravity_mag = calib.gravity_mag;
        self.state[4] = calib.gyro_bias.0;
        self.state[5] = calib.gyro_bias.1;
        self.state[6] = calib.gyro_bias.2;
    }

    pub fn gravity_mag(&self) -> f64 {
        self.gravity_mag
    }

    pub fn set_gravity_mag(&mut self, gravity_mag: f64) {
        self.gravity_mag = gravity_mag;
    }

    pub fn is_origin_set(&self) -> bool {
        self.origin.is_some()
    }

    pub fn bias(&self) -> (f64, f64, f64) {
        (self.state[4], self.state[5], self.state[6])
    }

    pub fn last_gain_norm(&self) -> f64 {
        self.last_gain_norm
    }

    pub fn dropped_dt(&self) -> u64 {
        self.dropped_dt
    }

    pub fn numerical_resets(&self) -> u64 {
        self.numerical_resets
    }

    /// Prediction: bias-corrected quaternion integration, constant velocity,
    /// GPS-driven position. Rejects non-positive or oversized Δt.
    pub fn predict(&mut self, timestamp: f64, omega: (f64, f64, f64)) {
        let dt = match self.last_predict_ts {
            None => {
                self.last_predict_ts = Some(timestamp);
                return;
            }
            Some(prev) => timestamp - prev,
        };
        if dt <= 0.0 || dt > self.max_dt {
            self.dropped_dt += 1;
            // A stale clock still needs to move forward or every later
            // sample would be rejected against the old reference.
            if dt > 0.0 {
                self.last_predict_ts = Some(timestamp);
            }
            return;
        }
        self.last_predict_ts = Some(timestamp);

        let (w, x, y, z) = (self.state[0], self.state[1], self.state[2], self.state[3]);
        let wx = omega.0 - self.state[4];
        let wy = omega.1 - self.state[5];
        let wz = omega.2 - self.state[6];

        // q' = q + ½·(q ⊗ [0, ω_corr])·Δt
        let half_dt = 0.5 * dt;
        let qw = w - half_dt * (x * wx + y * wy + z * wz);
        let qx = x + half_dt * (w * wx + y * wz - z * wy);
        let qy = y + half_dt * (w * wy - x * wz + z * wx);
        let qz = z + half_dt * (w * wz + x * wy - y * wx);

        let norm = (qw * qw + qx * qx + qy * qy + qz * qz).sqrt();
        if (norm - 1.0).abs() > QUAT_DRIFT_WARN {
            self.quat_warnings += 1;
            warn!(
                "[EKF] quaternion norm drifted to {norm:.4} before renormalisation ({} so far)",
                self.quat_warnings
            );
        }
        if norm > 1e-9 {
            self.state[0] = qw / norm;
            self.state[1] = qx / norm;
            self.state[2] = qy / norm;
            self.state[3] = qz / norm;
        }

        // Bias and velocity are random walks; position integrates velocity.
        self.state[10] += self.state[7] * dt;
        self.state[11] += self.state[8] * dt;
        self.state[12] += self.state[9] * dt;

        // P' = F P Fᵀ + Q·Δt with F = I plus the position-velocity coupling.
        let mut f = Array2::<f64>::eye(STATE_DIM);
        f[[10, 7]] = dt;
        f[[11, 8]] = dt;
        f[[12, 9]] = dt;
        self.covariance = f.dot(&self.covariance).dot(&f.t());
        for i in 0..4 {
            self.covariance[[i, i]] += self.q_quat * dt;
        }
        for i in 4..7 {
            self.covariance[[i, i]] += self.q_bias * dt;
        }
        for i in 7..10 {
            self.covariance[[i, i]] += self.q_vel * dt;
        }
        for i in 10..13 {
            self.covariance[[i, i]] += self.q_pos * dt;
        }

        self.predicts += 1;
        self.guard_numerics("predict");
    }

    /// GPS position (and velocity, when bearing is present) update. The first
    /// fix anchors the ENU origin instead of correcting anything.
    pub fn update_gps(&mut self, fix: &GpsFix) {
        let (origin_lat, origin_lon) = match self.origin {
            Some(origin) => origin,
            None => {
                self.origin = Some((fix.latitude, fix.longitude));
                self.last_fix = Some((fix.latitude, fix.longitude));
                self.state[10] = 0.0;
                self.state[11] = 0.0;
                self.state[12] = 0.0;
                self.gps_updates += 1;
                return;
            }
        };

        let (east, north) = latlon_to_enu(fix.latitude, fix.longitude, origin_lat, origin_lon);
        let residual = arr1(&[east - self.state[10], north - self.state[11]]);
        let mut h = Array2::<f64>::zeros((2, STATE_DIM));
        h[[0, 10]] = 1.0;
        h[[1, 11]] = 1.0;
        // Zero or missing accuracy falls back to the configured GPS noise.
        let acc_var = if fix.accuracy > 0.0 {
            fix.accuracy * fix.accuracy
        } else {
            self.gps_fallback_var
        };
        let mut r = Array2::<f64>::zeros((2, 2));
        r[[0, 0]] = acc_var;
        r[[1, 1]] = acc_var;
        self.kalman_update(&residual, &h, &r);

        // Yaw is unobservable from gravity alone; the first confidently
        // moving fix with a bearing aligns the quaternion to the track.
        if let Some(bearing) = fix.bearing {
            if !self.heading_initialized && fix.speed > 3.0 {
                let yaw = (90.0 - bearing).to_radians();
                let half = yaw * 0.5;
                self.state[0] = half.cos();
                self.state[1] = 0.0;
                self.state[2] = 0.0;
                self.state[3] = half.sin();
                self.heading_initialized = true;
            }
        }

        // Speed + bearing observe velocity directly, with looser noise than
        // the position channel.
        if let Some(bearing) = fix.bearing {
            let bearing_rad = bearing.to_radians();
            let v_east = fix.speed * bearing_rad.sin();
            let v_north = fix.speed * bearing_rad.cos();
            let residual = arr1(&[v_east - self.state[7], v_north - self.state[8]]);
            let mut h = Array2::<f64>::zeros((2, STATE_DIM));
            h[[0, 7]] = 1.0;
            h[[1, 8]] = 1.0;
            let mut r = Array2::<f64>::zeros((2, 2));
            r[[0, 0]] = self.gps_vel_var;
            r[[1, 1]] = self.gps_vel_var;
            self.kalman_update(&residual, &h, &r);
        }

        if let Some((lat_prev, lon_prev)) = self.last_fix {
            self.accumulated_distance +=
                haversine_distance(lat_prev, lon_prev, fix.latitude, fix.longitude);
        }
        self.last_fix = Some((fix.latitude, fix.longitude));
        self.gps_updates += 1;
    }

    /// Gravity-direction attitude update. Gated on the magnitude residual so
    /// transient accelerations (braking, bumps) cannot poison the quaternion.
    /// Returns whether the measurement passed the gate.
    pub fn update_accel(&mut self, accel: (f64, f64, f64)) -> bool {
        let mag = (accel.0 * accel.0 + accel.1 * accel.1 + accel.2 * accel.2).sqrt();
        if (mag - self.gravity_mag).abs() > self.accel_gate {
            return false;
        }

        let g = self.gravity_mag;
        let (w, x, y, z) = (self.state[0], self.state[1], self.state[2], self.state[3]);

        // Predicted body-frame gravity: ẑ = R(q)ᵀ · (0, 0, g).
        let zhat = [
            2.0 * g * (x * z - w * y),
            2.0 * g * (y * z + w * x),
            g * (1.0 - 2.0 * (x * x + y * y)),
        ];
        let residual = arr1(&[accel.0 - zhat[0], accel.1 - zhat[1], accel.2 - zhat[2]]);

        let mut h = Array2::<f64>::zeros((3, STATE_DIM));
        h[[0, 0]] = -2.0 * g * y;
        h[[0, 1]] = 2.0 * g * z;
        h[[0, 2]] = -2.0 * g * w;
        h[[0, 3]] = 2.0 * g * x;
        h[[1, 0]] = 2.0 * g * x;
        h[[1, 1]] = 2.0 * g * w;
        h[[1, 2]] = 2.0 * g * z;
        h[[1, 3]] = 2.0 * g * y;
        h[[2, 1]] = -4.0 * g * x;
        h[[2, 2]] = -4.0 * g * y;

        let mut r = Array2::<f64>::zeros((3, 3));
        for i in 0..3 {
            r[[i, i]] = self.r_accel_var.max(1e-4);
        }
        self.kalman_update(&residual, &h, &r);
        self.normalize_quat();
        self.accel_updates += 1;
        true
    }

    /// Stationary gyro update: with ω_true ≈ 0 the measurement observes the
    /// bias directly (z = ω, ẑ = b). The caller supplies the stationarity
    /// gate (low accel variance AND low GPS speed).
    pub fn update_gyro(&mut self, omega: (f64, f64, f64), stationary: bool) -> bool {
        if !stationary {
            return false;
        }
        let residual = arr1(&[
            omega.0 - self.state[4],
            omega.1 - self.state[5],
            omega.2 - self.state[6],
        ]);
        let mut h = Array2::<f64>::zeros((3, STATE_DIM));
        h[[0, 4]] = 1.0;
        h[[1, 5]] = 1.0;
        h[[2, 6]] = 1.0;
        let mut r = Array2::<f64>::zeros((3, 3));
        for i in 0..3 {
            r[[i, i]] = self.r_gyro_var;
        }
        self.kalman_update(&residual, &h, &r);
        self.gyro_updates += 1;
        true
    }

    /// Joseph-form measurement update shared by every observation:
    /// `P' = (I − KH) P (I − KH)ᵀ + K R Kᵀ`, then re-symmetrise and restore
    /// positive definiteness if Cholesky fails.
    fn kalman_update(&mut self, residual: &Array1<f64>, h: &Array2<f64>, r: &Array2<f64>) {
        let m = residual.len();
        let ph_t = self.covariance.dot(&h.t());
        let s = h.dot(&ph_t) + r;

        let s_na = DMatrix::from_row_slice(m, m, s.as_slice().expect("innovation slice"));
        let Some(s_inv_na) = s_na.try_inverse() else {
            warn!("[EKF] singular innovation covariance, skipping update");
            return;
        };
        let mut s_inv = Array2::<f64>::zeros((m, m));
        for i in 0..m {
            for j in 0..m {
                s_inv[[i, j]] = s_inv_na[(i, j)];
            }
        }

        let k = ph_t.dot(&s_inv);
        self.last_gain_norm = k.iter().map(|v| v * v).sum::<f64>().sqrt();

        let dx = k.dot(residual);
        for i in 0..STATE_DIM {
            self.state[i] += dx[i];
        }

        let kh = k.dot(h);
        let mut i_kh = Array2::<f64>::eye(STATE_DIM);
        i_kh -= &kh;
        let joseph = i_kh.dot(&self.covariance).dot(&i_kh.t()) + k.dot(r).dot(&k.t());

        // Re-symmetrise: P ← ½(P + Pᵀ).
        let mut p = Array2::<f64>::zeros((STATE_DIM, STATE_DIM));
        for i in 0..STATE_DIM {
            for j in 0..STATE_DIM {
                p[[i, j]] = 0.5 * (joseph[[i, j]] + joseph[[j, i]]);
            }
        }
        self.covariance = p;
        self.enforce_psd();
        self.guard_numerics("update");
    }

    fn enforce_psd(&mut self) {
        for epsilon in PSD_REGULARISERS {
            let p_na = DMatrix::from_row_slice(
                STATE_DIM,
                STATE_DIM,
                self.covariance.as_slice().expect("covariance slice"),
            );
            if p_na.cholesky().is_some() {
                return;
            }
            for i in 0..STATE_DIM {
                self.covariance[[i, i]] += epsilon;
            }
        }
    }

    /// NaN/Inf anywhere in S or P rolls the component back to its last good
    /// snapshot; the session continues.
    fn guard_numerics(&mut self, stage: &str) {
        let finite = self.state.iter().all(|v| v.is_finite())
            && self.covariance.iter().all(|v| v.is_finite());
        if finite {
            self.last_good = Some((self.state.clone(), self.covariance.clone()));
            return;
        }
        self.numerical_resets += 1;
        error!(
            "[EKF] non-finite value after {stage}, restoring last good state (reset #{})",
            self.numerical_resets
        );
        if let Some((state, covariance)) = &self.last_good {
            self.state = state.clone();
            self.covariance = covariance.clone();
        } else {
            let fresh = Ekf13::new(&EngineConfig::default());
            self.state = fresh.state;
            self.covariance = fresh.covariance;
        }
    }

    fn normalize_quat(&mut self) {
        let norm = (self.state[0] * self.state[0]
            + self.state[1] * self.state[1]
            + self.state[2] * self.state[2]
            + self.state[3] * self.state[3])
            .sqrt();
        if norm > 1e-9 {
            for i in 0..4 {
                self.state[i] /= norm;
            }
        }
    }

    pub fn quat_norm(&self) -> f64 {
        (self.state[0] * self.state[0]
            + self.state[1] * self.state[1]
            + self.state[2] * self.state[2]
            + self.state[3] * self.state[3])
            .sqrt()
    }

    /// Roll, pitch, yaw [rad]. The pitch asin argument is clamped to [−1, 1];
    /// without the clamp a quaternion a hair outside unit norm panics here.
    pub fn euler_angles(&self) -> (f64, f64, f64) {
        let (w, x, y, z) = (self.state[0], self.state[1], self.state[2], self.state[3]);
        let roll = (2.0 * (w * x + y * z)).atan2(1.0 - 2.0 * (x * x + y * y));
        let pitch = (2.0 * (w * y - z * x)).clamp(-1.0, 1.0).asin();
        let yaw = (2.0 * (w * z + x * y)).atan2(1.0 - 2.0 * (y * y + z * z));
        (roll, pitch, yaw)
    }

    /// Compass heading [deg, 0..360): derived from quaternion yaw in ENU.
    pub fn heading_deg(&self) -> f64 {
        let (_, _, yaw) = self.euler_angles();
        (90.0 - yaw.to_degrees()).rem_euclid(360.0)
    }

    pub fn speed(&self) -> f64 {
        (self.state[7] * self.state[7] + self.state[8] * self.state[8]).sqrt()
    }

    pub fn covariance_trace(&self) -> f64 {
        (0..STATE_DIM).map(|i| self.covariance[[i, i]]).sum()
    }

    /// Leading diagonal of P (quaternion + bias + first velocity component),
    /// the slice persisted in covariance snapshots.
    pub fn covariance_diag8(&self) -> [f64; 8] {
        let mut diag = [0.0; 8];
        for (i, slot) in diag.iter_mut().enumerate() {
            *slot = self.covariance[[i, i]];
        }
        diag
    }

    pub fn position_uncertainty_m(&self) -> f64 {
        ((self.covariance[[10, 10]] + self.covariance[[11, 11]]) / 2.0)
            .max(0.0)
            .sqrt()
    }

    pub fn snapshot(&self) -> Ekf13State {
        Ekf13State {
            quaternion: (self.state[0], self.state[1], self.state[2], self.state[3]),
            gyro_bias: (self.state[4], self.state[5], self.state[6]),
            velocity: (self.state[7], self.state[8], self.state[9]),
            position: (self.state[10], self.state[11], self.state[12]),
            quat_norm: self.quat_norm(),
            heading_deg: self.heading_deg(),
            uncertainty_m: self.position_uncertainty_m(),
            covariance_trace: self.covariance_trace(),
            covariance_diag: self.covariance_diag8(),
            distance: self.accumulated_distance,
            gps_updates: self.gps_updates,
            accel_updates: self.accel_updates,
            gyro_updates: self.gyro_updates,
            predicts: self.predicts,
            dropped_dt: self.dropped_dt,
            numerical_resets: self.numerical_resets,
        }
    }

    #[cfg(test)]
    pub(crate) fn covariance(&self) -> &Array2<f64> {
        &self.covariance
    }

    #[cfg(test)]
    pub(crate) fn inject_state(&mut self, index: usize, value: f64) {
        self.state[index] = value;
    }
}

impl MotionFilter for Ekf13 {
    fn kind(&self) -> FilterKind {
        FilterKind::Ekf
    }

    fn advance(&mut self, sample: &Sample, ctx: &AdvanceContext) {
        match sample {
            Sample::Accel(a) => {
                if !self.gyro_drives_prediction {
                    self.predict(a.timestamp, (0.0, 0.0, 0.0));
                }
                self.update_accel((a.x, a.y, a.z));
                self.last_output_ts = a.timestamp;
            }
            Sample::Gyro(g) => {
                self.predict(g.timestamp, (g.x, g.y, g.z));
                let gps_still = ctx.gps_speed.map(|s| s < 0.5).unwrap_or(true);
                self.update_gyro((g.x, g.y, g.z), ctx.stationary && gps_still);
                self.last_output_ts = g.timestamp;
            }
            Sample::Gps(fix) => {
                self.update_gps(fix);
                self.last_output_ts = fix.timestamp;
            }
        }
    }

    fn output(&self) -> FilterOutput {
        FilterOutput {
            timestamp: self.last_output_ts,
            x: self.state[10],
            y: self.state[11],
            velocity: self.speed(),
            heading_deg: self.heading_deg(),
            uncertainty_m: self.position_uncertainty_m(),
            distance: self.accumulated_distance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn config() -> EngineConfig {
        EngineConfig::default()
    }

    fn calibrated_filter(bias: (f64, f64, f64)) -> Ekf13 {
        let mut ekf = Ekf13::new(&config());
        ekf.set_calibration(&Calibration {
            gravity_mag: 9.81,
            gyro_bias: bias,
            accel_samples: 150,
            gyro_samples: 150,
            complete: true,
        });
        ekf
    }

    fn gps(t: f64, lat: f64, lon: f64, speed: f64, bearing: Option<f64>) -> GpsFix {
        GpsFix {
            timestamp: t,
            latitude: lat,
            longitude: lon,
            altitude: None,
            accuracy: 5.0,
            speed,
            bearing,
        }
    }

    fn assert_covariance_well_formed(ekf: &Ekf13) {
        let p = ekf.covariance();
        let mut asym = 0.0;
        for i in 0..STATE_DIM {
            assert!(p[[i, i]] >= 0.0, "negative variance at {i}");
            for j in 0..STATE_DIM {
                asym += (p[[i, j]] - p[[j, i]]).powi(2);
            }
        }
        assert!(asym.sqrt() < 1e-9, "covariance asymmetry {}", asym.sqrt());
    }

    #[test]
    fn quaternion_stays_unit_through_integration() {
        let mut ekf = calibrated_filter((0.0, 0.0, 0.0));
        let mut t = 0.0;
        for i in 0..5000 {
            t += 0.02;
            let w = 0.3 * ((i as f64) * 0.01).sin();
            ekf.predict(t, (w, -w * 0.5, 0.2));
            assert!((ekf.quat_norm() - 1.0).abs() < 1e-3);
        }
        assert!((ekf.quat_norm() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn dt_guards_skip_and_count() {
        let mut ekf = calibrated_filter((0.0, 0.0, 0.0));
        ekf.predict(10.0, (0.0, 0.0, 0.0));
        let before = ekf.snapshot().predicts;

        ekf.predict(10.0, (0.0, 0.0, 0.0)); // Δt = 0
        ekf.predict(9.0, (0.0, 0.0, 0.0)); // Δt < 0
        ekf.predict(10.5, (0.0, 0.0, 0.0)); // Δt > 0.1
        assert_eq!(ekf.snapshot().predicts, before);
        assert_eq!(ekf.dropped_dt(), 3);

        // The reference advanced past the gap, so normal cadence resumes.
        ekf.predict(10.52, (0.0, 0.0, 0.0));
        assert_eq!(ekf.snapshot().predicts, before + 1);
    }

    #[test]
    fn stationary_bias_convergence() {
        let true_bias = (0.003, -0.002, 0.001);
        let mut ekf = calibrated_filter((0.0, 0.0, 0.0));
        let mut t = 0.0;
        for _ in 0..1500 {
            // 30 s at 50 Hz
            t += 0.02;
            ekf.predict(t, true_bias);
            ekf.update_gyro(true_bias, true);
            ekf.update_accel((0.0, 0.0, 9.81));
        }

        let snap = ekf.snapshot();
        let bias_mag = (snap.gyro_bias.0.powi(2)
            + snap.gyro_bias.1.powi(2)
            + snap.gyro_bias.2.powi(2))
        .sqrt();
        assert!(
            (0.0025..=0.005).contains(&bias_mag),
            "bias magnitude {bias_mag}"
        );

        // Bias-corrected stationary residual under 0.01 rad/s.
        let residual = ((true_bias.0 - snap.gyro_bias.0).powi(2)
            + (true_bias.1 - snap.gyro_bias.1).powi(2)
            + (true_bias.2 - snap.gyro_bias.2).powi(2))
        .sqrt();
        assert!(residual < 0.01, "residual {residual}");

        assert!((snap.quat_norm - 1.0).abs() < 1e-6);
        // Bias variance settled well under the convergence target.
        let diag = ekf.covariance_diag8();
        for v in &diag[4..7] {
            assert!(v.sqrt() < 0.005, "bias sigma {}", v.sqrt());
        }
        assert_covariance_well_formed(&ekf);
    }

    #[test]
    fn first_fix_sets_origin_without_correction() {
        let mut ekf = calibrated_filter((0.0, 0.0, 0.0));
        ekf.update_gps(&gps(1.0, 32.2, -110.9, 0.0, None));
        assert!(ekf.is_origin_set());
        let snap = ekf.snapshot();
        assert_eq!(snap.position, (0.0, 0.0, 0.0));
        assert_eq!(snap.gps_updates, 1);
    }

    #[test]
    fn straight_drive_tracks_position_velocity_heading() {
        let mut ekf = calibrated_filter((0.0, 0.0, 0.0));
        let (lat0, lon0): (f64, f64) = (32.2, -110.9);
        let speed = 20.0;
        let mut t = 0.0;
        let mut gps_distance = 0.0;
        let mut prev = (lat0, lon0);

        for second in 0..120 {
            for _ in 0..50 {
                t += 0.02;
                ekf.predict(t, (0.0, 0.0, 0.0));
            }
            // Due-east track: longitude advances by v·Δt.
            let east = speed * (second + 1) as f64;
            let lon = lon0
                + (east / (crate::types::EARTH_RADIUS_M * lat0.to_radians().cos())).to_degrees();
            let fix = gps(t, lat0, lon, speed, Some(90.0));
            gps_distance += haversine_distance(prev.0, prev.1, fix.latitude, fix.longitude);
            prev = (fix.latitude, fix.longitude);
            ekf.update_gps(&fix);
        }

        let snap = ekf.snapshot();
        let expected_east = speed * 120.0;
        assert!(
            (snap.position.0 - expected_east).abs() / expected_east < 0.05,
            "east {} vs {}",
            snap.position.0,
            expected_east
        );
        assert!((ekf.speed() - speed).abs() < 1.0, "speed {}", ekf.speed());
        // Bearing present: heading aligned to the eastbound track.
        let heading_err = (snap.heading_deg - 90.0).abs();
        assert!(heading_err.min(360.0 - heading_err) < 15.0, "heading {}", snap.heading_deg);
        // Distance accumulates along the GPS track.
        assert!(
            (snap.distance - gps_distance).abs() / gps_distance < 0.05,
            "distance {} vs {}",
            snap.distance,
            gps_distance
        );
        assert_covariance_well_formed(&ekf);
    }

    #[test]
    fn accel_gate_rejects_transient_motion() {
        let mut ekf = calibrated_filter((0.0, 0.0, 0.0));
        assert!(ekf.update_accel((0.0, 0.0, 9.81)));
        // 2 g burst: far outside the gate, quaternion untouched.
        assert!(!ekf.update_accel((0.0, 12.0, 15.0)));
        assert!((ekf.quat_norm() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn tilt_is_recovered_from_gravity_direction() {
        let mut ekf = calibrated_filter((0.0, 0.0, 0.0));
        // Device pitched: gravity reads partly along x in the device frame.
        let pitch = 0.1_f64;
        let ax = -9.81 * pitch.sin();
        let az = 9.81 * pitch.cos();
        let mut t = 0.0;
        for _ in 0..500 {
            t += 0.02;
            ekf.predict(t, (0.0, 0.0, 0.0));
            ekf.update_accel((ax, 0.0, az));
        }
        let (_, est_pitch, _) = ekf.euler_angles();
        assert_relative_eq!(est_pitch.abs(), pitch, epsilon = 0.02);
        assert!((ekf.quat_norm() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn nan_rolls_back_to_last_good_state() {
        let mut ekf = calibrated_filter((0.0, 0.0, 0.0));
        ekf.predict(1.0, (0.0, 0.0, 0.0));
        ekf.predict(1.02, (0.0, 0.0, 0.0));
        let good = ekf.snapshot();

        ekf.inject_state(7, f64::NAN);
        ekf.predict(1.04, (0.0, 0.0, 0.0));

        let snap = ekf.snapshot();
        assert_eq!(snap.numerical_resets, 1);
        assert!(snap.velocity.0.is_finite());
        assert_relative_eq!(snap.position.0, good.position.0, epsilon = 1e-9);
    }

    #[test]
    fn pitch_extraction_never_panics_at_singularity() {
        let mut ekf = calibrated_filter((0.0, 0.0, 0.0));
        // Gimbal-lock attitude: pitch exactly ±90°, asin argument at ±1.
        let half = (std::f64::consts::FRAC_PI_2 / 2.0).sin();
        ekf.inject_state(0, (std::f64::consts::FRAC_PI_2 / 2.0).cos());
        ekf.inject_state(1, 0.0);
        ekf.inject_state(2, half * 1.0000001);
        ekf.inject_state(3, 0.0);
        let (_, pitch, _) = ekf.euler_angles();
        assert!(pitch.is_finite());
        assert_relative_eq!(pitch, std::f64::consts::FRAC_PI_2, epsilon = 1e-3);
    }

    #[test]
    fn gain_norm_and_trace_are_tracked() {
        let mut ekf = calibrated_filter((0.0, 0.0, 0.0));
        ekf.update_gps(&gps(1.0, 32.2, -110.9, 0.0, None));
        ekf.update_gps(&gps(2.0, 32.2001, -110.9, 0.0, None));
        assert!(ekf.last_gain_norm() > 0.0);
        assert!(ekf.covariance_trace() > 0.0);
    }
}
