//! GPS + accelerometer blend kept purely as an A/B reference against the
//! EKF. Fixed 70/30 weighting; not adaptive to GPS accuracy.

use crate::filters::{AdvanceContext, FilterKind, FilterOutput, MotionFilter};
use crate::types::{haversine_distance, latlon_to_enu, GpsFix, Sample};

pub struct ComplementaryFilter {
    x: f64,
    y: f64,
    vx: f64,
    vy: f64,
    heading: f64,

    origin: Option<(f64, f64)>,
    last_fix: Option<GpsFix>,
    last_accel_ts: Option<f64>,

    gravity_mag: f64,
    accumulated_distance: f64,
    gps_updates: u64,

    gps_weight: f64,
    accel_weight: f64,
}

impl ComplementaryFilter {
    pub fn new() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            vx: 0.0,
            vy: 0.0,
            heading: 0.0,
            origin: None,
            last_fix: None,
            last_accel_ts: None,
            gravity_mag: crate::types::STANDARD_GRAVITY,
            accumulated_distance: 0.0,
            gps_updates: 0,
            gps_weight: 0.7,
            accel_weight: 0.3,
        }
    }

    pub fn set_gravity_mag(&mut self, gravity_mag: f64) {
        self.gravity_mag = gravity_mag;
    }

    pub fn velocity_magnitude(&self) -> f64 {
        (self.vx * self.vx + self.vy * self.vy).sqrt()
    }

    pub fn distance(&self) -> f64 {
        self.accumulated_distance
    }

    /// Integrate the planar linear-acceleration estimate. Gravity is removed
    /// by magnitude along the instantaneous direction, so a stationary tilted
    /// device contributes ~zero.
    pub fn update_accel(&mut self, timestamp: f64, ax: f64, ay: f64, az: f64) {
        let dt = match self.last_accel_ts {
            None => {
                self.last_accel_ts = Some(timestamp);
                return;
            }
            Some(prev) => timestamp - prev,
        };
        self.last_accel_ts = Some(timestamp);
        if dt <= 0.0 || dt > 0.1 {
            return;
        }

        let mag = (ax * ax + ay * ay + az * az).sqrt();
        let scale = if mag > 1e-6 {
            (mag - self.gravity_mag).max(-mag) / mag
        } else {
            0.0
        };
        let lin_x = ax * scale;
        let lin_y = ay * scale;

        self.vx += lin_x * dt * self.accel_weight;
        self.vy += lin_y * dt * self.accel_weight;
        self.x += self.vx * dt;
        self.y += self.vy * dt;

        let vel_mag = self.velocity_magnitude();
        if vel_mag > 0.1 {
            self.heading = self.vy.atan2(self.vx);
        }
    }

    pub fn update_gps(&mut self, fix: &GpsFix) {
        let (origin_lat, origin_lon) = match self.origin {
            Some(origin) => origin,
            None => {
                self.origin = Some((fix.latitude, fix.longitude));
                self.last_fix = Some(fix.clone());
                self.x = 0.0;
                self.y = 0.0;
                self.gps_updates += 1;
                return;
            }
        };

        let Some(prev) = self.last_fix.clone() else {
            self.last_fix = Some(fix.clone());
            return;
        };

        let (gps_x, gps_y) = latlon_to_enu(fix.latitude, fix.longitude, origin_lat, origin_lon);
        let (prev_x, prev_y) = latlon_to_enu(prev.latitude, prev.longitude, origin_lat, origin_lon);
        let dt = (fix.timestamp - prev.timestamp).max(0.01);

        self.x = self.gps_weight * gps_x + self.accel_weight * self.x;
        self.y = self.gps_weight * gps_y + self.accel_weight * self.y;

        let gps_vx = (gps_x - prev_x) / dt;
        let gps_vy = (gps_y - prev_y) / dt;
        self.vx = self.gps_weight * gps_vx + self.accel_weight * self.vx;
        self.vy = self.gps_weight * gps_vy + self.accel_weight * self.vy;

        let delta_x = gps_x - prev_x;
        let delta_y = gps_y - prev_y;
        if delta_x.hypot(delta_y) > 0.5 {
            let gps_bearing = delta_y.atan2(delta_x);
            self.heading = self.gps_weight * gps_bearing + self.accel_weight * self.heading;
        }

        self.accumulated_distance +=
            haversine_distance(prev.latitude, prev.longitude, fix.latitude, fix.longitude);
        self.last_fix = Some(fix.clone());
        self.gps_updates += 1;
    }

    /// Clamp velocity to zero while parked; releases as soon as motion
    /// resumes through the next updates.
    pub fn apply_zupt(&mut self) {
        self.vx = 0.0;
        self.vy = 0.0;
    }
}

impl Default for ComplementaryFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl MotionFilter for ComplementaryFilter {
    fn kind(&self) -> FilterKind {
        FilterKind::Complementary
    }

    fn advance(&mut self, sample: &Sample, ctx: &AdvanceContext) {
        match sample {
            Sample::Accel(a) => {
                self.update_accel(a.timestamp, a.x, a.y, a.z);
                if ctx.stationary {
                    self.apply_zupt();
                }
            }
            Sample::Gyro(_) => {}
            Sample::Gps(fix) => self.update_gps(fix),
        }
    }

    fn output(&self) -> FilterOutput {
        FilterOutput {
            timestamp: self
                .last_fix
                .as_ref()
                .map(|f| f.timestamp)
                .or(self.last_accel_ts)
                .unwrap_or(0.0),
            x: self.x,
            y: self.y,
            velocity: self.velocity_magnitude(),
            heading_deg: self.heading.to_degrees(),
            uncertainty_m: 0.0,
            distance: self.accumulated_distance,
        }
    }
}
