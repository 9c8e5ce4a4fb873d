//! Pure computation layer: samples in, state estimates and events out.
//!
//! Nothing here touches subprocesses, threads, or the filesystem, so the
//! whole pipeline can be unit-tested with synthetic streams and re-driven
//! from recorded sessions by the replay binary.

use crate::calibration::{
    Calibration, DynamicRecalibrator, InitialCalibrator, StationaryTracker,
};
use crate::config::EngineConfig;
use crate::filters::complementary::ComplementaryFilter;
use crate::filters::ekf::{Ekf13, Ekf13State};
use crate::filters::{AdvanceContext, FilterOutput, MotionFilter};
use crate::incident::{IncidentDetector, IncidentRecord};
use crate::metrics::MetricsCollector;
use crate::types::{AccelSample, GpsFix, GyroSample, Sample};
use log::{info, warn};
use nalgebra::Vector3;
use std::collections::VecDeque;
use std::time::Instant;

/// Side-channel notifications the orchestrator reacts to (persistence,
/// status, incident files). The pipeline itself never does I/O.
#[derive(Clone, Debug)]
pub enum FusionEvent {
    CalibrationComplete {
        gravity_mag: f64,
        gyro_bias: (f64, f64, f64),
    },
    OriginSet {
        lat: f64,
        lon: f64,
    },
    GpsRejected {
        accuracy: f64,
    },
    Recalibrated {
        gravity_mag: f64,
        gyro_bias: (f64, f64, f64),
    },
    IncidentDetected(IncidentRecord),
}

/// Blend weight of a single-pole RC low-pass with the given cutoff at the
/// given sampling rate. Applied to the raw accelerometer in `feed_accel` to
/// tame cup-holder rattle before anything downstream sees the vector.
fn low_pass_alpha(cutoff_hz: f64, sample_rate_hz: f64) -> f64 {
    let dt = 1.0 / sample_rate_hz;
    let rc = 1.0 / (2.0 * std::f64::consts::PI * cutoff_hz);
    dt / (rc + dt)
}

/// Hann-window smoothing for linear-acceleration magnitudes.
struct AccelSmoother {
    window: VecDeque<f64>,
    window_size: usize,
}

impl AccelSmoother {
    fn new(window_size: usize) -> Self {
        AccelSmoother {
            window: VecDeque::with_capacity(window_size),
            window_size: window_size.max(1),
        }
    }

    fn apply(&mut self, magnitude: f64) -> f64 {
        self.window.push_back(magnitude);
        while self.window.len() > self.window_size {
            self.window.pop_front();
        }
        let len = self.window.len();
        if len == 1 {
            return magnitude;
        }
        let mut weights = Vec::with_capacity(len);
        for i in 0..len {
            let angle = (2.0 * std::f64::consts::PI * i as f64) / (len as f64 - 1.0);
            weights.push(0.5 - 0.5 * angle.cos());
        }
        let total: f64 = weights.iter().sum();
        let total = if total > 0.0 { total } else { 1.0 };
        self.window
            .iter()
            .zip(&weights)
            .map(|(v, w)| v * w / total)
            .sum()
    }
}

enum Phase {
    Calibrating(InitialCalibrator),
    Running,
}

#[derive(Clone, Debug)]
pub struct FusionSnapshot {
    pub ekf: Ekf13State,
    pub comp: Option<FilterOutput>,
    pub calibration: Calibration,
    pub calibrating: bool,
    pub stationary: bool,
    pub comp_paused: bool,
    pub accel_samples: u64,
    pub gyro_samples: u64,
    pub gps_fixes: u64,
    pub latest_gps: Option<GpsFix>,
    pub gps_first_fix_latency: Option<f64>,
    pub incidents_emitted: u64,
    /// Smoothed gravity-corrected acceleration magnitude [m/s²].
    pub linear_accel_mps2: f64,
}

pub struct FusionPipeline {
    config: EngineConfig,
    phase: Phase,
    calibration: Calibration,

    ekf: Ekf13,
    comp: Option<ComplementaryFilter>,
    comp_paused: bool,

    lpf_alpha: f64,
    lpf_state: Option<Vector3<f64>>,
    smoother: AccelSmoother,

    stationary_tracker: StationaryTracker,
    recalibrator: DynamicRecalibrator,
    detector: IncidentDetector,
    pub metrics: MetricsCollector,

    last_accel_mag_filtered: f64,
    last_linear_accel: f64,
    last_gyro_mag_corrected: f64,
    last_yaw_rate: f64,
    last_gyro: Option<GyroSample>,
    latest_gps: Option<GpsFix>,
    pending_gps: Option<GpsFix>,

    session_start_ts: Option<f64>,
    gps_first_fix_latency: Option<f64>,

    accel_samples: u64,
    gyro_samples: u64,
    gps_fixes: u64,
}

impl FusionPipeline {
    pub fn new(config: EngineConfig) -> Self {
        let comp = config
            .enable_complementary
            .then(ComplementaryFilter::new);
        FusionPipeline {
            phase: Phase::Calibrating(InitialCalibrator::new(&config)),
            calibration: Calibration::default(),
            ekf: Ekf13::new(&config),
            comp,
            comp_paused: false,
            lpf_alpha: low_pass_alpha(config.accel_lpf_cutoff_hz, config.accel_lpf_sample_hz),
            lpf_state: None,
            smoother: AccelSmoother::new(config.accel_smoother_window),
            stationary_tracker: StationaryTracker::new(&config),
            recalibrator: DynamicRecalibrator::new(&config),
            detector: IncidentDetector::new(&config),
            metrics: MetricsCollector::new(),
            last_accel_mag_filtered: 0.0,
            last_linear_accel: 0.0,
            last_gyro_mag_corrected: 0.0,
            last_yaw_rate: 0.0,
            last_gyro: None,
            latest_gps: None,
            pending_gps: None,
            session_start_ts: None,
            gps_first_fix_latency: None,
            accel_samples: 0,
            gyro_samples: 0,
            gps_fixes: 0,
            config,
        }
    }

    /// Feed one sample through calibration, filters, incident detection, and
    /// metrics. Returns the events this sample produced.
    pub fn handle(&mut self, sample: &Sample) -> Vec<FusionEvent> {
        self.session_start_ts.get_or_insert(sample.timestamp());
        let mut events = Vec::new();

        match sample {
            Sample::Accel(a) => self.feed_accel(a, &mut events),
            Sample::Gyro(g) => self.feed_gyro(g, &mut events),
            Sample::Gps(fix) => self.feed_gps(fix, &mut events),
        }

        for record in self.detector.collect_matured(sample.timestamp(), false) {
            events.push(FusionEvent::IncidentDetected(record));
        }
        events
    }

    /// Emit every incident still waiting on its post-window; session stop.
    pub fn flush_incidents(&mut self, now: f64) -> Vec<IncidentRecord> {
        self.detector.collect_matured(now, true)
    }

    /// Device judged stationary from the inertial stream alone: filtered
    /// accel magnitude inside the gravity band and quiet (bias-corrected)
    /// gyro.
    pub fn is_stationary(&self) -> bool {
        self.last_accel_mag_filtered > self.config.zupt_accel_low
            && self.last_accel_mag_filtered < self.config.zupt_accel_high
            && self.last_gyro_mag_corrected < self.config.zupt_gyro_threshold
    }

    pub fn is_calibrating(&self) -> bool {
        matches!(self.phase, Phase::Calibrating(_))
    }

    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    pub fn ekf(&self) -> &Ekf13 {
        &self.ekf
    }

    /// Memory governor hook: the secondary comparison filter can be paused
    /// above the resident-memory ceiling and resumed below the floor.
    pub fn set_comp_paused(&mut self, paused: bool) {
        if self.comp.is_some() && self.comp_paused != paused {
            self.comp_paused = paused;
            if paused {
                warn!("[GOVERNOR] comparison filter paused");
            } else {
                info!("[GOVERNOR] comparison filter resumed");
            }
        }
    }

    pub fn comp_paused(&self) -> bool {
        self.comp_paused
    }

    pub fn snapshot(&self) -> FusionSnapshot {
        FusionSnapshot {
            ekf: self.ekf.snapshot(),
            comp: self.comp.as_ref().map(|c| c.output()),
            calibration: self.calibration,
            calibrating: self.is_calibrating(),
            stationary: self.is_stationary(),
            comp_paused: self.comp_paused,
            accel_samples: self.accel_samples,
            gyro_samples: self.gyro_samples,
            gps_fixes: self.gps_fixes,
            latest_gps: self.latest_gps.clone(),
            gps_first_fix_latency: self.gps_first_fix_latency,
            incidents_emitted: self.detector.emitted_count(),
            linear_accel_mps2: self.last_linear_accel,
        }
    }

    fn advance_context(&self) -> AdvanceContext {
        AdvanceContext {
            stationary: self.is_stationary(),
            gps_speed: self.latest_gps.as_ref().map(|g| g.speed),
        }
    }

    fn finish_calibration(&mut self, calibrator: &InitialCalibrator, events: &mut Vec<FusionEvent>) {
        self.calibration = calibrator.finish();
        self.ekf.set_calibration(&self.calibration);
        if let Some(comp) = &mut self.comp {
            comp.set_gravity_mag(self.calibration.gravity_mag);
        }
        self.phase = Phase::Running;
        events.push(FusionEvent::CalibrationComplete {
            gravity_mag: self.calibration.gravity_mag,
            gyro_bias: self.calibration.gyro_bias,
        });

        // A fix that arrived mid-calibration anchors the origin now.
        if let Some(fix) = self.pending_gps.take() {
            self.feed_gps(&fix, events);
        }
    }

    fn feed_accel(&mut self, sample: &AccelSample, events: &mut Vec<FusionEvent>) {
        self.accel_samples += 1;

        if let Phase::Calibrating(ref mut calibrator) = self.phase {
            calibrator.feed_accel(sample);
            let now = sample.timestamp;
            if calibrator.ready(now) || calibrator.expired(now) {
                let calibrator = match std::mem::replace(&mut self.phase, Phase::Running) {
                    Phase::Calibrating(c) => c,
                    Phase::Running => unreachable!(),
                };
                self.finish_calibration(&calibrator, events);
            } else {
                return;
            }
            // The calibration-window sample itself is not re-fed.
            return;
        }

        let raw_mag = sample.magnitude();
        let filtered = self.low_pass(Vector3::new(sample.x, sample.y, sample.z));
        self.last_accel_mag_filtered = filtered.norm();

        // Horizontal linear acceleration from the magnitude alone:
        // |a|² = g² + d² when gravity is orthogonal to the manoeuvre.
        let g = self.calibration.gravity_mag;
        let linear_mag = (self.last_accel_mag_filtered.powi(2) - g * g).max(0.0).sqrt();
        let smoothed_linear = self.smoother.apply(linear_mag);
        self.last_linear_accel = smoothed_linear;

        let ctx = self.advance_context();
        let started = Instant::now();
        self.ekf.advance(&Sample::Accel(sample.clone()), &ctx);
        self.metrics.on_update_duration(started.elapsed());
        if !self.comp_paused {
            if let Some(comp) = &mut self.comp {
                comp.advance(&Sample::Accel(sample.clone()), &ctx);
                self.metrics.on_comp_distance(comp.distance());
            }
        }

        // Recalibration evidence is gated on GPS stationarity alone; the
        // IMU band cannot be trusted once the gravity estimate has drifted.
        if self.gps_says_stationary() {
            self.recalibrator
                .accumulate(sample, self.last_gyro.as_ref());
        }

        self.detector.feed_accel(sample);
        self.detector.observe(
            sample.timestamp,
            smoothed_linear,
            raw_mag,
            self.last_yaw_rate,
            self.latest_gps.as_ref().map(|g| g.speed),
            self.latest_gps.as_ref().map(|g| (g.latitude, g.longitude)),
        );

        self.metrics
            .on_ekf_state(sample.timestamp, &self.ekf.snapshot(), self.ekf.last_gain_norm());
    }

    fn feed_gyro(&mut self, sample: &GyroSample, _events: &mut Vec<FusionEvent>) {
        self.gyro_samples += 1;

        if let Phase::Calibrating(ref mut calibrator) = self.phase {
            calibrator.feed_gyro(sample);
            return;
        }

        let (bx, by, bz) = self.ekf.bias();
        let corrected = (sample.x - bx, sample.y - by, sample.z - bz);
        self.last_gyro_mag_corrected =
            (corrected.0 * corrected.0 + corrected.1 * corrected.1 + corrected.2 * corrected.2)
                .sqrt();
        self.last_yaw_rate = corrected.2;

        let ctx = self.advance_context();
        let started = Instant::now();
        self.ekf.advance(&Sample::Gyro(sample.clone()), &ctx);
        self.metrics.on_update_duration(started.elapsed());

        if ctx.stationary {
            self.metrics
                .on_stationary_residual(self.last_gyro_mag_corrected);
        }

        self.detector.feed_gyro(sample);
        self.detector.observe(
            sample.timestamp,
            self.smoother.apply(
                (self.last_accel_mag_filtered.powi(2)
                    - self.calibration.gravity_mag.powi(2))
                .max(0.0)
                .sqrt(),
            ),
            self.last_accel_mag_filtered,
            self.last_yaw_rate,
            self.latest_gps.as_ref().map(|g| g.speed),
            self.latest_gps.as_ref().map(|g| (g.latitude, g.longitude)),
        );

        self.last_gyro = Some(sample.clone());
    }

    fn feed_gps(&mut self, fix: &GpsFix, events: &mut Vec<FusionEvent>) {
        self.gps_fixes += 1;
        if self.gps_first_fix_latency.is_none() {
            if let Some(start) = self.session_start_ts {
                self.gps_first_fix_latency = Some((fix.timestamp - start).max(0.0));
            }
        }
        self.stationary_tracker.feed_gps(fix);
        self.detector.feed_gps(fix);

        if self.is_calibrating() {
            // Buffered until calibration finishes; the origin is anchored by
            // the first post-calibration fix.
            self.pending_gps = Some(fix.clone());
            self.latest_gps = Some(fix.clone());
            return;
        }

        if fix.accuracy > self.config.gps_max_accuracy_m {
            events.push(FusionEvent::GpsRejected {
                accuracy: fix.accuracy,
            });
            self.latest_gps = Some(fix.clone());
            return;
        }

        let was_origin_set = self.ekf.is_origin_set();
        let ctx = self.advance_context();
        let started = Instant::now();
        self.ekf.advance(&Sample::Gps(fix.clone()), &ctx);
        self.metrics.on_update_duration(started.elapsed());
        if !was_origin_set && self.ekf.is_origin_set() {
            events.push(FusionEvent::OriginSet {
                lat: fix.latitude,
                lon: fix.longitude,
            });
        }
        if !self.comp_paused {
            if let Some(comp) = &mut self.comp {
                comp.advance(&Sample::Gps(fix.clone()), &ctx);
                self.metrics.on_comp_distance(comp.distance());
            }
        }

        self.metrics.on_gps(fix, self.ekf.heading_deg());
        self.latest_gps = Some(fix.clone());

        // Long stationary dwell: re-estimate gravity/bias and adopt when
        // they moved past the thresholds.
        if self.stationary_tracker.stationary_for_dwell(fix.timestamp) {
            if let Some(updated) = self.recalibrator.try_refine(&self.calibration) {
                self.calibration = updated;
                self.ekf.set_gravity_mag(updated.gravity_mag);
                if let Some(comp) = &mut self.comp {
                    comp.set_gravity_mag(updated.gravity_mag);
                }
                events.push(FusionEvent::Recalibrated {
                    gravity_mag: updated.gravity_mag,
                    gyro_bias: updated.gyro_bias,
                });
            }
        }
    }

    fn gps_says_stationary(&self) -> bool {
        self.latest_gps
            .as_ref()
            .map(|g| g.speed < self.config.stationary_gps_speed)
            .unwrap_or(true)
    }

    /// First-order low-pass over the raw accel vector; the first sample
    /// passes through and seeds the state.
    fn low_pass(&mut self, raw: Vector3<f64>) -> Vector3<f64> {
        let filtered = match self.lpf_state {
            Some(prev) => prev * (1.0 - self.lpf_alpha) + raw * self.lpf_alpha,
            None => raw,
        };
        self.lpf_state = Some(filtered);
        filtered
    }
}
