/// Every tunable for one telemetry session, grouped the way the pipeline
/// consumes them. CLI flags override individual fields in `main`.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    // ── Filter construction ──
    pub gps_noise_std: f64,
    pub accel_noise_std: f64,
    pub gyro_noise_std: f64,
    /// Process noise densities for the 13-state filter (per √s).
    pub q_quat: f64,
    pub q_bias: f64,
    pub q_vel: f64,
    pub q_pos: f64,
    /// Maximum accepted prediction interval; longer gaps are skipped.
    pub max_dt_secs: f64,

    // ── Measurement gating ──
    /// Residual gate on | |a| − gravity_mag | for the attitude update [m/s²].
    pub accel_gate_mps2: f64,
    /// GPS fixes with worse horizontal accuracy are rejected [m].
    pub gps_max_accuracy_m: f64,
    /// Extra measurement noise applied to GPS-derived velocity [m/s].
    pub gps_vel_std: f64,

    // ── Stationarity / ZUPT ──
    pub zupt_accel_low: f64,
    pub zupt_accel_high: f64,
    pub zupt_gyro_threshold: f64,
    pub stationary_gps_speed: f64,

    // ── Calibration ──
    pub calib_window_secs: f64,
    pub calib_min_samples: usize,
    /// Stationary dwell before dynamic recalibration may run [s].
    pub recalib_dwell_secs: f64,
    /// Adopt a new gravity magnitude when it moved this far [m/s²].
    pub recalib_gravity_delta: f64,
    /// Adopt a new gyro bias when it drifted this far [rad/s].
    pub recalib_bias_delta: f64,

    // ── Accel conditioning ──
    pub accel_lpf_cutoff_hz: f64,
    pub accel_lpf_sample_hz: f64,
    pub accel_smoother_window: usize,

    // ── Incident detection ──
    pub brake_threshold_g: f64,
    pub swerve_threshold_rads: f64,
    pub swerve_min_speed: f64,
    pub impact_threshold_g: f64,
    pub incident_cooldown_secs: f64,
    pub incident_window_secs: f64,

    // ── Queues ──
    pub raw_queue_capacity: usize,
    pub filter_accel_capacity: usize,
    pub filter_gps_capacity: usize,

    // ── Supervision ──
    pub accel_silence_secs: u64,
    pub gyro_silence_secs: u64,
    pub gps_silence_secs: u64,
    pub health_check_secs: u64,
    pub max_restarts_per_sensor: u32,
    pub restart_cooldown_secs: f64,
    pub restart_validate_secs: f64,
    /// Pause before the second, shorter validation window.
    pub restart_retry_sleep_secs: f64,
    pub restart_retry_window_secs: f64,
    pub restart_backoff_base_secs: f64,
    pub restart_backoff_max_secs: f64,

    // ── Persistence / cadence ──
    pub autosave_secs: u64,
    pub status_secs: u64,
    pub dashboard_secs: u64,
    pub gzip_sessions: bool,
    pub trajectory_ring: usize,
    pub covariance_ring: usize,

    // ── Memory governor ──
    pub memory_pause_mb: f64,
    pub memory_resume_mb: f64,

    // ── Feature flags ──
    pub enable_gyro: bool,
    pub enable_complementary: bool,

    // ── Sensor backends ──
    pub imu_command: String,
    pub accel_sensor_name: String,
    pub gyro_sensor_name: String,
    pub gps_command: String,
    pub imu_delay_ms: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gps_noise_std: 8.0,
            accel_noise_std: 0.3,
            gyro_noise_std: 0.0005,
            q_quat: 1e-6,
            q_bias: 1e-4,
            q_vel: 0.5,
            q_pos: 0.1,
            max_dt_secs: 0.1,
            accel_gate_mps2: 0.5,
            gps_max_accuracy_m: 50.0,
            gps_vel_std: 0.5,
            zupt_accel_low: 9.5,
            zupt_accel_high: 10.1,
            zupt_gyro_threshold: 0.1,
            stationary_gps_speed: 0.1,
            calib_window_secs: 3.0,
            calib_min_samples: 50,
            recalib_dwell_secs: 30.0,
            recalib_gravity_delta: 0.5,
            recalib_bias_delta: 0.005,
            accel_lpf_cutoff_hz: 4.0,
            accel_lpf_sample_hz: 50.0,
            accel_smoother_window: 9,
            brake_threshold_g: 0.8,
            swerve_threshold_rads: 60.0_f64.to_radians(),
            swerve_min_speed: 2.0,
            impact_threshold_g: 1.5,
            incident_cooldown_secs: 5.0,
            incident_window_secs: 30.0,
            raw_queue_capacity: 100,
            filter_accel_capacity: 100,
            filter_gps_capacity: 50,
            accel_silence_secs: 5,
            gyro_silence_secs: 5,
            gps_silence_secs: 30,
            health_check_secs: 2,
            max_restarts_per_sensor: 60,
            restart_cooldown_secs: 12.0,
            restart_validate_secs: 30.0,
            restart_retry_sleep_secs: 5.0,
            restart_retry_window_secs: 10.0,
            restart_backoff_base_secs: 5.0,
            restart_backoff_max_secs: 40.0,
            autosave_secs: 15,
            status_secs: 2,
            dashboard_secs: 30,
            gzip_sessions: true,
            trajectory_ring: 1000,
            covariance_ring: 2000,
            memory_pause_mb: 95.0,
            memory_resume_mb: 90.0,
            enable_gyro: true,
            enable_complementary: true,
            imu_command: "termux-sensor".to_string(),
            accel_sensor_name: "Accelerometer".to_string(),
            gyro_sensor_name: "Gyroscope".to_string(),
            gps_command: "termux-location".to_string(),
            imu_delay_ms: 20,
        }
    }
}
