use crate::config::EngineConfig;
use crate::error::SensorError;
use crate::fusion::{FusionEvent, FusionPipeline};
use crate::incident::write_incident_file;
use crate::live_status::{current_timestamp, LiveStatus, SessionStatus};
use crate::metrics::resident_memory_mb;
use crate::persistence::{
    finalize_session, save_session, session_file_name, SessionAccumulator,
};
use crate::fusion::FusionSnapshot;
use crate::queues::{OverflowPolicy, SampleQueue, StatusSlot};
use crate::sensors::DaemonSpec;
use crate::supervisor::{ManagedSensor, Supervisor};
use crate::types::{CovarianceSnapshot, Sample, TrajectoryPoint};
use anyhow::{Context, Result};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// None runs until a shutdown signal.
    pub duration: Option<Duration>,
    pub output_dir: PathBuf,
}

#[derive(Clone, Debug)]
pub struct SessionSummary {
    pub session_id: String,
    pub elapsed: Duration,
    pub accel_samples: u64,
    pub gyro_samples: u64,
    pub gps_fixes: u64,
    pub incidents: u64,
    pub autosaves: u64,
    pub restarts: u32,
    pub peak_memory_mb: f64,
    pub final_session_path: Option<PathBuf>,
}

fn sleep_observing(shutdown: &AtomicBool, total: Duration) -> bool {
    let mut slept = Duration::ZERO;
    while slept < total {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        let step = Duration::from_millis(250).min(total - slept);
        std::thread::sleep(step);
        slept += step;
    }
    !shutdown.load(Ordering::SeqCst)
}

fn spawn_named<F: FnOnce() + Send + 'static>(name: &str, f: F) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new().name(name.to_string()).spawn(f)
}

/// Owns every session thread: sensor daemons and their supervisor, the
/// fusion consumer, the status publisher, the persistence timer, and the
/// display loop. One shared shutdown flag, observed within 2 s everywhere.
pub struct Orchestrator {
    config: EngineConfig,
    options: SessionOptions,
    /// Overrides for the sensor backends, used by tests and replay rigs.
    spec_overrides: Option<Vec<DaemonSpec>>,
}

impl Orchestrator {
    pub fn new(config: EngineConfig, options: SessionOptions) -> Self {
        Orchestrator {
            config,
            options,
            spec_overrides: None,
        }
    }

    pub fn with_specs(config: EngineConfig, options: SessionOptions, specs: Vec<DaemonSpec>) -> Self {
        Orchestrator {
            config,
            options,
            spec_overrides: Some(specs),
        }
    }

    fn daemon_specs(&self) -> Vec<DaemonSpec> {
        if let Some(specs) = &self.spec_overrides {
            return specs.clone();
        }
        let mut specs = vec![DaemonSpec::accel(&self.config)];
        if self.config.enable_gyro {
            specs.push(DaemonSpec::gyro(&self.config));
        }
        specs.push(DaemonSpec::gps(&self.config));
        specs
    }

    /// Run one session to completion. Returns non-error for every outcome
    /// except unrecoverable startup failures (sensor missing / denied).
    pub fn run(&self, shutdown: Arc<AtomicBool>) -> Result<SessionSummary> {
        let started = Instant::now();
        let session_stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let session_id = format!("session_{session_stamp}");
        info!("[SESSION] {session_id} starting");

        std::fs::create_dir_all(&self.options.output_dir)
            .with_context(|| format!("creating {}", self.options.output_dir.display()))?;
        let incidents_dir = self.options.output_dir.join("incidents");
        let status_path = self.options.output_dir.join("live_status.json");
        let session_path = self
            .options
            .output_dir
            .join(session_file_name(self.config.gzip_sessions));

        // Raw queues shed the incoming sample under pressure; the filter
        // input queues evict the oldest so the pipeline sees fresh data.
        let filter_imu = Arc::new(SampleQueue::new(
            "filter-imu",
            self.config.filter_accel_capacity,
            OverflowPolicy::DropOldest,
        ));
        let filter_gps = Arc::new(SampleQueue::new(
            "filter-gps",
            self.config.filter_gps_capacity,
            OverflowPolicy::DropOldest,
        ));

        // Sensor daemons under supervision.
        let mut sensors: Vec<Arc<ManagedSensor>> = Vec::new();
        for spec in self.daemon_specs() {
            let raw_queue = Arc::new(SampleQueue::new(
                match spec.kind {
                    crate::types::SensorKind::Accel => "raw-accel",
                    crate::types::SensorKind::Gyro => "raw-gyro",
                    crate::types::SensorKind::Gps => "raw-gps",
                },
                self.config.raw_queue_capacity,
                OverflowPolicy::DropNewest,
            ));
            sensors.push(Arc::new(ManagedSensor::new(spec, raw_queue, &self.config)));
        }
        for sensor in &sensors {
            match sensor.start() {
                Ok(()) => {}
                Err(e) if e.is_fatal_at_start() => {
                    return Err(anyhow::Error::new(e)).context("sensor startup");
                }
                Err(SensorError::AlreadyRunning(kind)) => {
                    warn!("[SESSION] {kind} daemon already running");
                }
                Err(e) => {
                    // Recoverable: the supervisor takes it from here.
                    warn!("[SESSION] {} start deferred: {e}", sensor.kind().name());
                }
            }
        }

        let supervisor = Arc::new(Supervisor::new(
            self.config.clone(),
            sensors.clone(),
            Arc::clone(&shutdown),
        ));

        let pipeline = Arc::new(Mutex::new(FusionPipeline::new(self.config.clone())));
        let accumulator = Arc::new(Mutex::new(SessionAccumulator::new(
            current_timestamp(),
            self.config.trajectory_ring,
            self.config.covariance_ring,
        )));
        // Capacity-1 overwrite channel: the fusion thread publishes its
        // freshest snapshot, the status thread takes whatever is latest.
        let snapshot_slot: Arc<StatusSlot<FusionSnapshot>> = Arc::new(StatusSlot::new());

        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        // Health monitor / restart supervisor.
        {
            let supervisor = Arc::clone(&supervisor);
            handles.push(spawn_named("health-monitor", move || supervisor.run())?);
        }

        // Fusion consumer: raw queues → filter queues → pipeline.
        {
            let sensors = sensors.clone();
            let filter_imu = Arc::clone(&filter_imu);
            let filter_gps = Arc::clone(&filter_gps);
            let pipeline = Arc::clone(&pipeline);
            let accumulator = Arc::clone(&accumulator);
            let shutdown = Arc::clone(&shutdown);
            let incidents_dir = incidents_dir.clone();
            let snapshot_slot = Arc::clone(&snapshot_slot);
            handles.push(spawn_named("fusion", move || {
                while !shutdown.load(Ordering::SeqCst) {
                    let moved = forward_raw(&sensors, &filter_imu, &filter_gps, &accumulator);
                    let processed =
                        drain_filter_queues(&filter_imu, &filter_gps, &pipeline, &accumulator, &incidents_dir);
                    if processed > 0 {
                        if let Ok(p) = pipeline.lock() {
                            snapshot_slot.publish(p.snapshot());
                        }
                    }
                    if moved == 0 && processed == 0 {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                }
            })?);
        }

        // Status publisher + memory governor, every 2 s.
        {
            let pipeline = Arc::clone(&pipeline);
            let accumulator = Arc::clone(&accumulator);
            let shutdown = Arc::clone(&shutdown);
            let snapshot_slot = Arc::clone(&snapshot_slot);
            let status_path = status_path.clone();
            let session_id = session_id.clone();
            let interval = Duration::from_secs(self.config.status_secs);
            let pause_mb = self.config.memory_pause_mb;
            let resume_mb = self.config.memory_resume_mb;
            handles.push(spawn_named("status", move || {
                let started = Instant::now();
                while sleep_observing(&shutdown, interval) {
                    publish_status(
                        &pipeline,
                        &accumulator,
                        &snapshot_slot,
                        &status_path,
                        &session_id,
                        started.elapsed(),
                        pause_mb,
                        resume_mb,
                    );
                }
            })?);
        }

        // Persistence timer, every 15 s.
        {
            let pipeline = Arc::clone(&pipeline);
            let accumulator = Arc::clone(&accumulator);
            let shutdown = Arc::clone(&shutdown);
            let session_path = session_path.clone();
            let interval = Duration::from_secs(self.config.autosave_secs);
            let gzip = self.config.gzip_sessions;
            handles.push(spawn_named("persistence", move || {
                let started = Instant::now();
                while sleep_observing(&shutdown, interval) {
                    autosave(&pipeline, &accumulator, &session_path, gzip, started.elapsed());
                }
            })?);
        }

        // Display loop, every 30 s.
        {
            let pipeline = Arc::clone(&pipeline);
            let supervisor = Arc::clone(&supervisor);
            let shutdown = Arc::clone(&shutdown);
            let interval = Duration::from_secs(self.config.dashboard_secs);
            handles.push(spawn_named("display", move || {
                while sleep_observing(&shutdown, interval) {
                    if let Ok(pipeline) = pipeline.lock() {
                        info!("{}", pipeline.metrics.dashboard_line());
                    }
                    info!("[HEALTH] {}", supervisor.report().format_status());
                }
            })?);
        }

        // Main wait: duration elapsed or external shutdown.
        match self.options.duration {
            Some(duration) => {
                let deadline = started + duration;
                while Instant::now() < deadline && !shutdown.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(250));
                }
                info!("[SESSION] duration reached");
            }
            None => {
                while !shutdown.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(250));
                }
                info!("[SESSION] shutdown signal observed");
            }
        }
        shutdown.store(true, Ordering::SeqCst);

        // Stop sensors first so the queues stop refilling, then join the
        // workers (each observes the flag within 250 ms).
        for sensor in &sensors {
            sensor.stop();
        }
        for handle in handles {
            let _ = handle.join();
        }

        // Drain whatever is still queued through the pipeline.
        forward_raw(&sensors, &filter_imu, &filter_gps, &accumulator);
        drain_filter_queues(&filter_imu, &filter_gps, &pipeline, &accumulator, &incidents_dir);
        for sensor in &sensors {
            let q = sensor.queue();
            if q.produced() != q.delivered() + q.dropped() + q.len() as u64 {
                warn!(
                    "[SESSION] {} queue accounting mismatch: produced {} delivered {} dropped {}",
                    sensor.kind().name(),
                    q.produced(),
                    q.delivered(),
                    q.dropped()
                );
            }
        }

        // Flush incidents still waiting on their post-window, then the final
        // best-effort save.
        {
            let now = current_timestamp();
            let flushed = match pipeline.lock() {
                Ok(mut p) => p.flush_incidents(now),
                Err(_) => Vec::new(),
            };
            if let Ok(mut acc) = accumulator.lock() {
                for record in flushed {
                    if let Err(e) = write_incident_file(&incidents_dir, &record) {
                        warn!("[INCIDENT] write failed: {e}");
                    }
                    acc.record_incident(record);
                }
            }
        }
        autosave(&pipeline, &accumulator, &session_path, self.config.gzip_sessions, started.elapsed());
        let final_session_path = match finalize_session(
            &self.options.output_dir,
            &session_path,
            &session_stamp,
            self.config.gzip_sessions,
        ) {
            Ok(path) => Some(path),
            Err(e) => {
                error!("[SAVE] final session copy failed: {e}");
                None
            }
        };

        LiveStatus::delete(&status_path);

        let (snapshot, autosaves) = {
            let snap = pipeline
                .lock()
                .map(|p| p.snapshot())
                .map_err(|_| anyhow::anyhow!("fusion pipeline poisoned"))?;
            let saves = accumulator.lock().map(|a| a.saves()).unwrap_or(0);
            (snap, saves)
        };
        let summary = SessionSummary {
            session_id,
            elapsed: started.elapsed(),
            accel_samples: snapshot.accel_samples,
            gyro_samples: snapshot.gyro_samples,
            gps_fixes: snapshot.gps_fixes,
            incidents: snapshot.incidents_emitted,
            autosaves,
            restarts: supervisor.total_restarts(),
            peak_memory_mb: pipeline
                .lock()
                .map(|p| p.metrics.peak_memory_mb())
                .unwrap_or(0.0),
            final_session_path,
        };
        info!(
            "[SESSION] {} done: {} accel, {} gyro, {} gps, {} incidents, {} autosaves",
            summary.session_id,
            summary.accel_samples,
            summary.gyro_samples,
            summary.gps_fixes,
            summary.incidents,
            summary.autosaves
        );
        Ok(summary)
    }
}

/// Stage 1: raw daemon queues → filter input queues, recording raw samples
/// for persistence on the way through.
fn forward_raw(
    sensors: &[Arc<ManagedSensor>],
    filter_imu: &SampleQueue<Sample>,
    filter_gps: &SampleQueue<Sample>,
    accumulator: &Mutex<SessionAccumulator>,
) -> usize {
    let mut moved = 0;
    for sensor in sensors {
        // Bounded batch per tick so one hot queue cannot starve the others.
        for _ in 0..256 {
            let Some(sample) = sensor.queue().try_recv() else {
                break;
            };
            if let Ok(mut acc) = accumulator.lock() {
                acc.record_sample(&sample);
            }
            let is_gps = matches!(sample, Sample::Gps(_));
            if is_gps {
                filter_gps.push(sample);
            } else {
                filter_imu.push(sample);
            }
            moved += 1;
        }
    }
    moved
}

/// Stage 2: filter input queues → fusion pipeline, handling emitted events.
fn drain_filter_queues(
    filter_imu: &SampleQueue<Sample>,
    filter_gps: &SampleQueue<Sample>,
    pipeline: &Mutex<FusionPipeline>,
    accumulator: &Mutex<SessionAccumulator>,
    incidents_dir: &std::path::Path,
) -> usize {
    let mut processed = 0;
    for queue in [filter_imu, filter_gps] {
        for _ in 0..256 {
            let Some(sample) = queue.try_recv() else {
                break;
            };
            let events = match pipeline.lock() {
                Ok(mut p) => p.handle(&sample),
                Err(_) => Vec::new(),
            };
            handle_events(events, accumulator, incidents_dir);
            processed += 1;
        }
    }
    processed
}

fn handle_events(
    events: Vec<FusionEvent>,
    accumulator: &Mutex<SessionAccumulator>,
    incidents_dir: &std::path::Path,
) {
    for event in events {
        match event {
            FusionEvent::CalibrationComplete {
                gravity_mag,
                gyro_bias,
            } => info!(
                "[CALIB] complete: gravity {gravity_mag:.3} m/s², bias ({:.5}, {:.5}, {:.5})",
                gyro_bias.0, gyro_bias.1, gyro_bias.2
            ),
            FusionEvent::OriginSet { lat, lon } => {
                info!("[SESSION] ENU origin at ({lat:.6}, {lon:.6})");
            }
            FusionEvent::GpsRejected { accuracy } => {
                warn!("[GPS] fix rejected: accuracy {accuracy:.1} m");
            }
            FusionEvent::Recalibrated {
                gravity_mag,
                gyro_bias,
            } => info!(
                "[CALIB] recalibrated: gravity {gravity_mag:.3} m/s², bias ({:.5}, {:.5}, {:.5})",
                gyro_bias.0, gyro_bias.1, gyro_bias.2
            ),
            FusionEvent::IncidentDetected(record) => {
                if let Err(e) = write_incident_file(incidents_dir, &record) {
                    warn!("[INCIDENT] write failed: {e}");
                }
                if let Ok(mut acc) = accumulator.lock() {
                    acc.record_incident(record);
                }
            }
        }
    }
}

/// Status tick: trajectory/covariance recording, live-status write, memory
/// governor hysteresis.
#[allow(clippy::too_many_arguments)]
fn publish_status(
    pipeline: &Mutex<FusionPipeline>,
    accumulator: &Mutex<SessionAccumulator>,
    snapshot_slot: &StatusSlot<FusionSnapshot>,
    status_path: &std::path::Path,
    session_id: &str,
    elapsed: Duration,
    pause_mb: f64,
    resume_mb: f64,
) {
    let memory_mb = resident_memory_mb();
    {
        let Ok(mut p) = pipeline.lock() else {
            return;
        };
        p.metrics.on_memory(memory_mb);
        if memory_mb > pause_mb {
            p.set_comp_paused(true);
        } else if memory_mb < resume_mb {
            p.set_comp_paused(false);
        }
    }
    // Prefer the fusion thread's published snapshot; fall back to a short
    // critical section when nothing new arrived this tick.
    let snapshot = match snapshot_slot.take() {
        Some(snapshot) => snapshot,
        None => match pipeline.lock() {
            Ok(p) => p.snapshot(),
            Err(_) => return,
        },
    };

    if let Ok(mut acc) = accumulator.lock() {
        let now = current_timestamp();
        acc.record_ekf_point(TrajectoryPoint {
            timestamp: now,
            x: snapshot.ekf.position.0,
            y: snapshot.ekf.position.1,
            velocity: (snapshot.ekf.velocity.0.powi(2) + snapshot.ekf.velocity.1.powi(2)).sqrt(),
            heading_deg: snapshot.ekf.heading_deg,
            uncertainty_m: snapshot.ekf.uncertainty_m,
        });
        if let Some(comp) = &snapshot.comp {
            acc.record_comp_point(TrajectoryPoint {
                timestamp: now,
                x: comp.x,
                y: comp.y,
                velocity: comp.velocity,
                heading_deg: comp.heading_deg,
                uncertainty_m: comp.uncertainty_m,
            });
        }
        acc.record_covariance(CovarianceSnapshot {
            timestamp: now,
            trace: snapshot.ekf.covariance_trace,
            diag: snapshot.ekf.covariance_diag,
        });
    }

    let mut status = LiveStatus::new(session_id);
    status.status = if snapshot.calibrating {
        SessionStatus::Initialising
    } else {
        SessionStatus::Active
    };
    status.elapsed_s = elapsed.as_secs_f64();
    status.last_update = current_timestamp();
    status.gps_fixes = snapshot.gps_fixes;
    status.accel_samples = snapshot.accel_samples;
    status.gyro_samples = snapshot.gyro_samples;
    status.current_velocity =
        (snapshot.ekf.velocity.0.powi(2) + snapshot.ekf.velocity.1.powi(2)).sqrt();
    status.current_heading = snapshot.ekf.heading_deg;
    status.total_distance = snapshot.ekf.distance;
    status.latest_gps = snapshot.latest_gps.clone();
    status.incidents_count = snapshot.incidents_emitted;
    status.memory_mb = memory_mb;
    status.filter_kind = if snapshot.comp.is_some() {
        "ekf+complementary".to_string()
    } else {
        "ekf".to_string()
    };
    status.gps_first_fix_latency = snapshot.gps_first_fix_latency;
    let power = crate::physics::specific_power(
        status.current_velocity,
        snapshot.linear_accel_mps2,
        &crate::physics::LoadModel::default(),
    );
    status.specific_power_w_per_kg = (power.specific_power_w_per_kg * 100.0).round() / 100.0;
    status.power_coefficient = (power.power_coefficient * 100.0).round() / 100.0;
    if let Err(e) = status.save(status_path) {
        warn!("[STATUS] write failed: {e}");
    }
}

/// Autosave tick: atomic write, then clear-after-save. Failures warn and
/// leave the accumulator intact for the next tick.
fn autosave(
    pipeline: &Mutex<FusionPipeline>,
    accumulator: &Mutex<SessionAccumulator>,
    session_path: &std::path::Path,
    gzip: bool,
    elapsed: Duration,
) {
    let metrics = match pipeline.lock() {
        Ok(p) => p.metrics.export(),
        Err(_) => return,
    };
    let peak = metrics.peak_memory_mb;
    let file = match accumulator.lock() {
        Ok(acc) => acc.build_file(elapsed.as_secs_f64(), metrics, peak),
        Err(_) => return,
    };
    match save_session(session_path, &file, gzip) {
        Ok(path) => {
            if let Ok(mut acc) = accumulator.lock() {
                acc.clear_after_save();
                info!(
                    "[SAVE] autosave #{} to {}",
                    acc.saves(),
                    path.display()
                );
            }
        }
        Err(e) => warn!("[SAVE] autosave failed, retrying next tick: {e}"),
    }
}
