use crate::config::EngineConfig;
use crate::error::SensorError;
use crate::health_monitor::{HealthReport, SensorHealth};
use crate::queues::SampleQueue;
use crate::sensors::{DaemonMode, DaemonSpec, SensorDaemon};
use crate::types::{Sample, SensorKind};
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Sleep in small steps so the shutdown flag is observed within 250 ms.
/// Returns false when shutdown interrupted the wait.
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

/// Per-sensor restart bookkeeping. Successful restarts count toward the
/// session cap; validation failures only drive the backoff schedule.
#[derive(Debug)]
pub struct RestartPolicy {
    kind: SensorKind,
    successful_restarts: u32,
    max_restarts: u32,
    consecutive_failures: u32,
    base_backoff: Duration,
    max_backoff: Duration,
    current_backoff: Duration,
    next_retry: Instant,
    declared_dead: bool,
}

impl RestartPolicy {
    pub fn new(kind: SensorKind, config: &EngineConfig) -> Self {
        let base = Duration::from_secs_f64(config.restart_backoff_base_secs);
        RestartPolicy {
            kind,
            successful_restarts: 0,
            max_restarts: config.max_restarts_per_sensor,
            consecutive_failures: 0,
            base_backoff: base,
            max_backoff: Duration::from_secs_f64(config.restart_backoff_max_secs),
            current_backoff: base,
            next_retry: Instant::now(),
            declared_dead: false,
        }
    }

    pub fn can_attempt(&self) -> bool {
        !self.declared_dead && Instant::now() >= self.next_retry
    }

    pub fn record_success(&mut self) {
        self.successful_restarts += 1;
        self.consecutive_failures = 0;
        self.current_backoff = self.base_backoff;
        self.next_retry = Instant::now();
        info!(
            "[RESTART] {} restarted ({}/{} this session)",
            self.kind.name(),
            self.successful_restarts,
            self.max_restarts
        );
        if self.successful_restarts >= self.max_restarts {
            self.declared_dead = true;
            warn!(
                "[RESTART] {} reached the per-session restart limit, declaring dead",
                self.kind.name()
            );
        }
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        self.next_retry = Instant::now() + self.current_backoff;
        warn!(
            "[RESTART] {} restart validation failed (streak {}), next retry in {:.0}s",
            self.kind.name(),
            self.consecutive_failures,
            self.current_backoff.as_secs_f64()
        );
        self.current_backoff = (self.current_backoff * 2).min(self.max_backoff);
    }

    pub fn successful_restarts(&self) -> u32 {
        self.successful_restarts
    }

    pub fn is_dead(&self) -> bool {
        self.declared_dead
    }
}

/// A sensor family under supervision: the current daemon (swapped on
/// restart), its silence model, and the restart gate serialising recoveries.
pub struct ManagedSensor {
    spec: DaemonSpec,
    queue: Arc<SampleQueue<Sample>>,
    health: SensorHealth,
    daemon: Mutex<Arc<SensorDaemon>>,
    restart_gate: Mutex<()>,
    policy: Mutex<RestartPolicy>,
}

impl ManagedSensor {
    pub fn new(spec: DaemonSpec, queue: Arc<SampleQueue<Sample>>, config: &EngineConfig) -> Self {
        let daemon = Arc::new(SensorDaemon::new(spec.clone(), Arc::clone(&queue)));
        ManagedSensor {
            health: SensorHealth::for_kind(spec.kind, config),
            policy: Mutex::new(RestartPolicy::new(spec.kind, config)),
            spec,
            queue,
            daemon: Mutex::new(daemon),
            restart_gate: Mutex::new(()),
        }
    }

    pub fn kind(&self) -> SensorKind {
        self.spec.kind
    }

    pub fn start(&self) -> Result<(), SensorError> {
        self.daemon().start()
    }

    pub fn stop(&self) {
        self.daemon().stop();
    }

    pub fn daemon(&self) -> Arc<SensorDaemon> {
        Arc::clone(&self.daemon.lock().unwrap_or_else(|p| p.into_inner()))
    }

    fn replace_daemon(&self, fresh: Arc<SensorDaemon>) {
        *self.daemon.lock().unwrap_or_else(|p| p.into_inner()) = fresh;
    }

    pub fn queue(&self) -> &Arc<SampleQueue<Sample>> {
        &self.queue
    }

    pub fn last_sample_instant(&self) -> Option<Instant> {
        self.daemon().last_sample_instant()
    }

    pub fn is_alive(&self) -> bool {
        self.daemon().is_alive()
    }

    pub fn restarts(&self) -> u32 {
        self.policy
            .lock()
            .map(|p| p.successful_restarts())
            .unwrap_or(0)
    }

    pub fn is_dead(&self) -> bool {
        self.policy.lock().map(|p| p.is_dead()).unwrap_or(false)
    }

    /// Substrings identifying this sensor family in the process table.
    /// IMU streams are discriminated by sensor name (wrapper and backend both
    /// carry it on their command line); the GPS poller by its command.
    fn family_patterns(&self) -> Vec<String> {
        match self.spec.mode {
            DaemonMode::Stream => vec![self.spec.match_key.clone()],
            DaemonMode::Poll { .. } => vec![self.spec.command.clone()],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RestartOutcome {
    AlreadyHealthy,
    InFlight,
    BackoffOrDead,
    Restarted,
    ValidationFailed,
    StartFailed,
    ShuttingDown,
}

/// Keeps sensor daemons producing data. Polls silence every 2 s and runs the
/// serialized restart protocol for unhealthy families; failures never leak
/// processes or descriptors, and validation never touches the production
/// queue (it watches the daemon's published `last_sample_instant` instead).
pub struct Supervisor {
    config: EngineConfig,
    sensors: Vec<Arc<ManagedSensor>>,
    shutdown: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(
        config: EngineConfig,
        sensors: Vec<Arc<ManagedSensor>>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Supervisor {
            config,
            sensors,
            shutdown,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn sensors(&self) -> &[Arc<ManagedSensor>] {
        &self.sensors
    }

    pub fn sensor(&self, kind: SensorKind) -> Option<&Arc<ManagedSensor>> {
        self.sensors.iter().find(|s| s.kind() == kind)
    }

    pub fn report(&self) -> HealthReport {
        HealthReport {
            sensors: self
                .sensors
                .iter()
                .map(|s| s.health.report(s.last_sample_instant(), s.is_alive()))
                .collect(),
        }
    }

    pub fn total_restarts(&self) -> u32 {
        self.sensors.iter().map(|s| s.restarts()).sum()
    }

    /// Health loop: runs until shutdown, checking every `health_check_secs`.
    pub fn run(self: &Arc<Self>) {
        let interval = Duration::from_secs(self.config.health_check_secs);
        while sleep_observing(&self.shutdown, interval) {
            self.tick();
            self.reap_workers();
        }
        self.join_workers();
    }

    fn tick(self: &Arc<Self>) {
        let report = self.report();
        for unhealthy in report.unhealthy() {
            let Some(sensor) = self.sensor(unhealthy.kind) else {
                continue;
            };
            if sensor.is_dead() {
                continue;
            }
            let allowed = sensor.policy.lock().map(|p| p.can_attempt()).unwrap_or(false);
            if !allowed {
                continue;
            }
            warn!(
                "[HEALTH] {} unhealthy (alive={}, silent {:.1}s), scheduling restart",
                unhealthy.kind.name(),
                unhealthy.alive,
                unhealthy.silence.as_secs_f64()
            );
            let me = Arc::clone(self);
            let sensor = Arc::clone(sensor);
            let handle = std::thread::Builder::new()
                .name(format!("{}-restart", sensor.kind().name()))
                .spawn(move || {
                    let _ = me.restart_sensor(&sensor);
                });
            if let Ok(handle) = handle {
                if let Ok(mut workers) = self.workers.lock() {
                    workers.push(handle);
                }
            }
        }
    }

    fn reap_workers(&self) {
        if let Ok(mut workers) = self.workers.lock() {
            let mut still_running = Vec::new();
            for handle in workers.drain(..) {
                if handle.is_finished() {
                    let _ = handle.join();
                } else {
                    still_running.push(handle);
                }
            }
            *workers = still_running;
        }
    }

    fn join_workers(&self) {
        let handles: Vec<_> = self
            .workers
            .lock()
            .map(|mut w| w.drain(..).collect())
            .unwrap_or_default();
        for handle in handles {
            // Workers observe the shutdown flag at every chunked sleep, so
            // these joins complete within a couple of seconds.
            let _ = handle.join();
        }
    }

    /// The restart protocol. Serialized per sensor by `restart_gate`; the lock
    /// is held across the whole restart while other families keep producing.
    pub fn restart_sensor(&self, sensor: &ManagedSensor) -> RestartOutcome {
        // Step 1: only one restart in flight per sensor, ever.
        let Ok(_gate) = sensor.restart_gate.try_lock() else {
            return RestartOutcome::InFlight;
        };

        let allowed = sensor.policy.lock().map(|p| p.can_attempt()).unwrap_or(false);
        if !allowed {
            return RestartOutcome::BackoffOrDead;
        }

        // Step 2: the sensor may have recovered between tick and here.
        if sensor.is_alive() && !sensor.health.is_silent(sensor.last_sample_instant()) {
            return RestartOutcome::AlreadyHealthy;
        }

        info!("[RESTART] {} protocol starting", sensor.kind().name());

        // Step 3: graceful stop of the old daemon releases its stdio.
        sensor.stop();

        // Steps 4-5: clear residual wrapper/backend processes of this family
        // only, then wait for the process table to drain.
        let patterns = sensor.family_patterns();
        kill_family(&patterns);
        if !wait_family_clear(&patterns, &self.shutdown) {
            // Residual processes survived SIGKILL; give the OS one more
            // moment before spawning a replacement next to them.
            if !sleep_observing(&self.shutdown, Duration::from_secs(2)) {
                return RestartOutcome::ShuttingDown;
            }
        }
        if self.shutdown.load(Ordering::SeqCst) {
            return RestartOutcome::ShuttingDown;
        }

        // Step 6: fresh daemon on the same production queue, then let the OS
        // sensor service re-initialise before trusting any output.
        let restart_instant = Instant::now();
        let fresh = Arc::new(SensorDaemon::new(
            sensor.spec.clone(),
            Arc::clone(&sensor.queue),
        ));
        if let Err(e) = fresh.start() {
            warn!("[RESTART] {} respawn failed: {e}", sensor.kind().name());
            sensor.replace_daemon(fresh);
            if let Ok(mut policy) = sensor.policy.lock() {
                policy.record_failure();
            }
            return RestartOutcome::StartFailed;
        }
        sensor.replace_daemon(Arc::clone(&fresh));
        if !sleep_observing(
            &self.shutdown,
            Duration::from_secs_f64(self.config.restart_cooldown_secs),
        ) {
            return RestartOutcome::ShuttingDown;
        }

        // Step 7: validate against the atomically published sample instant,
        // never by racing the production consumer for a sample.
        let window = Duration::from_secs_f64(self.config.restart_validate_secs);
        let mut validated = wait_for_sample_after(&fresh, restart_instant, window, &self.shutdown);
        if !validated && !self.shutdown.load(Ordering::SeqCst) {
            if !sleep_observing(
                &self.shutdown,
                Duration::from_secs_f64(self.config.restart_retry_sleep_secs),
            ) {
                return RestartOutcome::ShuttingDown;
            }
            validated = wait_for_sample_after(
                &fresh,
                restart_instant,
                Duration::from_secs_f64(self.config.restart_retry_window_secs),
                &self.shutdown,
            );
        }
        if self.shutdown.load(Ordering::SeqCst) {
            return RestartOutcome::ShuttingDown;
        }

        if validated {
            if let Ok(mut policy) = sensor.policy.lock() {
                policy.record_success();
            }
            RestartOutcome::Restarted
        } else {
            // Step 8: leave the daemon running; the next health tick decides.
            if let Ok(mut policy) = sensor.policy.lock() {
                policy.record_failure();
            }
            RestartOutcome::ValidationFailed
        }
    }
}

fn wait_for_sample_after(
    daemon: &SensorDaemon,
    after: Instant,
    window: Duration,
    shutdown: &AtomicBool,
) -> bool {
    let deadline = Instant::now() + window;
    while Instant::now() < deadline {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        if daemon.last_sample_instant().map(|t| t > after).unwrap_or(false) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(250));
    }
    false
}

/// Pids whose command line contains any of the family patterns. Never
/// includes this process. Non-Linux hosts report an empty table.
#[cfg(target_os = "linux")]
pub fn scan_family_pids(patterns: &[String]) -> Vec<i32> {
    let own = std::process::id() as i32;
    let mut pids = Vec::new();
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return pids;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Ok(pid) = name.to_string_lossy().parse::<i32>() else {
            continue;
        };
        if pid == own {
            continue;
        }
        let Ok(raw) = std::fs::read(format!("/proc/{pid}/cmdline")) else {
            continue;
        };
        let cmdline = String::from_utf8_lossy(&raw).replace('\0', " ");
        if patterns
            .iter()
            .any(|p| !p.is_empty() && cmdline.contains(p.as_str()))
        {
            pids.push(pid);
        }
    }
    pids
}

#[cfg(not(target_os = "linux"))]
pub fn scan_family_pids(_patterns: &[String]) -> Vec<i32> {
    Vec::new()
}

#[cfg(unix)]
fn kill_family(patterns: &[String]) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    for pid in scan_family_pids(patterns) {
        warn!("[RESTART] killing residual sensor process {pid}");
        let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_family(_patterns: &[String]) {}

/// Poll the process table every 200 ms, up to 5 s, until no family process
/// remains. Returns true when the table drained.
fn wait_family_clear(patterns: &[String], shutdown: &AtomicBool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if shutdown.load(Ordering::SeqCst) {
            return false;
        }
        if scan_family_pids(patterns).is_empty() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(200));
    }
    scan_family_pids(patterns).is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queues::OverflowPolicy;
    use crate::sensors::DaemonMode;

    fn fast_config() -> EngineConfig {
        EngineConfig {
            restart_cooldown_secs: 0.1,
            restart_validate_secs: 3.0,
            restart_retry_sleep_secs: 0.1,
            restart_retry_window_secs: 0.3,
            restart_backoff_base_secs: 0.05,
            restart_backoff_max_secs: 0.4,
            ..EngineConfig::default()
        }
    }

    // Each test gets its own sensor-family key so the family-scoped kill in
    // one test can never touch another test's scripted children.
    fn sh_stream_spec(script: &str, family: &str) -> DaemonSpec {
        DaemonSpec {
            kind: SensorKind::Accel,
            command: "sh".into(),
            args: vec!["-c".into(), script.into()],
            match_key: family.into(),
            mode: DaemonMode::Stream,
        }
    }

    fn managed(script: &str, family: &str, config: &EngineConfig) -> Arc<ManagedSensor> {
        let queue = Arc::new(SampleQueue::new("accel", 100, OverflowPolicy::DropNewest));
        Arc::new(ManagedSensor::new(
            sh_stream_spec(script, family),
            queue,
            config,
        ))
    }

    #[test]
    fn backoff_doubles_and_clamps() {
        let config = EngineConfig::default();
        let mut policy = RestartPolicy::new(SensorKind::Accel, &config);
        assert!(policy.can_attempt());

        policy.record_failure();
        assert_eq!(policy.current_backoff, Duration::from_secs(10));
        policy.record_failure();
        assert_eq!(policy.current_backoff, Duration::from_secs(20));
        policy.record_failure();
        assert_eq!(policy.current_backoff, Duration::from_secs(40));
        policy.record_failure();
        assert_eq!(policy.current_backoff, Duration::from_secs(40));
        assert!(!policy.can_attempt());
    }

    #[test]
    fn success_resets_backoff_and_counts() {
        let config = EngineConfig::default();
        let mut policy = RestartPolicy::new(SensorKind::Gps, &config);
        policy.record_failure();
        policy.record_failure();
        policy.record_success();
        assert_eq!(policy.successful_restarts(), 1);
        assert_eq!(policy.current_backoff, Duration::from_secs(5));
        assert!(policy.can_attempt());
    }

    #[test]
    fn restart_cap_declares_sensor_dead() {
        let config = EngineConfig {
            max_restarts_per_sensor: 2,
            ..EngineConfig::default()
        };
        let mut policy = RestartPolicy::new(SensorKind::Accel, &config);
        policy.record_success();
        assert!(!policy.is_dead());
        policy.record_success();
        assert!(policy.is_dead());
        assert!(!policy.can_attempt());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn process_table_scan_is_family_scoped() {
        use std::process::Command;

        let marker = "31.4159265";
        let mut child = Command::new("sleep").arg(marker).spawn().unwrap();

        // Give /proc a moment to expose the entry.
        std::thread::sleep(Duration::from_millis(100));
        let pids = scan_family_pids(&[marker.to_string()]);
        assert!(pids.contains(&(child.id() as i32)));

        // Unrelated pattern must not match it.
        let other = scan_family_pids(&["no-such-sensor-family".to_string()]);
        assert!(!other.contains(&(child.id() as i32)));

        let _ = child.kill();
        let _ = child.wait();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn kill_family_clears_residuals() {
        use std::process::Command;

        let marker = "27.1828182";
        let mut child = Command::new("sleep").arg(marker).spawn().unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let patterns = vec![marker.to_string()];
        kill_family(&patterns);
        let shutdown = AtomicBool::new(false);
        // The child becomes a zombie of this test process until reaped, and
        // zombies keep no cmdline, so the table reads clear.
        assert!(wait_family_clear(&patterns, &shutdown));
        let _ = child.wait();
    }

    #[cfg(unix)]
    #[test]
    fn dead_daemon_restarts_once_with_validation() {
        let config = fast_config();
        // Emits one sample, then exits: dead by the time we check.
        let script = r#"echo '{"AccelFamilyRestart": {"values": [0.0, 0.0, 9.8]}}'"#;
        let sensor = managed(script, "AccelFamilyRestart", &config);
        sensor.start().unwrap();
        std::thread::sleep(Duration::from_millis(300));
        assert!(!sensor.is_alive());

        let shutdown = Arc::new(AtomicBool::new(false));
        let supervisor = Arc::new(Supervisor::new(
            config,
            vec![Arc::clone(&sensor)],
            shutdown,
        ));

        let produced_before = sensor.queue().produced();
        let outcome = supervisor.restart_sensor(&sensor);
        assert_eq!(outcome, RestartOutcome::Restarted);
        assert_eq!(sensor.restarts(), 1);
        // The fresh daemon advanced last_sample_instant; validation observed
        // it without consuming from the production queue.
        assert!(sensor.queue().produced() > produced_before);
        assert_eq!(sensor.queue().delivered(), 0);
        sensor.stop();
    }

    #[cfg(unix)]
    #[test]
    fn concurrent_restart_is_rejected() {
        let config = fast_config();
        let script = r#"echo '{"AccelFamilyGate": {"values": [0.0, 0.0, 9.8]}}'"#;
        let sensor = managed(script, "AccelFamilyGate", &config);
        sensor.start().unwrap();
        std::thread::sleep(Duration::from_millis(200));

        let shutdown = Arc::new(AtomicBool::new(false));
        let supervisor = Arc::new(Supervisor::new(
            config,
            vec![Arc::clone(&sensor)],
            shutdown,
        ));

        let gate = sensor.restart_gate.lock().unwrap();
        assert_eq!(
            supervisor.restart_sensor(&sensor),
            RestartOutcome::InFlight
        );
        drop(gate);
        sensor.stop();
    }

    #[cfg(unix)]
    #[test]
    fn health_loop_detects_silence_and_restarts() {
        let mut config = fast_config();
        config.accel_silence_secs = 1;
        config.health_check_secs = 1;
        // One sample, then the process exits: silent and dead within 1 s.
        let script = r#"echo '{"AccelFamilyLoop": {"values": [0.0, 0.0, 9.8]}}'"#;
        let sensor = managed(script, "AccelFamilyLoop", &config);
        sensor.start().unwrap();

        let shutdown = Arc::new(AtomicBool::new(false));
        let supervisor = Arc::new(Supervisor::new(
            config,
            vec![Arc::clone(&sensor)],
            Arc::clone(&shutdown),
        ));
        let runner = {
            let supervisor = Arc::clone(&supervisor);
            std::thread::spawn(move || supervisor.run())
        };

        // One health tick to notice the death, one restart cycle to recover.
        let deadline = Instant::now() + Duration::from_secs(15);
        while sensor.restarts() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(100));
        }
        shutdown.store(true, Ordering::SeqCst);
        runner.join().unwrap();

        // The scripted replacement also dies immediately, so a second cycle
        // may have been underway at shutdown; at least the first completed.
        assert!(sensor.restarts() >= 1, "supervisor loop never restarted");
        assert!(sensor.last_sample_instant().is_some());
        sensor.stop();
    }

    #[cfg(unix)]
    #[test]
    fn failed_validation_is_not_counted() {
        let mut config = fast_config();
        config.restart_validate_secs = 0.3;
        // Backoff long enough that the follow-up attempt below is
        // deterministically refused.
        config.restart_backoff_base_secs = 5.0;
        // Replacement process stays alive but never emits a sample.
        let script = "sleep 30";
        let sensor = managed(script, "AccelFamilySilent", &config);
        // Skip the initial start; the daemon was never alive, so the
        // protocol goes straight to respawn.
        let shutdown = Arc::new(AtomicBool::new(false));
        let supervisor = Arc::new(Supervisor::new(
            config,
            vec![Arc::clone(&sensor)],
            shutdown,
        ));

        let outcome = supervisor.restart_sensor(&sensor);
        assert_eq!(outcome, RestartOutcome::ValidationFailed);
        assert_eq!(sensor.restarts(), 0);
        // Backoff engaged: an immediate second attempt is refused.
        assert_eq!(
            supervisor.restart_sensor(&sensor),
            RestartOutcome::BackoffOrDead
        );
        sensor.stop();
    }
}
