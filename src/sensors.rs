use crate::config::EngineConfig;
use crate::error::SensorError;
use crate::queues::SampleQueue;
use crate::types::{AccelSample, GpsFix, GyroSample, Sample, SensorKind};
use log::{debug, info, warn};
use serde_json::Value;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Largest partial JSON object the stream reader will buffer before assuming
/// the stream is corrupt and resynchronising.
const MAX_OBJECT_BYTES: usize = 4096;

/// Minimum spacing between parse warnings per daemon.
const PARSE_WARN_INTERVAL: Duration = Duration::from_secs(5);

fn process_epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

fn wall_clock_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// How a sensor backend produces data.
#[derive(Clone, Debug)]
pub enum DaemonMode {
    /// Long-lived subprocess streaming concatenated JSON objects.
    Stream,
    /// One short-lived subprocess per poll, emitting a single JSON object.
    Poll { interval: Duration },
}

/// Command line and stream-matching rules for one sensor family.
#[derive(Clone, Debug)]
pub struct DaemonSpec {
    pub kind: SensorKind,
    pub command: String,
    pub args: Vec<String>,
    /// Substring identifying this sensor's entries in stream objects.
    pub match_key: String,
    pub mode: DaemonMode,
}

impl DaemonSpec {
    pub fn accel(config: &EngineConfig) -> Self {
        Self {
            kind: SensorKind::Accel,
            command: config.imu_command.clone(),
            args: vec![
                "-s".into(),
                config.accel_sensor_name.clone(),
                "-d".into(),
                config.imu_delay_ms.to_string(),
            ],
            match_key: config.accel_sensor_name.clone(),
            mode: DaemonMode::Stream,
        }
    }

    pub fn gyro(config: &EngineConfig) -> Self {
        Self {
            kind: SensorKind::Gyro,
            command: config.imu_command.clone(),
            args: vec![
                "-s".into(),
                config.gyro_sensor_name.clone(),
                "-d".into(),
                config.imu_delay_ms.to_string(),
            ],
            match_key: config.gyro_sensor_name.clone(),
            mode: DaemonMode::Stream,
        }
    }

    pub fn gps(config: &EngineConfig) -> Self {
        Self {
            kind: SensorKind::Gps,
            command: config.gps_command.clone(),
            args: vec!["-p".into(), "gps".into()],
            match_key: String::new(),
            mode: DaemonMode::Poll {
                interval: Duration::from_secs(1),
            },
        }
    }
}

/// Scoped handle for one sensor subprocess and its reader thread.
///
/// The daemon owns its child: `stop()` (or drop) terminates it, waits, and
/// releases every pipe. Pipes are created close-on-exec by `std::process`, so
/// restarts do not leak descriptors into later children.
pub struct SensorDaemon {
    spec: DaemonSpec,
    queue: Arc<SampleQueue<Sample>>,
    child: Mutex<Option<Child>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    stop_requested: Arc<AtomicBool>,
    /// Microseconds since process epoch of the last accepted sample; 0 = never.
    last_sample_us: Arc<AtomicU64>,
    parse_errors: Arc<AtomicU64>,
}

impl SensorDaemon {
    pub fn new(spec: DaemonSpec, queue: Arc<SampleQueue<Sample>>) -> Self {
        Self {
            spec,
            queue,
            child: Mutex::new(None),
            reader: Mutex::new(None),
            started: AtomicBool::new(false),
            stop_requested: Arc::new(AtomicBool::new(false)),
            last_sample_us: Arc::new(AtomicU64::new(0)),
            parse_errors: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn kind(&self) -> SensorKind {
        self.spec.kind
    }

    pub fn spec(&self) -> &DaemonSpec {
        &self.spec
    }

    /// Spawn the backend and attach the reader. Returns once output is flowing
    /// (or after a bounded wait when the backend warms up slowly).
    pub fn start(&self) -> Result<(), SensorError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SensorError::AlreadyRunning(self.spec.kind));
        }
        self.stop_requested.store(false, Ordering::SeqCst);

        match self.spec.mode.clone() {
            DaemonMode::Stream => self.start_stream(),
            DaemonMode::Poll { interval } => self.start_poll(interval),
        }
    }

    fn start_stream(&self) -> Result<(), SensorError> {
        let mut child = Command::new(&self.spec.command)
            .args(&self.spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| SensorError::from_spawn(&self.spec.command, e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SensorError::Died("no stdout pipe".into()))?;
        if let Some(stderr) = child.stderr.take() {
            let kind = self.spec.kind;
            std::thread::Builder::new()
                .name(format!("{kind}-stderr"))
                .spawn(move || drain_stderr(kind, stderr))
                .ok();
        }

        info!(
            "[{}] spawned `{}` pid {}",
            self.spec.kind.name(),
            self.spec.command,
            child.id()
        );
        *self.child.lock().unwrap_or_else(|p| p.into_inner()) = Some(child);

        let first_output = Arc::new(AtomicBool::new(false));
        let handle = {
            let queue = Arc::clone(&self.queue);
            let last_us = Arc::clone(&self.last_sample_us);
            let parse_errors = Arc::clone(&self.parse_errors);
            let stop = Arc::clone(&self.stop_requested);
            let first = Arc::clone(&first_output);
            let kind = self.spec.kind;
            let match_key = self.spec.match_key.clone();
            std::thread::Builder::new()
                .name(format!("{kind}-reader"))
                .spawn(move || {
                    stream_reader_loop(
                        kind,
                        &match_key,
                        stdout,
                        queue,
                        last_us,
                        parse_errors,
                        stop,
                        first,
                    )
                })
                .map_err(|e| SensorError::Spawn {
                    command: "reader thread".into(),
                    source: e,
                })?
        };
        *self.reader.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);

        // Wait a bounded moment for the first line so start() failures surface
        // immediately instead of on the first health tick.
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if first_output.load(Ordering::SeqCst) {
                break;
            }
            if !self.is_alive() {
                return Err(SensorError::Died(format!(
                    "`{}` exited before producing output",
                    self.spec.command
                )));
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        Ok(())
    }

    fn start_poll(&self, interval: Duration) -> Result<(), SensorError> {
        // Probe once so NotInstalled / Denied fail at start, not on a timer.
        let probe = Command::new(&self.spec.command)
            .arg("--help")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| SensorError::from_spawn(&self.spec.command, e));
        match probe {
            Ok(mut child) => {
                let _ = child.wait();
            }
            Err(e) if e.is_fatal_at_start() => return Err(e),
            Err(_) => {}
        }

        let handle = {
            let queue = Arc::clone(&self.queue);
            let last_us = Arc::clone(&self.last_sample_us);
            let parse_errors = Arc::clone(&self.parse_errors);
            let stop = Arc::clone(&self.stop_requested);
            let command = self.spec.command.clone();
            let args = self.spec.args.clone();
            let kind = self.spec.kind;
            std::thread::Builder::new()
                .name(format!("{kind}-poll"))
                .spawn(move || {
                    poll_reader_loop(
                        kind,
                        &command,
                        &args,
                        interval,
                        queue,
                        last_us,
                        parse_errors,
                        stop,
                    )
                })
                .map_err(|e| SensorError::Spawn {
                    command: "poll thread".into(),
                    source: e,
                })?
        };
        *self.reader.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        Ok(())
    }

    /// Non-blocking receive within `timeout` from this daemon's queue.
    pub fn try_recv(&self, timeout: Duration) -> Option<Sample> {
        self.queue.recv_timeout(timeout)
    }

    pub fn queue(&self) -> &Arc<SampleQueue<Sample>> {
        &self.queue
    }

    /// Instant of the most recently accepted sample, for silence detection.
    pub fn last_sample_instant(&self) -> Option<Instant> {
        let us = self.last_sample_us.load(Ordering::SeqCst);
        if us == 0 {
            None
        } else {
            Some(process_epoch() + Duration::from_micros(us))
        }
    }

    pub fn parse_error_count(&self) -> u64 {
        self.parse_errors.load(Ordering::Relaxed)
    }

    /// Whether the underlying producer is still running. For polling daemons
    /// this is the poll loop; for streaming daemons the child process.
    pub fn is_alive(&self) -> bool {
        if self.stop_requested.load(Ordering::SeqCst) {
            return false;
        }
        match self.spec.mode {
            DaemonMode::Poll { .. } => self
                .reader
                .lock()
                .ok()
                .map(|r| r.as_ref().map(|h| !h.is_finished()).unwrap_or(false))
                .unwrap_or(false),
            DaemonMode::Stream => {
                let mut guard = match self.child.lock() {
                    Ok(g) => g,
                    Err(p) => p.into_inner(),
                };
                match guard.as_mut() {
                    Some(child) => matches!(child.try_wait(), Ok(None)),
                    None => false,
                }
            }
        }
    }

    /// Graceful stop: SIGTERM, wait up to 2 s, SIGKILL, reap, release stdio.
    /// Safe to call more than once.
    pub fn stop(&self) {
        if self.stop_requested.swap(true, Ordering::SeqCst) {
            return;
        }

        let child = self.child.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(mut child) = child {
            terminate_child(self.spec.kind, &mut child);
            // Dropping the Child here closes any remaining pipe handles.
        }

        let reader = self.reader.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = reader {
            // The reader unblocks on pipe EOF (stream) or its next stop check
            // (poll, ≤ 250 ms), so this join is bounded.
            let _ = handle.join();
        }
        debug!("[{}] daemon stopped", self.spec.kind.name());
    }
}

impl Drop for SensorDaemon {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(unix)]
fn terminate_child(kind: SensorKind, child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = Pid::from_raw(child.id() as i32);
    let _ = kill(pid, Signal::SIGTERM);
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if let Ok(Some(status)) = child.try_wait() {
            debug!("[{}] child exited: {status}", kind.name());
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    warn!("[{}] child ignored SIGTERM, force killing", kind.name());
    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(not(unix))]
fn terminate_child(_kind: SensorKind, child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn drain_stderr(kind: SensorKind, stderr: impl Read) {
    let reader = BufReader::new(stderr);
    for line in reader.lines().map_while(Result::ok) {
        debug!("[{} stderr] {line}", kind.name());
    }
}

fn note_sample(last_us: &AtomicU64) {
    let us = process_epoch().elapsed().as_micros() as u64;
    last_us.store(us.max(1), Ordering::SeqCst);
}

struct ParseWarnLimiter {
    last_warn: Option<Instant>,
}

impl ParseWarnLimiter {
    fn new() -> Self {
        Self { last_warn: None }
    }

    /// Masked errors surface only as rate-limited warnings; nothing here
    /// propagates to the supervisor.
    fn warn(&mut self, kind: SensorKind, err: &SensorError) {
        let now = Instant::now();
        let due = self
            .last_warn
            .map(|t| now.duration_since(t) >= PARSE_WARN_INTERVAL)
            .unwrap_or(true);
        if due {
            warn!("[{}] {err}", kind.name());
            self.last_warn = Some(now);
        }
    }
}

/// Reassemble whole JSON objects from a possibly pretty-printed stream by
/// tracking brace depth, then convert them into samples. Parse failures are
/// counted and warned (rate-limited), never escalated.
#[allow(clippy::too_many_arguments)]
fn stream_reader_loop(
    kind: SensorKind,
    match_key: &str,
    stdout: impl Read,
    queue: Arc<SampleQueue<Sample>>,
    last_us: Arc<AtomicU64>,
    parse_errors: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
    first_output: Arc<AtomicBool>,
) {
    let reader = BufReader::new(stdout);
    let mut assembler = ObjectAssembler::new();
    let mut limiter = ParseWarnLimiter::new();
    let mut accepted = 0u64;

    for line in reader.lines() {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let line = match line {
            Ok(l) => l,
            Err(_) => break,
        };
        first_output.store(true, Ordering::SeqCst);

        for object in assembler.feed(&line) {
            match serde_json::from_str::<Value>(&object) {
                Ok(value) => {
                    for sample in imu_samples_from_object(&value, match_key, kind) {
                        note_sample(&last_us);
                        queue.push(sample);
                        accepted += 1;
                        if accepted % 1000 == 0 {
                            debug!("[{}] {accepted} samples accepted", kind.name());
                        }
                    }
                }
                Err(e) => {
                    parse_errors.fetch_add(1, Ordering::Relaxed);
                    limiter.warn(kind, &SensorError::Parse(e.to_string()));
                }
            }
        }
        if assembler.overflowed() {
            parse_errors.fetch_add(1, Ordering::Relaxed);
            limiter.warn(
                kind,
                &SensorError::Parse("partial object exceeded buffer, resynchronising".into()),
            );
        }
    }
    info!("[{}] stream ended after {accepted} samples", kind.name());
}

/// Poll a one-shot backend on a fixed interval (the GPS path on the target
/// platform has no streaming mode). The inter-poll sleep is chunked so stop
/// requests are observed within 250 ms.
#[allow(clippy::too_many_arguments)]
fn poll_reader_loop(
    kind: SensorKind,
    command: &str,
    args: &[String],
    interval: Duration,
    queue: Arc<SampleQueue<Sample>>,
    last_us: Arc<AtomicU64>,
    parse_errors: Arc<AtomicU64>,
    stop: Arc<AtomicBool>,
) {
    let mut limiter = ParseWarnLimiter::new();
    let mut fixes = 0u64;

    while !stop.load(Ordering::SeqCst) {
        let output = Command::new(command)
            .args(args)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output();

        match output {
            Ok(out) if out.status.success() => {
                match parse_gps_output(&String::from_utf8_lossy(&out.stdout)) {
                    Some(fix) => {
                        note_sample(&last_us);
                        queue.push(Sample::Gps(fix));
                        fixes += 1;
                        if fixes % 10 == 0 {
                            debug!("[{}] {fixes} fixes", kind.name());
                        }
                    }
                    None => {
                        parse_errors.fetch_add(1, Ordering::Relaxed);
                        limiter.warn(kind, &SensorError::Parse("unparseable fix output".into()));
                    }
                }
            }
            Ok(out) => {
                limiter.warn(
                    kind,
                    &SensorError::Died(format!("backend exited with {}", out.status)),
                );
            }
            Err(e) => {
                limiter.warn(kind, &SensorError::from_spawn(command, e));
            }
        }

        let mut slept = Duration::ZERO;
        while slept < interval && !stop.load(Ordering::SeqCst) {
            let step = Duration::from_millis(250).min(interval - slept);
            std::thread::sleep(step);
            slept += step;
        }
    }
    info!("[{}] poll loop ended after {fixes} fixes", kind.name());
}

/// Brace-depth accumulator for concatenated, possibly multi-line JSON objects.
struct ObjectAssembler {
    buffer: String,
    depth: i32,
    overflowed: bool,
}

impl ObjectAssembler {
    fn new() -> Self {
        Self {
            buffer: String::new(),
            depth: 0,
            overflowed: false,
        }
    }

    fn feed(&mut self, line: &str) -> Vec<String> {
        self.overflowed = false;
        let mut complete = Vec::new();
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return complete;
        }

        for ch in trimmed.chars() {
            match ch {
                '{' => self.depth += 1,
                '}' => self.depth -= 1,
                _ => {}
            }
        }

        if !self.buffer.is_empty() {
            self.buffer.push(' ');
        }
        self.buffer.push_str(trimmed);

        if self.buffer.len() > MAX_OBJECT_BYTES {
            self.buffer.clear();
            self.depth = 0;
            self.overflowed = true;
            return complete;
        }

        if self.depth <= 0 && self.buffer.contains('{') {
            complete.push(std::mem::take(&mut self.buffer));
            self.depth = 0;
        }
        complete
    }

    fn overflowed(&self) -> bool {
        self.overflowed
    }
}

/// Extract `{ "<sensor name>": { "values": [x, y, z] } }` entries matching
/// this daemon's sensor. Warmup `{}` objects are skipped silently.
fn imu_samples_from_object(value: &Value, match_key: &str, kind: SensorKind) -> Vec<Sample> {
    let mut samples = Vec::new();
    let Some(map) = value.as_object() else {
        return samples;
    };
    for (sensor_key, entry) in map {
        if !sensor_key.contains(match_key) {
            continue;
        }
        let Some(values) = entry.get("values").and_then(|v| v.as_array()) else {
            continue;
        };
        if values.len() < 3 {
            continue;
        }
        let (Some(x), Some(y), Some(z)) =
            (values[0].as_f64(), values[1].as_f64(), values[2].as_f64())
        else {
            continue;
        };
        let timestamp = wall_clock_secs();
        let sample = match kind {
            SensorKind::Accel => Sample::Accel(AccelSample { timestamp, x, y, z }),
            SensorKind::Gyro => Sample::Gyro(GyroSample { timestamp, x, y, z }),
            SensorKind::Gps => continue,
        };
        samples.push(sample);
    }
    samples
}

fn parse_gps_output(output: &str) -> Option<GpsFix> {
    let value: Value = serde_json::from_str(output.trim()).ok()?;
    let obj = value.as_object()?;
    let latitude = obj.get("latitude")?.as_f64()?;
    let longitude = obj.get("longitude")?.as_f64()?;
    let accuracy = obj.get("accuracy").and_then(|v| v.as_f64()).unwrap_or(5.0);
    let speed = obj.get("speed").and_then(|v| v.as_f64()).unwrap_or(0.0);
    let altitude = obj.get("altitude").and_then(|v| v.as_f64());
    let bearing = obj.get("bearing").and_then(|v| v.as_f64());
    Some(GpsFix {
        timestamp: wall_clock_secs(),
        latitude,
        longitude,
        altitude,
        accuracy,
        speed,
        bearing,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queues::OverflowPolicy;

    fn test_queue() -> Arc<SampleQueue<Sample>> {
        Arc::new(SampleQueue::new("test", 100, OverflowPolicy::DropNewest))
    }

    #[test]
    fn assembler_handles_single_line_objects() {
        let mut asm = ObjectAssembler::new();
        let objects = asm.feed(r#"{"Accelerometer": {"values": [0.1, 0.2, 9.8]}}"#);
        assert_eq!(objects.len(), 1);
    }

    #[test]
    fn assembler_reassembles_pretty_printed_objects() {
        let mut asm = ObjectAssembler::new();
        assert!(asm.feed("{").is_empty());
        assert!(asm.feed(r#"  "lsm6dso Accelerometer": {"#).is_empty());
        assert!(asm.feed(r#"    "values": [0.0, 0.1, 9.8]"#).is_empty());
        assert!(asm.feed("  }").is_empty());
        let objects = asm.feed("}");
        assert_eq!(objects.len(), 1);
        let value: Value = serde_json::from_str(&objects[0]).unwrap();
        assert!(value.is_object());
    }

    #[test]
    fn assembler_recovers_from_oversized_garbage() {
        let mut asm = ObjectAssembler::new();
        asm.feed("{");
        let filler = "x".repeat(MAX_OBJECT_BYTES);
        assert!(asm.feed(&filler).is_empty());
        assert!(asm.overflowed());
        // Next well-formed object parses cleanly.
        let objects = asm.feed(r#"{"Gyroscope": {"values": [0, 0, 0]}}"#);
        assert_eq!(objects.len(), 1);
    }

    #[test]
    fn imu_object_extraction_matches_sensor_family() {
        let value: Value = serde_json::from_str(
            r#"{"lsm6dso LSM6DSO Accelerometer Non-wakeup": {"values": [0.1, -0.2, 9.81]},
                "lsm6dso LSM6DSO Gyroscope Non-wakeup": {"values": [0.01, 0.0, -0.02]}}"#,
        )
        .unwrap();

        let accel = imu_samples_from_object(&value, "Accelerometer", SensorKind::Accel);
        assert_eq!(accel.len(), 1);
        assert!(matches!(&accel[0], Sample::Accel(a) if (a.z - 9.81).abs() < 1e-12));

        let gyro = imu_samples_from_object(&value, "Gyroscope", SensorKind::Gyro);
        assert_eq!(gyro.len(), 1);
    }

    #[test]
    fn warmup_objects_are_skipped() {
        let value: Value = serde_json::from_str("{}").unwrap();
        assert!(imu_samples_from_object(&value, "Accelerometer", SensorKind::Accel).is_empty());
    }

    #[test]
    fn gps_output_parses_with_and_without_bearing() {
        let full = r#"{"latitude": 32.2, "longitude": -110.9, "accuracy": 4.5,
                       "speed": 11.2, "bearing": 88.0, "altitude": 740.0}"#;
        let fix = parse_gps_output(full).unwrap();
        assert_eq!(fix.bearing, Some(88.0));
        assert_eq!(fix.altitude, Some(740.0));

        let sparse = r#"{"latitude": 32.2, "longitude": -110.9, "accuracy": 4.5, "speed": 0.0}"#;
        let fix = parse_gps_output(sparse).unwrap();
        assert!(fix.bearing.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn stream_daemon_delivers_and_stops_cleanly() {
        let queue = test_queue();
        let spec = DaemonSpec {
            kind: SensorKind::Accel,
            command: "sh".into(),
            args: vec![
                "-c".into(),
                r#"while true; do echo '{"Accelerometer": {"values": [0.0, 0.0, 9.8]}}'; sleep 0.05; done"#.into(),
            ],
            match_key: "Accelerometer".into(),
            mode: DaemonMode::Stream,
        };
        let daemon = SensorDaemon::new(spec, Arc::clone(&queue));
        daemon.start().unwrap();
        assert!(daemon.is_alive());

        let sample = daemon.try_recv(Duration::from_secs(2));
        assert!(matches!(sample, Some(Sample::Accel(_))));
        assert!(daemon.last_sample_instant().is_some());

        daemon.stop();
        assert!(!daemon.is_alive());
        // Idempotent: second stop is a no-op, no double-kill.
        daemon.stop();
    }

    #[cfg(unix)]
    #[test]
    fn start_reports_missing_backend() {
        let queue = test_queue();
        let spec = DaemonSpec {
            kind: SensorKind::Accel,
            command: "definitely-not-a-sensor-backend".into(),
            args: vec![],
            match_key: "Accelerometer".into(),
            mode: DaemonMode::Stream,
        };
        let daemon = SensorDaemon::new(spec, queue);
        let err = daemon.start().unwrap_err();
        assert!(matches!(err, SensorError::NotInstalled { .. }));
    }

    #[test]
    fn double_start_is_rejected() {
        let queue = test_queue();
        let spec = DaemonSpec {
            kind: SensorKind::Gps,
            command: "true".into(),
            args: vec![],
            match_key: String::new(),
            mode: DaemonMode::Poll {
                interval: Duration::from_secs(1),
            },
        };
        let daemon = SensorDaemon::new(spec, queue);
        daemon.start().unwrap();
        assert!(matches!(
            daemon.start(),
            Err(SensorError::AlreadyRunning(SensorKind::Gps))
        ));
        daemon.stop();
    }
}
