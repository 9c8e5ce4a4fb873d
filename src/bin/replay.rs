//! Re-run a recorded session through the fusion pipeline offline and report
//! comparison metrics, for tuning noise parameters against real drives.

use anyhow::Result;
use clap::Parser;
use drive_telemetry_rs::config::EngineConfig;
use drive_telemetry_rs::fusion::{FusionEvent, FusionPipeline};
use drive_telemetry_rs::persistence::load_session;
use drive_telemetry_rs::types::Sample;
use serde_json::json;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "replay")]
struct Args {
    /// Path to a session_*.json[.gz] or current_session.json[.gz] file
    #[arg(long)]
    log: PathBuf,

    /// Velocity process noise override
    #[arg(long)]
    q_vel: Option<f64>,

    /// GPS velocity measurement std override [m/s]
    #[arg(long)]
    gps_vel_std: Option<f64>,

    /// Replay without gyroscope samples
    #[arg(long)]
    no_gyro: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let session = load_session(&args.log)?;

    let mut config = EngineConfig {
        enable_gyro: !args.no_gyro,
        ..EngineConfig::default()
    };
    if let Some(q_vel) = args.q_vel {
        config.q_vel = q_vel;
    }
    if let Some(gps_vel_std) = args.gps_vel_std {
        config.gps_vel_std = gps_vel_std;
    }

    // Merge the recorded streams back into timestamp order.
    let mut samples: Vec<Sample> = Vec::with_capacity(
        session.accel_samples.len() + session.gyro_samples.len() + session.gps_samples.len(),
    );
    samples.extend(session.accel_samples.iter().cloned().map(Sample::Accel));
    if !args.no_gyro {
        samples.extend(session.gyro_samples.iter().cloned().map(Sample::Gyro));
    }
    samples.extend(session.gps_samples.iter().cloned().map(Sample::Gps));
    samples.sort_by(|a, b| {
        a.timestamp()
            .partial_cmp(&b.timestamp())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut pipeline = FusionPipeline::new(config);
    let mut incidents = 0usize;
    let mut last_ts = session.start_time;
    for sample in &samples {
        last_ts = sample.timestamp();
        for event in pipeline.handle(sample) {
            if matches!(event, FusionEvent::IncidentDetected(_)) {
                incidents += 1;
            }
        }
    }
    incidents += pipeline.flush_incidents(last_ts).len();

    let snap = pipeline.snapshot();
    let metrics = pipeline.metrics.export();
    let report = json!({
        "log": args.log.display().to_string(),
        "samples": samples.len(),
        "replayed_incidents": incidents,
        "recorded_incidents": session.incidents.len(),
        "ekf_distance_m": metrics.ekf_distance_m,
        "comp_distance_m": metrics.comp_distance_m,
        "gps_distance_m": metrics.gps_distance_m,
        "ekf_distance_error_pct": metrics.ekf_distance_error_pct,
        "bias_magnitude": metrics.bias_magnitude,
        "bias_convergence_seconds": metrics.bias_convergence_seconds,
        "quat_norm_min": metrics.quat_norm_min,
        "quat_norm_max": metrics.quat_norm_max,
        "heading_error_deg_mean": metrics.heading_error_deg_mean,
        "final_velocity": (snap.ekf.velocity.0.powi(2) + snap.ekf.velocity.1.powi(2)).sqrt(),
        "dropped_dt": metrics.dropped_dt,
        "numerical_resets": metrics.numerical_resets,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
