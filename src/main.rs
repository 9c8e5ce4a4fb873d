use anyhow::Result;
use clap::Parser;
use drive_telemetry_rs::{EngineConfig, Orchestrator, SessionOptions};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "drive_telemetry")]
#[command(about = "Phone-sensor drive telemetry: EKF fusion, incident detection, session recording", long_about = None)]
struct Args {
    /// Session duration in minutes; omit to run until a signal
    #[arg(value_name = "MINUTES")]
    duration_minutes: Option<f64>,

    /// Enable gyroscope fusion
    #[arg(long, visible_alias = "gyro")]
    enable_gyro: bool,

    /// Accepted for launcher compatibility; magnetometer fusion is not part
    /// of this build
    #[arg(long)]
    enable_mag: bool,

    /// Accepted for launcher compatibility; barometer fusion is not part of
    /// this build
    #[arg(long)]
    enable_baro: bool,

    /// Disable the side-by-side complementary reference filter
    #[arg(long)]
    no_complementary: bool,

    /// Session output directory
    #[arg(long, default_value = "telemetry_sessions")]
    output_dir: PathBuf,

    /// Write session files as plain JSON instead of gzip
    #[arg(long)]
    no_gzip: bool,

    /// Autosave interval in seconds
    #[arg(long, default_value = "15")]
    autosave_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;

    if args.enable_mag {
        warn!("--enable-mag accepted but magnetometer fusion is not built in");
    }
    if args.enable_baro {
        warn!("--enable-baro accepted but barometer fusion is not built in");
    }

    let config = EngineConfig {
        enable_gyro: args.enable_gyro,
        enable_complementary: !args.no_complementary,
        gzip_sessions: !args.no_gzip,
        autosave_secs: args.autosave_secs,
        ..EngineConfig::default()
    };

    let options = SessionOptions {
        duration: args
            .duration_minutes
            .filter(|m| *m > 0.0)
            .map(|m| Duration::from_secs_f64(m * 60.0)),
        output_dir: args.output_dir,
    };

    info!(
        "drive_telemetry starting: duration {}, gyro {}, output {}",
        options
            .duration
            .map(|d| format!("{:.1} min", d.as_secs_f64() / 60.0))
            .unwrap_or_else(|| "continuous".into()),
        config.enable_gyro,
        options.output_dir.display()
    );

    let summary = Orchestrator::new(config, options).run(shutdown)?;

    println!("\n=== Session {} ===", summary.session_id);
    println!("Elapsed: {:.1} s", summary.elapsed.as_secs_f64());
    println!(
        "Samples: {} accel, {} gyro, {} GPS fixes",
        summary.accel_samples, summary.gyro_samples, summary.gps_fixes
    );
    println!("Incidents: {}", summary.incidents);
    println!(
        "Autosaves: {} (restarts: {})",
        summary.autosaves, summary.restarts
    );
    println!("Peak memory: {:.1} MB", summary.peak_memory_mb);
    if let Some(path) = &summary.final_session_path {
        println!("Session file: {}", path.display());
    }

    Ok(())
}
