//! On-device motion telemetry engine: fuses phone accelerometer, gyroscope,
//! and GPS streams into a 13-state EKF position/attitude/bias estimate,
//! flags driving incidents, and persists bounded-memory session files.
//!
//! Layering, leaves first: [`types`] and [`queues`] carry data between
//! [`sensors`] (subprocess daemons) and [`fusion`] (the pure computation
//! pipeline over [`filters`], [`calibration`], [`incident`], [`metrics`]).
//! [`supervisor`] keeps the daemons alive; [`persistence`] and
//! [`live_status`] own the disk formats; [`orchestrator`] wires the threads.

pub mod calibration;
pub mod config;
pub mod error;
pub mod filters;
pub mod fusion;
pub mod health_monitor;
pub mod incident;
pub mod live_status;
pub mod metrics;
pub mod orchestrator;
pub mod persistence;
pub mod physics;
pub mod queues;
pub mod sensors;
pub mod supervisor;
pub mod types;

pub use config::EngineConfig;
pub use orchestrator::{Orchestrator, SessionOptions, SessionSummary};
