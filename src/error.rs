use thiserror::Error;

/// Sensor-layer failures. Only `NotInstalled` and `Denied` are fatal, and only
/// at session start; everything else is masked or recovered by the supervisor.
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor backend `{command}` is not installed")]
    NotInstalled { command: String },

    #[error("permission denied spawning sensor backend `{command}`")]
    Denied { command: String },

    #[error("sensor daemon for {0} is already running")]
    AlreadyRunning(crate::types::SensorKind),

    #[error("sensor process died: {0}")]
    Died(String),

    /// Masked at the reader: the sample is dropped and a rate-limited
    /// warning carries this error's message.
    #[error("unparseable sensor output: {0}")]
    Parse(String),

    /// Masked at the queue: the shed sample is counted, never surfaced to
    /// producers.
    #[error("queue `{queue}` full ({dropped} samples dropped)")]
    QueueFull { queue: &'static str, dropped: u64 },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

impl SensorError {
    /// Classify a spawn error into the startup taxonomy.
    pub fn from_spawn(command: &str, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => SensorError::NotInstalled {
                command: command.to_string(),
            },
            std::io::ErrorKind::PermissionDenied => SensorError::Denied {
                command: command.to_string(),
            },
            _ => SensorError::Spawn {
                command: command.to_string(),
                source: err,
            },
        }
    }

    /// Fatal errors terminate the session at startup with a non-zero exit.
    pub fn is_fatal_at_start(&self) -> bool {
        matches!(
            self,
            SensorError::NotInstalled { .. } | SensorError::Denied { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("session io: {0}")]
    Io(#[from] std::io::Error),

    #[error("session encode: {0}")]
    Encode(#[from] serde_json::Error),
}
