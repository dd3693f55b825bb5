use std::io;
use std::net::SocketAddr;

/// Rejected configuration values, reported before any thread or socket exists.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} must be a power of two, got {value}")]
    NotPowerOfTwo { name: &'static str, value: usize },
    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },
    #[error("{name} = {value} is below the minimum of {min}")]
    TooSmall {
        name: &'static str,
        value: usize,
        min: usize,
    },
    #[error("{name} = {value} exceeds the maximum of {max}")]
    TooLarge {
        name: &'static str,
        value: usize,
        max: usize,
    },
}

/// Failures that abort server startup.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("worker pool {pool}: failed to spawn worker {worker}: {source}")]
    Spawn {
        pool: String,
        worker: usize,
        #[source]
        source: io::Error,
    },
    #[error("worker pool {pool}: worker {worker} setup failed: {source}")]
    WorkerSetup {
        pool: String,
        worker: usize,
        #[source]
        source: io::Error,
    },
    #[error("worker pool {pool} is already running")]
    AlreadyStarted { pool: String },
}

/// Failure reported by a storage engine while applying one measurement.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("table {table} rejected the write: {reason}")]
    Rejected { table: String, reason: String },
    #[error("storage I/O failure: {0}")]
    Io(#[from] io::Error),
}
