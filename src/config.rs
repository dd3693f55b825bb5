//! Server sizing and operational configuration.
//!
//! Defaults live in the `DEFAULT_*` constants; `LineTcpConfig::validate` rejects values the
//! rings and buffers cannot work with before anything is spawned.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use crate::error::ConfigError;

/// Line protocol over TCP conventionally listens here.
pub const DEFAULT_PORT: u16 = 9009;

/// Per-connection receive buffer size (bytes). Also the longest accepted line.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 32 * 1024;

/// Idle contexts materialized per network thread at setup.
pub const DEFAULT_CONNECTION_POOL_CAPACITY: usize = 64;

/// Max concurrent connections per dispatcher. Slab keys travel in the low 32 bits of user_data.
pub const DEFAULT_MAX_CONNECTIONS: usize = 4096;

/// Per-writer ring size (disruptor capacity).
pub const DEFAULT_WRITER_QUEUE_CAPACITY: usize = 16 * 1024;

/// Multi-producer disruptor rings refuse fewer slots than this.
pub const MIN_WRITER_QUEUE_CAPACITY: usize = 64;

pub const DEFAULT_RING_ENTRIES: u32 = 4096;
pub const DEFAULT_LISTEN_BACKLOG: u32 = 1024;
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(10);
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

const _: () = assert!(
    DEFAULT_MAX_CONNECTIONS <= u32::MAX as usize,
    "connection tokens are encoded as u32"
);
const _: () = assert!(
    DEFAULT_WRITER_QUEUE_CAPACITY.is_power_of_two(),
    "disruptor capacity must be a power of two"
);
const _: () = assert!(DEFAULT_WRITER_QUEUE_CAPACITY >= MIN_WRITER_QUEUE_CAPACITY);

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub worker_count: usize,
    /// Idle iterations spent spinning before the worker starts yielding.
    pub yield_threshold: u64,
    /// Idle iterations before the worker starts sleeping between passes.
    pub sleep_threshold: u64,
    pub sleep_timeout: Duration,
}

impl WorkerPoolConfig {
    pub fn with_workers(worker_count: usize) -> Self {
        Self {
            worker_count,
            ..Self::default()
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            yield_threshold: 10,
            sleep_threshold: 1_000,
            sleep_timeout: Duration::from_millis(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub bind_addr: SocketAddr,
    pub listen_backlog: u32,
    pub ring_entries: u32,
    pub recv_buffer_size: usize,
    pub max_connections: usize,
    /// Upper bound on a single readiness wait.
    pub poll_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            ring_entries: DEFAULT_RING_ENTRIES,
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub queue_capacity: usize,
    pub drain_timeout: Duration,
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        power_of_two("scheduler.queue_capacity", self.queue_capacity)?;
        if self.queue_capacity < MIN_WRITER_QUEUE_CAPACITY {
            return Err(ConfigError::TooSmall {
                name: "scheduler.queue_capacity",
                value: self.queue_capacity,
                min: MIN_WRITER_QUEUE_CAPACITY,
            });
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_WRITER_QUEUE_CAPACITY,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LineTcpConfig {
    pub enabled: bool,
    pub connection_pool_initial_capacity: usize,
    pub dispatcher: DispatcherConfig,
    pub scheduler: SchedulerConfig,
    pub net_worker_pool: WorkerPoolConfig,
    /// A worker count of zero runs writer jobs on the network workers.
    pub writer_worker_pool: WorkerPoolConfig,
}

impl Default for LineTcpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            connection_pool_initial_capacity: DEFAULT_CONNECTION_POOL_CAPACITY,
            dispatcher: DispatcherConfig::default(),
            scheduler: SchedulerConfig::default(),
            net_worker_pool: WorkerPoolConfig::default(),
            writer_worker_pool: WorkerPoolConfig::default(),
        }
    }
}

impl LineTcpConfig {
    pub fn shares_writer_pool(&self) -> bool {
        self.writer_worker_pool.worker_count == 0
    }

    /// Number of writer queues; one per writer thread, or one per network thread when shared.
    pub fn writer_count(&self) -> usize {
        if self.shares_writer_pool() {
            self.net_worker_pool.worker_count
        } else {
            self.writer_worker_pool.worker_count
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("net_worker_pool.worker_count", self.net_worker_pool.worker_count)?;
        non_zero("dispatcher.recv_buffer_size", self.dispatcher.recv_buffer_size)?;
        non_zero("dispatcher.max_connections", self.dispatcher.max_connections)?;
        self.scheduler.validate()?;
        power_of_two("dispatcher.ring_entries", self.dispatcher.ring_entries as usize)?;
        if self.dispatcher.max_connections > u32::MAX as usize {
            return Err(ConfigError::TooLarge {
                name: "dispatcher.max_connections",
                value: self.dispatcher.max_connections,
                max: u32::MAX as usize,
            });
        }
        Ok(())
    }
}

fn non_zero(name: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Zero { name });
    }
    Ok(())
}

fn power_of_two(name: &'static str, value: usize) -> Result<(), ConfigError> {
    if !value.is_power_of_two() {
        return Err(ConfigError::NotPowerOfTwo { name, value });
    }
    Ok(())
}
