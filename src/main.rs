use std::net::{IpAddr, SocketAddr};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use linewire::config::{
    DEFAULT_CONNECTION_POOL_CAPACITY, DEFAULT_MAX_CONNECTIONS, DEFAULT_PORT,
    DEFAULT_RECV_BUFFER_SIZE, DEFAULT_WRITER_QUEUE_CAPACITY, LineTcpConfig, WorkerPoolConfig,
};
use linewire::metrics;
use linewire::server::LineTcpServer;
use linewire::storage::CountingStorage;

#[derive(Parser)]
#[command(about = "io_uring line protocol TCP receiver")]
struct Args {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: IpAddr,

    /// Port to listen on
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Network worker threads
    #[arg(long, default_value_t = 1)]
    net_workers: usize,

    /// Writer threads; 0 runs writers on the network threads
    #[arg(long, default_value_t = 1)]
    writers: usize,

    /// Per-connection receive buffer, also the longest accepted line (bytes)
    #[arg(long, default_value_t = DEFAULT_RECV_BUFFER_SIZE)]
    recv_buffer: usize,

    /// Per-writer queue depth (power of two)
    #[arg(long, default_value_t = DEFAULT_WRITER_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Idle contexts created per network thread at startup
    #[arg(long, default_value_t = DEFAULT_CONNECTION_POOL_CAPACITY)]
    pool_capacity: usize,

    /// Connection limit per network thread
    #[arg(long, default_value_t = DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,

    /// Seconds to wait for writers to drain on shutdown
    #[arg(long, default_value_t = 30)]
    drain_timeout: u64,
}

impl Args {
    fn into_config(self) -> LineTcpConfig {
        let mut config = LineTcpConfig::default();
        config.dispatcher.bind_addr = SocketAddr::new(self.host, self.port);
        config.dispatcher.recv_buffer_size = self.recv_buffer;
        config.dispatcher.max_connections = self.max_connections;
        config.scheduler.queue_capacity = self.queue_capacity;
        config.scheduler.drain_timeout = Duration::from_secs(self.drain_timeout);
        config.connection_pool_initial_capacity = self.pool_capacity;
        config.net_worker_pool = WorkerPoolConfig::with_workers(self.net_workers);
        config.writer_worker_pool = WorkerPoolConfig::with_workers(self.writers);
        config
    }
}

/// Block SIGINT/SIGTERM so they can be collected with `sigwait`.
/// Must run before any worker thread is spawned so the mask is inherited.
fn block_shutdown_signals() -> libc::sigset_t {
    // SAFETY: the set is initialized by sigemptyset before use; masks only this process.
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGINT);
        libc::sigaddset(&mut set, libc::SIGTERM);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
        set
    }
}

fn wait_for_signal(set: &libc::sigset_t) -> libc::c_int {
    let mut signal: libc::c_int = 0;
    // SAFETY: `set` was built by block_shutdown_signals and `signal` is a valid out pointer.
    unsafe {
        libc::sigwait(set, &mut signal);
    }
    signal
}

fn main() -> ExitCode {
    let config = Args::parse().into_config();
    let signals = block_shutdown_signals();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_thread_names(true)
        .init();
    metrics::spawn_reporter();

    let storage = Arc::new(CountingStorage::new());

    let mut server = match LineTcpServer::start(&config, storage.clone()) {
        Ok(Some(server)) => server,
        Ok(None) => return ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "failed to start");
            return ExitCode::FAILURE;
        }
    };
    info!(addr = %server.local_addr(), "linewire: ready");

    let signal = wait_for_signal(&signals);
    info!(signal, "shutdown requested");
    server.close();
    info!(rows = storage.row_count(), "linewire: stopped");
    ExitCode::SUCCESS
}
