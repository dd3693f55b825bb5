#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use linewire::config::{DispatcherConfig, LineTcpConfig, SchedulerConfig, WorkerPoolConfig};
use linewire::ring_types::{FieldValue, Measurement};
use linewire::scheduler::{MeasurementScheduler, WriterJob};
use linewire::storage::MemoryStorage;

/// Server tests skip themselves where the kernel or sandbox refuses io_uring.
pub fn io_uring_available() -> bool {
    match io_uring::IoUring::new(8) {
        Ok(_) => true,
        Err(e) => {
            eprintln!("skipping: io_uring unavailable ({e})");
            false
        }
    }
}

/// Poll `condition` until it holds or `timeout` passes. Returns the final value.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

/// `table,conn=<connection> seq=<seq>i`
pub fn seq_line(table: &str, connection: usize, seq: usize) -> String {
    format!("{table},conn={connection} seq={seq}i\n")
}

pub fn seq_of(measurement: &Measurement) -> Option<i64> {
    match measurement.field("seq") {
        Some(FieldValue::Integer(v)) => Some(*v),
        _ => None,
    }
}

/// Sequence numbers of `table` rows sent by `connection`, in apply order.
pub fn seqs_for(storage: &MemoryStorage, table: &str, connection: usize) -> Vec<i64> {
    let conn = connection.to_string();
    storage
        .rows(table)
        .iter()
        .filter(|m| m.tag("conn") == Some(conn.as_str()))
        .filter_map(seq_of)
        .collect()
}

/// Loopback config with small rings, suitable for tests.
pub fn local_config(net_workers: usize, writers: usize) -> LineTcpConfig {
    LineTcpConfig {
        connection_pool_initial_capacity: 4,
        dispatcher: DispatcherConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ring_entries: 256,
            recv_buffer_size: 4096,
            poll_timeout: Duration::from_millis(5),
            ..DispatcherConfig::default()
        },
        scheduler: SchedulerConfig {
            queue_capacity: 1024,
            drain_timeout: Duration::from_secs(5),
        },
        net_worker_pool: WorkerPoolConfig::with_workers(net_workers),
        writer_worker_pool: WorkerPoolConfig::with_workers(writers),
        ..LineTcpConfig::default()
    }
}

pub fn scheduler(
    queue_capacity: usize,
    writers: usize,
) -> (MeasurementScheduler, Vec<WriterJob>, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    let config = SchedulerConfig {
        queue_capacity,
        drain_timeout: Duration::from_secs(5),
    };
    let (scheduler, jobs) = MeasurementScheduler::new(&config, writers, storage.clone()).unwrap();
    (scheduler, jobs, storage)
}
