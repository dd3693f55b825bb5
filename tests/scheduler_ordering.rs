//! Integration test: many publishers, several writers, per-table ordering and routing.

mod common;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use linewire::config::SchedulerConfig;
use linewire::error::StorageError;
use linewire::ring_types::{FieldValue, Measurement};
use linewire::scheduler::{MeasurementScheduler, PublishOutcome, route};
use linewire::storage::StorageEngine;

use common::seq_of;

/// Records which writer thread applied each row.
#[derive(Default)]
struct ThreadRecorder {
    rows: Mutex<Vec<(String, String, i64, String)>>,
}

impl StorageEngine for ThreadRecorder {
    fn apply(&self, measurement: &Measurement) -> Result<(), StorageError> {
        let thread = thread::current().name().unwrap_or_default().to_string();
        let conn = measurement.tag("conn").unwrap_or_default().to_string();
        let seq = seq_of(measurement).unwrap_or(-1);
        self.rows
            .lock()
            .unwrap()
            .push((measurement.table.clone(), conn, seq, thread));
        Ok(())
    }
}

/// Refuses every row of one table.
struct RejectTable(&'static str);

impl StorageEngine for RejectTable {
    fn apply(&self, measurement: &Measurement) -> Result<(), StorageError> {
        if measurement.table == self.0 {
            return Err(StorageError::Rejected {
                table: measurement.table.clone(),
                reason: "read-only".into(),
            });
        }
        Ok(())
    }
}

fn measurement(table: &str, conn: usize, seq: i64) -> Measurement {
    Measurement {
        table: table.into(),
        tags: vec![("conn".into(), conn.to_string())],
        fields: vec![("seq".into(), FieldValue::Integer(seq))],
        timestamp: None,
    }
}

#[test]
fn concurrent_publishers_keep_per_table_order_and_routing() {
    const PRODUCERS: usize = 4;
    const WRITERS: usize = 3;
    const PER_PRODUCER: i64 = 2_000;
    const TABLES: [&str; 5] = ["cpu", "mem", "disk", "net", "gpu"];

    let storage = Arc::new(ThreadRecorder::default());
    let config = SchedulerConfig {
        queue_capacity: 64,
        drain_timeout: Duration::from_secs(10),
    };
    let (mut scheduler, writers) =
        MeasurementScheduler::new(&config, WRITERS, storage.clone()).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let writer_handles: Vec<_> = writers
        .into_iter()
        .map(|mut writer| {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name(format!("writer-{}", writer.writer_id()))
                .spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        if writer.process_one_poll_cycle() == 0 {
                            thread::yield_now();
                        }
                    }
                })
                .unwrap()
        })
        .collect();

    let producer_handles: Vec<_> = (0..PRODUCERS)
        .map(|conn| {
            let mut publisher = scheduler.publisher().with_worker_id(conn);
            thread::spawn(move || {
                for seq in 0..PER_PRODUCER {
                    let table = TABLES[(seq as usize + conn) % TABLES.len()];
                    let mut pending = Some(measurement(table, conn, seq));
                    loop {
                        match publisher.try_publish(conn as u64, &mut pending) {
                            PublishOutcome::Accepted => break,
                            PublishOutcome::Full => thread::yield_now(),
                            PublishOutcome::Closed => panic!("closed while publishing"),
                        }
                    }
                }
            })
        })
        .collect();

    for handle in producer_handles {
        handle.join().unwrap();
    }
    let stats = scheduler.close();
    stop.store(true, Ordering::Release);
    for handle in writer_handles {
        handle.join().unwrap();
    }

    let total = PRODUCERS as u64 * PER_PRODUCER as u64;
    assert_eq!(stats.accepted, total);
    assert_eq!(stats.applied, total);
    assert_eq!(stats.pending(), 0);

    let rows = storage.rows.lock().unwrap();
    assert_eq!(rows.len() as u64, total);

    let mut threads_per_table: HashMap<&str, HashSet<&str>> = HashMap::new();
    let mut last_seq: HashMap<(&str, &str), i64> = HashMap::new();
    for (table, conn, seq, thread) in rows.iter() {
        threads_per_table
            .entry(table.as_str())
            .or_default()
            .insert(thread.as_str());
        let last = last_seq.entry((table.as_str(), conn.as_str())).or_insert(-1);
        assert!(*seq > *last, "{table}/{conn}: {seq} applied after {last}");
        *last = *seq;
    }
    for table in TABLES {
        let threads = &threads_per_table[table];
        assert_eq!(threads.len(), 1, "{table} applied by {threads:?}");
        let expected = format!("writer-{}", route(table, WRITERS));
        assert!(threads.contains(expected.as_str()));
    }
}

#[test]
fn storage_failures_are_counted_not_retried() {
    let storage = Arc::new(RejectTable("audit"));
    let config = SchedulerConfig {
        queue_capacity: 64,
        drain_timeout: Duration::from_secs(1),
    };
    let (scheduler, mut writers) = MeasurementScheduler::new(&config, 1, storage).unwrap();
    let mut publisher = scheduler.publisher();

    for (table, seq) in [("audit", 0), ("cpu", 1), ("audit", 2), ("cpu", 3)] {
        let mut pending = Some(measurement(table, 0, seq));
        assert_eq!(publisher.try_publish(0, &mut pending), PublishOutcome::Accepted);
    }
    assert_eq!(writers[0].process_one_poll_cycle(), 4);
    assert_eq!(writers[0].process_one_poll_cycle(), 0);

    let stats = scheduler.stats();
    assert_eq!(stats.applied, 2);
    assert_eq!(stats.failed, 2);
    assert_eq!(stats.pending(), 0);
}
