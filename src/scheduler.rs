//! Measurement scheduler: network threads publish, writer threads apply.
//!
//! Each writer owns one multi-producer disruptor ring and its single event poller. A table is
//! routed to a fixed writer by hash, so every measurement for that table passes through one ring
//! and is applied in claim (acceptance) order regardless of which network thread published it.
//! A full ring is backpressure: the publisher keeps the measurement and the caller retries.
//! Once a close gives up waiting, writers stop applying and count what is left as discarded.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use disruptor::{
    BusySpin, EventPoller, MultiProducer, MultiProducerBarrier, Polling, Producer,
    RingBufferFull, SingleConsumerBarrier, build_multi_producer,
};
use tracing::{info, warn};

use crate::config::SchedulerConfig;
use crate::error::ConfigError;
use crate::metrics;
use crate::ring_types::{Measurement, MeasurementEvent};
use crate::storage::StorageEngine;
use crate::worker_pool::Job;

// Concrete types for one writer's ring.
pub type WriterProducer = MultiProducer<MeasurementEvent, SingleConsumerBarrier>;
pub type WriterPoller = EventPoller<MeasurementEvent, MultiProducerBarrier>;

#[derive(Default)]
struct SchedulerState {
    closed: AtomicBool,
    /// Publishers between their closed check and the end of their publish.
    in_flight: AtomicUsize,
    draining: AtomicBool,
    /// Set when the drain timed out: writers skip instead of applying.
    discarding: AtomicBool,
    drained_writers: AtomicUsize,
    accepted: AtomicU64,
    rejected: AtomicU64,
    applied: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub accepted: u64,
    /// Publish attempts refused because a ring was full.
    pub rejected: u64,
    pub applied: u64,
    /// Accepted measurements the storage engine refused.
    pub failed: u64,
    /// Accepted measurements dropped after a timed-out drain.
    pub discarded: u64,
}

impl SchedulerStats {
    /// Accepted but not yet applied, failed or discarded.
    pub fn pending(&self) -> u64 {
        self.accepted
            .saturating_sub(self.applied + self.failed + self.discarded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Accepted,
    /// The target writer's ring is full; the measurement stays with the caller.
    Full,
    /// The scheduler is shutting down and takes no new work.
    Closed,
}

/// Writer index for `table`.
pub fn route(table: &str, writer_count: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    table.hash(&mut hasher);
    (hasher.finish() % writer_count as u64) as usize
}

/// Producer half, one per network thread. Clones share the rings.
#[derive(Clone)]
pub struct MeasurementPublisher {
    worker_id: u16,
    producers: Vec<WriterProducer>,
    state: Arc<SchedulerState>,
}

impl MeasurementPublisher {
    pub fn with_worker_id(mut self, worker_id: usize) -> Self {
        self.worker_id = worker_id as u16;
        self
    }

    /// Try to hand `pending` to its writer. On `Accepted` the slot is emptied; on `Full` or
    /// `Closed` the measurement is left in place. An empty slot counts as accepted.
    pub fn try_publish(
        &mut self,
        connection_id: u64,
        pending: &mut Option<Measurement>,
    ) -> PublishOutcome {
        let Some(measurement) = pending.as_ref() else {
            return PublishOutcome::Accepted;
        };
        let writer = route(&measurement.table, self.producers.len());

        self.state.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.state.closed.load(Ordering::SeqCst) {
            self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
            return PublishOutcome::Closed;
        }
        let worker_id = self.worker_id;
        let result = self.producers[writer].try_publish(|slot| {
            slot.worker_id = worker_id;
            slot.connection_id = connection_id;
            if let Some(measurement) = pending.take() {
                slot.measurement = measurement;
            }
        });
        self.state.in_flight.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(_) => {
                self.state.accepted.fetch_add(1, Ordering::Relaxed);
                metrics::inc_measurements_published();
                PublishOutcome::Accepted
            }
            Err(RingBufferFull) => {
                self.state.rejected.fetch_add(1, Ordering::Relaxed);
                metrics::inc_scheduler_full();
                PublishOutcome::Full
            }
        }
    }
}

pub struct MeasurementScheduler {
    producers: Vec<WriterProducer>,
    state: Arc<SchedulerState>,
    drain_timeout: Duration,
}

impl MeasurementScheduler {
    /// Build one ring per writer. The returned jobs must each be driven by some worker thread.
    pub fn new(
        config: &SchedulerConfig,
        writer_count: usize,
        storage: Arc<dyn StorageEngine>,
    ) -> Result<(Self, Vec<WriterJob>), ConfigError> {
        config.validate()?;
        if writer_count == 0 {
            return Err(ConfigError::Zero {
                name: "writer_count",
            });
        }
        let state = Arc::new(SchedulerState::default());
        let mut producers = Vec::with_capacity(writer_count);
        let mut writers = Vec::with_capacity(writer_count);

        for writer_id in 0..writer_count {
            let builder = build_multi_producer(
                config.queue_capacity,
                MeasurementEvent::factory,
                BusySpin,
            );
            let (poller, builder) = builder.event_poller();
            producers.push(builder.build());
            writers.push(WriterJob {
                writer_id,
                poller,
                storage: Arc::clone(&storage),
                state: Arc::clone(&state),
                drained: false,
            });
        }

        let scheduler = Self {
            producers,
            state,
            drain_timeout: config.drain_timeout,
        };
        Ok((scheduler, writers))
    }

    pub fn publisher(&self) -> MeasurementPublisher {
        MeasurementPublisher {
            worker_id: 0,
            producers: self.producers.clone(),
            state: Arc::clone(&self.state),
        }
    }

    pub fn writer_count(&self) -> usize {
        self.producers.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            accepted: self.state.accepted.load(Ordering::Acquire),
            rejected: self.state.rejected.load(Ordering::Acquire),
            applied: self.state.applied.load(Ordering::Acquire),
            failed: self.state.failed.load(Ordering::Acquire),
            discarded: self.state.discarded.load(Ordering::Acquire),
        }
    }

    /// Refuse new work, then wait for the writers to apply everything accepted so far.
    /// After `drain_timeout` writers switch to discarding; the final `discarded` count is only
    /// settled once every `WriterJob` has been closed.
    pub fn close(&mut self) -> SchedulerStats {
        if self.state.closed.swap(true, Ordering::SeqCst) {
            return self.stats();
        }
        while self.state.in_flight.load(Ordering::SeqCst) != 0 {
            std::hint::spin_loop();
        }
        let writer_count = self.producers.len();
        self.producers.clear();
        self.state.draining.store(true, Ordering::Release);

        let deadline = Instant::now() + self.drain_timeout;
        while self.state.drained_writers.load(Ordering::Acquire) < writer_count {
            if Instant::now() >= deadline {
                self.state.discarding.store(true, Ordering::Release);
                let stats = self.stats();
                warn!(
                    queued = stats.pending(),
                    timeout = ?self.drain_timeout,
                    "writer drain timed out, discarding queued measurements"
                );
                return stats;
            }
            thread::sleep(Duration::from_millis(1));
        }

        let stats = self.stats();
        info!(
            accepted = stats.accepted,
            applied = stats.applied,
            failed = stats.failed,
            "measurement scheduler closed"
        );
        stats
    }
}

/// Writer consumption job: polls one ring and applies each measurement to storage.
pub struct WriterJob {
    writer_id: usize,
    poller: WriterPoller,
    storage: Arc<dyn StorageEngine>,
    state: Arc<SchedulerState>,
    drained: bool,
}

impl WriterJob {
    pub fn writer_id(&self) -> usize {
        self.writer_id
    }

    /// Apply every measurement currently visible in the ring. Returns how many were handled.
    pub fn process_one_poll_cycle(&mut self) -> usize {
        if self.drained {
            return 0;
        }
        // Read before polling: once set, no publish can still be in progress.
        let draining = self.state.draining.load(Ordering::Acquire);
        let outcome = match self.poller.poll() {
            Ok(mut guard) => {
                metrics::inc_poll_events();
                let mut handled = 0;
                for event in &mut guard {
                    if self.state.discarding.load(Ordering::Acquire) {
                        self.state.discarded.fetch_add(1, Ordering::Release);
                        metrics::inc_measurements_discarded();
                    } else {
                        match self.storage.apply(&event.measurement) {
                            Ok(()) => {
                                self.state.applied.fetch_add(1, Ordering::Release);
                                metrics::inc_measurements_applied();
                            }
                            Err(e) => {
                                self.state.failed.fetch_add(1, Ordering::Release);
                                metrics::inc_apply_errors();
                                warn!(
                                    writer = self.writer_id,
                                    table = %event.measurement.table,
                                    connection = event.connection_id,
                                    error = %e,
                                    "storage rejected measurement"
                                );
                            }
                        }
                    }
                    handled += 1;
                }
                Some(handled)
            }
            Err(Polling::NoEvents) => {
                metrics::inc_poll_no_events();
                (!draining).then_some(0)
            }
            Err(Polling::Shutdown) => None,
        };
        outcome.unwrap_or_else(|| {
            self.finish_drain();
            0
        })
    }

    fn finish_drain(&mut self) {
        if !self.drained {
            self.drained = true;
            self.state.drained_writers.fetch_add(1, Ordering::AcqRel);
        }
    }
}

impl Job for WriterJob {
    fn run(&mut self, _worker_id: usize) -> bool {
        self.process_one_poll_cycle() > 0
    }

    /// Runs after the scheduler closed: whatever is still queued will never be applied.
    fn close(&mut self, _worker_id: usize) {
        if !self.state.closed.load(Ordering::Acquire) {
            return;
        }
        self.state.discarding.store(true, Ordering::Release);
        let mut discarded = 0;
        loop {
            let handled = self.process_one_poll_cycle();
            if handled == 0 {
                break;
            }
            discarded += handled;
        }
        if discarded > 0 {
            warn!(writer = self.writer_id, discarded, "queued measurements discarded at halt");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use crate::ring_types::FieldValue;
    use crate::storage::MemoryStorage;

    fn measurement(table: &str, seq: i64) -> Measurement {
        Measurement {
            table: table.into(),
            fields: vec![("seq".into(), FieldValue::Integer(seq))],
            ..Measurement::default()
        }
    }

    fn config(queue_capacity: usize) -> SchedulerConfig {
        SchedulerConfig {
            queue_capacity,
            drain_timeout: Duration::from_millis(200),
        }
    }

    fn scheduler(
        queue_capacity: usize,
        writer_count: usize,
        storage: Arc<dyn StorageEngine>,
    ) -> (MeasurementScheduler, Vec<WriterJob>) {
        MeasurementScheduler::new(&config(queue_capacity), writer_count, storage).unwrap()
    }

    /// Blocks the first apply until released.
    struct GatedStorage {
        inner: MemoryStorage,
        entered: AtomicBool,
        released: AtomicBool,
    }

    impl StorageEngine for GatedStorage {
        fn apply(&self, measurement: &Measurement) -> Result<(), StorageError> {
            self.entered.store(true, Ordering::Release);
            while !self.released.load(Ordering::Acquire) {
                thread::yield_now();
            }
            self.inner.apply(measurement)
        }
    }

    #[test]
    fn route_is_stable_and_in_range() {
        for writers in 1..8 {
            let first = route("cpu", writers);
            assert!(first < writers);
            assert_eq!(first, route("cpu", writers));
        }
    }

    #[test]
    fn undersized_ring_is_a_config_error() {
        let storage = Arc::new(MemoryStorage::new());
        match MeasurementScheduler::new(&config(16), 1, storage.clone()) {
            Err(ConfigError::TooSmall { value, min, .. }) => {
                assert_eq!(value, 16);
                assert_eq!(min, 64);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("built a 16-slot multi-producer ring"),
        }
        assert!(matches!(
            MeasurementScheduler::new(&config(64), 0, storage),
            Err(ConfigError::Zero { .. })
        ));
    }

    #[test]
    fn accepted_measurement_is_applied() {
        let storage = Arc::new(MemoryStorage::new());
        let (scheduler, mut writers) = scheduler(64, 1, storage.clone());
        let mut publisher = scheduler.publisher();

        let mut pending = Some(measurement("cpu", 1));
        assert_eq!(publisher.try_publish(7, &mut pending), PublishOutcome::Accepted);
        assert!(pending.is_none());

        assert_eq!(writers[0].process_one_poll_cycle(), 1);
        assert_eq!(storage.row_count(), 1);
        assert_eq!(scheduler.stats().applied, 1);
    }

    #[test]
    fn full_ring_leaves_measurement_with_caller() {
        let storage = Arc::new(MemoryStorage::new());
        let (scheduler, mut writers) = scheduler(64, 1, storage.clone());
        let mut publisher = scheduler.publisher();

        for seq in 0..64 {
            let mut pending = Some(measurement("cpu", seq));
            assert_eq!(publisher.try_publish(1, &mut pending), PublishOutcome::Accepted);
        }
        let mut pending = Some(measurement("cpu", 64));
        assert_eq!(publisher.try_publish(1, &mut pending), PublishOutcome::Full);
        assert_eq!(pending, Some(measurement("cpu", 64)));
        assert_eq!(scheduler.stats().rejected, 1);

        assert_eq!(writers[0].process_one_poll_cycle(), 64);
        assert_eq!(publisher.try_publish(1, &mut pending), PublishOutcome::Accepted);
        assert_eq!(writers[0].process_one_poll_cycle(), 1);

        let seqs: Vec<_> = storage
            .rows("cpu")
            .iter()
            .map(|m| m.field("seq").cloned())
            .collect();
        let expected: Vec<_> = (0..65).map(|s| Some(FieldValue::Integer(s))).collect();
        assert_eq!(seqs, expected);
    }

    #[test]
    fn empty_slot_counts_as_accepted() {
        let storage = Arc::new(MemoryStorage::new());
        let (scheduler, _writers) = scheduler(64, 1, storage);
        let mut publisher = scheduler.publisher();
        let mut pending = None;
        assert_eq!(publisher.try_publish(1, &mut pending), PublishOutcome::Accepted);
        assert_eq!(scheduler.stats().accepted, 0);
    }

    #[test]
    fn close_drains_accepted_work_then_refuses_more() {
        let storage = Arc::new(MemoryStorage::new());
        let (mut scheduler, writers) = scheduler(64, 2, storage.clone());
        let mut publisher = scheduler.publisher();
        for seq in 0..20 {
            let table = if seq % 2 == 0 { "even" } else { "odd" };
            let mut pending = Some(measurement(table, seq));
            assert_eq!(publisher.try_publish(1, &mut pending), PublishOutcome::Accepted);
        }

        let handles: Vec<_> = writers
            .into_iter()
            .map(|mut writer| {
                thread::spawn(move || {
                    while !writer.drained {
                        writer.process_one_poll_cycle();
                        thread::yield_now();
                    }
                })
            })
            .collect();

        let stats = scheduler.close();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.accepted, 20);
        assert_eq!(stats.applied, 20);
        assert_eq!(stats.discarded, 0);
        assert_eq!(stats.pending(), 0);
        assert_eq!(storage.row_count(), 20);

        let mut late = Some(measurement("even", 99));
        assert_eq!(publisher.try_publish(1, &mut late), PublishOutcome::Closed);
        assert!(late.is_some());
        assert_eq!(storage.row_count(), 20);
    }

    #[test]
    fn close_without_writers_reports_queued_then_discards_at_halt() {
        let storage = Arc::new(MemoryStorage::new());
        let (mut scheduler, mut writers) = scheduler(64, 1, storage.clone());
        let mut publisher = scheduler.publisher();
        let mut pending = Some(measurement("cpu", 0));
        publisher.try_publish(1, &mut pending);

        let stats = scheduler.close();
        assert_eq!(stats.pending(), 1);
        assert_eq!(storage.row_count(), 0);
        assert!(scheduler.is_closed());
        // Second close is a no-op.
        assert_eq!(scheduler.close(), stats);

        writers[0].close(0);
        let stats = scheduler.stats();
        assert_eq!(stats.discarded, 1);
        assert_eq!(stats.pending(), 0);
        assert_eq!(storage.row_count(), 0);
    }

    #[test]
    fn timed_out_drain_discards_instead_of_applying() {
        let storage = Arc::new(GatedStorage {
            inner: MemoryStorage::new(),
            entered: AtomicBool::new(false),
            released: AtomicBool::new(false),
        });
        let config = SchedulerConfig {
            queue_capacity: 256,
            drain_timeout: Duration::from_millis(20),
        };
        let (mut scheduler, mut writers) =
            MeasurementScheduler::new(&config, 1, storage.clone()).unwrap();
        let mut publisher = scheduler.publisher();
        for seq in 0..200 {
            let mut pending = Some(measurement("cpu", seq));
            assert_eq!(publisher.try_publish(1, &mut pending), PublishOutcome::Accepted);
        }

        let mut writer = writers.remove(0);
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    writer.process_one_poll_cycle();
                }
                writer.close(0);
            })
        };
        while !storage.entered.load(Ordering::Acquire) {
            thread::yield_now();
        }

        // The writer is stuck inside the first apply, so the drain cannot finish.
        let at_close = scheduler.close();
        assert_eq!(at_close.applied, 0);
        assert_eq!(at_close.pending(), 200);

        storage.released.store(true, Ordering::Release);
        stop.store(true, Ordering::Release);
        handle.join().unwrap();

        let stats = scheduler.stats();
        assert_eq!(stats.applied, 1);
        assert_eq!(stats.discarded, 199);
        assert_eq!(stats.pending(), 0);
        assert_eq!(storage.inner.row_count(), 1);
    }
}
