#[cfg(feature = "metrics")]
mod imp {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    use tracing::info;

    // Connections (cumulative)
    static CONNECTIONS_ACCEPTED: AtomicU64 = AtomicU64::new(0);
    static CONNECTIONS_REJECTED: AtomicU64 = AtomicU64::new(0);
    static DISCONNECTS: AtomicU64 = AtomicU64::new(0);
    // Context pool churn
    static CONTEXTS_ALLOCATED: AtomicU64 = AtomicU64::new(0);
    static CONTEXTS_RECYCLED: AtomicU64 = AtomicU64::new(0);
    static CONTEXTS_FREED: AtomicU64 = AtomicU64::new(0);
    // Throughput and backpressure
    static MEASUREMENTS_PUBLISHED: AtomicU64 = AtomicU64::new(0);
    static SCHEDULER_FULL: AtomicU64 = AtomicU64::new(0);
    static PARSE_ERRORS: AtomicU64 = AtomicU64::new(0);
    static MEASUREMENTS_APPLIED: AtomicU64 = AtomicU64::new(0);
    static APPLY_ERRORS: AtomicU64 = AtomicU64::new(0);
    static MEASUREMENTS_DISCARDED: AtomicU64 = AtomicU64::new(0);
    // Writer poll outcomes (stall = NoEvents)
    static POLL_EVENTS: AtomicU64 = AtomicU64::new(0);
    static POLL_NO_EVENTS: AtomicU64 = AtomicU64::new(0);
    // Gauges
    static CONNECTIONS_OPEN: AtomicUsize = AtomicUsize::new(0);
    static CONNECTIONS_MAX_OPEN: AtomicUsize = AtomicUsize::new(0);

    #[derive(Clone, Copy, Debug, Default)]
    pub struct MetricsSnapshot {
        pub connections_accepted: u64,
        pub connections_rejected: u64,
        pub disconnects: u64,
        pub contexts_allocated: u64,
        pub contexts_recycled: u64,
        pub contexts_freed: u64,
        pub measurements_published: u64,
        pub scheduler_full: u64,
        pub parse_errors: u64,
        pub measurements_applied: u64,
        pub apply_errors: u64,
        pub measurements_discarded: u64,
        pub poll_events: u64,
        pub poll_no_events: u64,
        pub connections_open: usize,
        pub connections_max_open: usize,
    }

    fn update_max(target: &AtomicUsize, value: usize) {
        let mut prev = target.load(Ordering::Relaxed);
        while value > prev {
            match target.compare_exchange_weak(prev, value, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(next) => prev = next,
            }
        }
    }

    pub fn inc_connections_accepted() {
        CONNECTIONS_ACCEPTED.fetch_add(1, Ordering::Relaxed);
        let open = CONNECTIONS_OPEN.fetch_add(1, Ordering::Relaxed) + 1;
        update_max(&CONNECTIONS_MAX_OPEN, open);
    }

    pub fn inc_connections_rejected() {
        CONNECTIONS_REJECTED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_disconnects() {
        DISCONNECTS.fetch_add(1, Ordering::Relaxed);
        CONNECTIONS_OPEN.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_contexts_allocated() {
        CONTEXTS_ALLOCATED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_contexts_recycled() {
        CONTEXTS_RECYCLED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_contexts_freed() {
        CONTEXTS_FREED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_measurements_published() {
        MEASUREMENTS_PUBLISHED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_scheduler_full() {
        SCHEDULER_FULL.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_parse_errors() {
        PARSE_ERRORS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_measurements_applied() {
        MEASUREMENTS_APPLIED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_apply_errors() {
        APPLY_ERRORS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_measurements_discarded() {
        MEASUREMENTS_DISCARDED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_poll_events() {
        POLL_EVENTS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_poll_no_events() {
        POLL_NO_EVENTS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: CONNECTIONS_ACCEPTED.load(Ordering::Relaxed),
            connections_rejected: CONNECTIONS_REJECTED.load(Ordering::Relaxed),
            disconnects: DISCONNECTS.load(Ordering::Relaxed),
            contexts_allocated: CONTEXTS_ALLOCATED.load(Ordering::Relaxed),
            contexts_recycled: CONTEXTS_RECYCLED.load(Ordering::Relaxed),
            contexts_freed: CONTEXTS_FREED.load(Ordering::Relaxed),
            measurements_published: MEASUREMENTS_PUBLISHED.load(Ordering::Relaxed),
            scheduler_full: SCHEDULER_FULL.load(Ordering::Relaxed),
            parse_errors: PARSE_ERRORS.load(Ordering::Relaxed),
            measurements_applied: MEASUREMENTS_APPLIED.load(Ordering::Relaxed),
            apply_errors: APPLY_ERRORS.load(Ordering::Relaxed),
            measurements_discarded: MEASUREMENTS_DISCARDED.load(Ordering::Relaxed),
            poll_events: POLL_EVENTS.load(Ordering::Relaxed),
            poll_no_events: POLL_NO_EVENTS.load(Ordering::Relaxed),
            connections_open: CONNECTIONS_OPEN.load(Ordering::Relaxed),
            connections_max_open: CONNECTIONS_MAX_OPEN.load(Ordering::Relaxed),
        }
    }

    pub fn spawn_reporter() {
        const INTERVAL_SECS: u64 = 10;
        let spawned = std::thread::Builder::new()
            .name("metrics".into())
            .spawn(|| {
                let mut last = snapshot();
                loop {
                    std::thread::sleep(Duration::from_secs(INTERVAL_SECS));
                    let snap = snapshot();
                    let poll_ev_d = snap.poll_events.saturating_sub(last.poll_events);
                    let poll_no_d = snap.poll_no_events.saturating_sub(last.poll_no_events);
                    let total_poll = poll_ev_d + poll_no_d;
                    let stall_pct = if total_poll > 0 {
                        100.0 * (poll_no_d as f64 / total_poll as f64)
                    } else {
                        0.0
                    };
                    info!(
                        interval_secs = INTERVAL_SECS,
                        accepted = snap.connections_accepted.saturating_sub(last.connections_accepted),
                        rejected = snap.connections_rejected.saturating_sub(last.connections_rejected),
                        disconnects = snap.disconnects.saturating_sub(last.disconnects),
                        contexts_allocated =
                            snap.contexts_allocated.saturating_sub(last.contexts_allocated),
                        contexts_recycled =
                            snap.contexts_recycled.saturating_sub(last.contexts_recycled),
                        contexts_freed = snap.contexts_freed.saturating_sub(last.contexts_freed),
                        published = snap
                            .measurements_published
                            .saturating_sub(last.measurements_published),
                        applied = snap
                            .measurements_applied
                            .saturating_sub(last.measurements_applied),
                        scheduler_full = snap.scheduler_full.saturating_sub(last.scheduler_full),
                        parse_errors = snap.parse_errors.saturating_sub(last.parse_errors),
                        apply_errors = snap.apply_errors.saturating_sub(last.apply_errors),
                        discarded = snap
                            .measurements_discarded
                            .saturating_sub(last.measurements_discarded),
                        stall_pct = %format!("{stall_pct:.1}"),
                        open = snap.connections_open,
                        max_open = snap.connections_max_open,
                        "metrics delta"
                    );
                    last = snap;
                }
            });
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "failed to spawn metrics reporter");
        }
    }
}

#[cfg(not(feature = "metrics"))]
#[allow(dead_code)]
mod imp {
    #[derive(Clone, Copy, Debug, Default)]
    pub struct MetricsSnapshot {
        pub connections_accepted: u64,
        pub connections_rejected: u64,
        pub disconnects: u64,
        pub contexts_allocated: u64,
        pub contexts_recycled: u64,
        pub contexts_freed: u64,
        pub measurements_published: u64,
        pub scheduler_full: u64,
        pub parse_errors: u64,
        pub measurements_applied: u64,
        pub apply_errors: u64,
        pub measurements_discarded: u64,
        pub poll_events: u64,
        pub poll_no_events: u64,
        pub connections_open: usize,
        pub connections_max_open: usize,
    }

    pub fn inc_connections_accepted() {}
    pub fn inc_connections_rejected() {}
    pub fn inc_disconnects() {}
    pub fn inc_contexts_allocated() {}
    pub fn inc_contexts_recycled() {}
    pub fn inc_contexts_freed() {}
    pub fn inc_measurements_published() {}
    pub fn inc_scheduler_full() {}
    pub fn inc_parse_errors() {}
    pub fn inc_measurements_applied() {}
    pub fn inc_apply_errors() {}
    pub fn inc_measurements_discarded() {}
    pub fn inc_poll_events() {}
    pub fn inc_poll_no_events() {}
    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot::default()
    }
    pub fn spawn_reporter() {}
}

pub use imp::*;
