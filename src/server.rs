//! Line protocol TCP receiver: wires the listener, dispatchers, scheduler and worker pools.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{error, info};

use crate::config::LineTcpConfig;
use crate::context::{ConnectionContext, DisconnectReason, IoStatus};
use crate::context_pool::{ContextFactory, ContextStats};
use crate::dispatcher::{self, IoDispatcher, IoOperation, IoRequestProcessor};
use crate::error::ServerError;
use crate::scheduler::{MeasurementPublisher, MeasurementScheduler, SchedulerStats};
use crate::storage::StorageEngine;
use crate::worker_pool::{Job, WorkerPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Running,
    Closing,
}

pub struct LineTcpServer {
    local_addr: SocketAddr,
    state: ServerState,
    accepting: Arc<AtomicBool>,
    scheduler: MeasurementScheduler,
    context_factory: Arc<ContextFactory>,
    net_pool: WorkerPool,
    /// `None` when writer jobs run on the network workers.
    writer_pool: Option<WorkerPool>,
}

impl LineTcpServer {
    /// Bind the listener and start every worker. Returns `Ok(None)` when the receiver is
    /// disabled in `config`.
    pub fn start(
        config: &LineTcpConfig,
        storage: Arc<dyn StorageEngine>,
    ) -> Result<Option<Self>, ServerError> {
        if !config.enabled {
            info!("line protocol TCP receiver disabled");
            return Ok(None);
        }
        config.validate()?;

        let bind_addr = config.dispatcher.bind_addr;
        let listener = dispatcher::create_listener(bind_addr, config.dispatcher.listen_backlog)
            .map_err(|source| ServerError::Listen {
                addr: bind_addr,
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .ok()
            .and_then(|addr| addr.as_socket())
            .unwrap_or(bind_addr);
        let listener = Arc::new(listener);

        let accepting = Arc::new(AtomicBool::new(true));
        let context_factory = Arc::new(ContextFactory::new(
            config.dispatcher.recv_buffer_size,
            config.connection_pool_initial_capacity,
        ));
        let (scheduler, writers) =
            MeasurementScheduler::new(&config.scheduler, config.writer_count(), storage)?;

        let mut net_pool = WorkerPool::new("linewire-net", config.net_worker_pool.clone());
        let mut writer_pool = (!config.shares_writer_pool())
            .then(|| WorkerPool::new("linewire-writer", config.writer_worker_pool.clone()));
        let shared = writer_pool.is_none();
        for writer in writers {
            let writer_id = writer.writer_id();
            match writer_pool.as_mut() {
                Some(pool) => pool.assign(writer_id, Box::new(writer)),
                None => net_pool.assign(writer_id, Box::new(writer)),
            }
        }

        {
            let dispatcher_config = config.dispatcher.clone();
            let listener = Arc::clone(&listener);
            let factory = Arc::clone(&context_factory);
            let accepting = Arc::clone(&accepting);
            let publisher = Mutex::new(scheduler.publisher());
            net_pool.assign_all(move |worker_id| {
                let publisher = publisher
                    .lock()
                    .map_err(|_| std::io::Error::other("publisher lock poisoned"))?
                    .clone()
                    .with_worker_id(worker_id);
                let dispatcher = IoDispatcher::new(
                    worker_id,
                    &dispatcher_config,
                    Arc::clone(&listener),
                    Arc::clone(&factory),
                    Arc::clone(&accepting),
                )?;
                Ok(Box::new(NetworkJob::new(dispatcher, publisher, !shared)))
            });
        }

        let mut server = Self {
            local_addr,
            state: ServerState::Starting,
            accepting,
            scheduler,
            context_factory,
            net_pool,
            writer_pool,
        };
        if let Err(e) = server.start_pools() {
            server.abort();
            return Err(e);
        }
        server.state = ServerState::Running;
        info!(
            addr = %server.local_addr,
            net_workers = config.net_worker_pool.worker_count,
            writers = config.writer_count(),
            shared_writers = shared,
            "line protocol TCP receiver listening"
        );
        Ok(Some(server))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn context_stats(&self) -> ContextStats {
        self.context_factory.stats()
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    /// Stop accepting, drain accepted measurements, then stop the workers and release every
    /// context. Idempotent.
    pub fn close(&mut self) {
        if self.state != ServerState::Running {
            return;
        }
        self.state = ServerState::Closing;
        info!(addr = %self.local_addr, "closing line protocol TCP receiver");

        self.accepting.store(false, Ordering::Release);
        self.scheduler.close();
        if let Some(pool) = self.writer_pool.as_mut() {
            pool.halt();
        }
        self.context_factory.close();
        self.net_pool.halt();

        self.state = ServerState::Stopped;
        // Writers have stopped: every accepted measurement is now applied, failed or discarded.
        let stats = self.scheduler.stats();
        let contexts = self.context_factory.stats();
        info!(
            accepted = stats.accepted,
            applied = stats.applied,
            failed = stats.failed,
            discarded = stats.discarded,
            contexts_allocated = contexts.allocated,
            contexts_freed = contexts.freed,
            "line protocol TCP receiver stopped"
        );
    }

    fn start_pools(&mut self) -> Result<(), ServerError> {
        if let Some(pool) = self.writer_pool.as_mut() {
            pool.start()?;
        }
        self.net_pool.start()
    }

    fn abort(&mut self) {
        self.accepting.store(false, Ordering::Release);
        self.context_factory.close();
        self.net_pool.halt();
        if let Some(pool) = self.writer_pool.as_mut() {
            pool.halt();
        }
        self.state = ServerState::Stopped;
    }
}

impl Drop for LineTcpServer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Handles readiness events; contexts that stay busy are queued for revisiting.
struct ReadProcessor {
    publisher: MeasurementPublisher,
    busy: Vec<usize>,
}

impl IoRequestProcessor for ReadProcessor {
    fn on_request(
        &mut self,
        operation: IoOperation,
        token: usize,
        context: &mut ConnectionContext,
    ) -> IoStatus {
        match operation {
            IoOperation::Read => {
                let status = context.handle_io(&mut self.publisher);
                if status.is_busy() {
                    self.busy.push(token);
                }
                status
            }
            IoOperation::Disconnect => IoStatus::Disconnected(DisconnectReason::Hangup),
        }
    }
}

/// Drives one dispatcher: busy contexts first, then readiness events.
struct NetworkJob {
    dispatcher: IoDispatcher,
    processor: ReadProcessor,
    /// False when other jobs share this worker and must not be starved by a blocking wait.
    may_block: bool,
}

impl NetworkJob {
    fn new(dispatcher: IoDispatcher, publisher: MeasurementPublisher, may_block: bool) -> Self {
        Self {
            dispatcher,
            processor: ReadProcessor {
                publisher,
                busy: Vec::new(),
            },
            may_block,
        }
    }

    fn revisit_busy(&mut self) -> bool {
        let ReadProcessor { publisher, busy } = &mut self.processor;
        revisit_busy_contexts(&mut self.dispatcher, publisher, busy)
    }
}

/// Registered contexts addressed by token.
trait ContextRegistry {
    fn context_mut(&mut self, token: usize) -> Option<&mut ConnectionContext>;
    fn complete(&mut self, token: usize, status: IoStatus);
}

impl ContextRegistry for IoDispatcher {
    fn context_mut(&mut self, token: usize) -> Option<&mut ConnectionContext> {
        IoDispatcher::context_mut(self, token)
    }

    fn complete(&mut self, token: usize, status: IoStatus) {
        IoDispatcher::complete(self, token, status)
    }
}

/// Give every busy context one more `handle_io` pass. Returns true if any made progress.
/// Contexts that stop being busy leave the list and are completed (re-armed or released).
fn revisit_busy_contexts<R: ContextRegistry>(
    registry: &mut R,
    publisher: &mut MeasurementPublisher,
    busy: &mut Vec<usize>,
) -> bool {
    let mut progressed = false;
    for i in (0..busy.len()).rev() {
        let token = busy[i];
        let Some(context) = registry.context_mut(token) else {
            busy.swap_remove(i);
            continue;
        };
        let before = context.published();
        let status = context.handle_io(publisher);
        progressed |= context.published() != before;
        if !status.is_busy() {
            busy.swap_remove(i);
            progressed = true;
        }
        registry.complete(token, status);
    }
    progressed
}

impl Job for NetworkJob {
    fn run(&mut self, worker_id: usize) -> bool {
        let mut useful = self.revisit_busy();
        let wait = self.may_block && !useful && self.processor.busy.is_empty();
        match self.dispatcher.process_io_queue(&mut self.processor, wait) {
            Ok(dispatched) => useful |= dispatched,
            Err(e) => error!(worker = worker_id, error = %e, "io_uring submission failed"),
        }
        useful
    }

    fn close(&mut self, _worker_id: usize) {
        self.dispatcher.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    use slab::Slab;
    use socket2::{Domain, Socket, Type};

    use crate::config::{DispatcherConfig, SchedulerConfig};
    use crate::error::ConfigError;
    use crate::ring_types::FieldValue;
    use crate::storage::MemoryStorage;

    /// Stands in for a dispatcher: counts re-arms instead of submitting polls.
    #[derive(Default)]
    struct Registry {
        contexts: Slab<ConnectionContext>,
        rearmed: usize,
        disconnected: usize,
    }

    impl ContextRegistry for Registry {
        fn context_mut(&mut self, token: usize) -> Option<&mut ConnectionContext> {
            self.contexts.get_mut(token)
        }

        fn complete(&mut self, token: usize, status: IoStatus) {
            match status {
                IoStatus::Busy => {}
                IoStatus::Drained => self.rearmed += 1,
                IoStatus::Disconnected(_) => {
                    self.disconnected += 1;
                    self.contexts.try_remove(token);
                }
            }
        }
    }

    fn local_config() -> LineTcpConfig {
        LineTcpConfig {
            dispatcher: DispatcherConfig {
                bind_addr: "127.0.0.1:0".parse().unwrap(),
                ring_entries: 64,
                ..DispatcherConfig::default()
            },
            ..LineTcpConfig::default()
        }
    }

    #[test]
    fn disabled_receiver_does_not_start() {
        let config = LineTcpConfig {
            enabled: false,
            ..local_config()
        };
        let started = LineTcpServer::start(&config, Arc::new(MemoryStorage::new())).unwrap();
        assert!(started.is_none());
    }

    #[test]
    fn invalid_config_is_rejected_before_binding() {
        let mut config = local_config();
        config.scheduler.queue_capacity = 3;
        match LineTcpServer::start(&config, Arc::new(MemoryStorage::new())) {
            Err(ServerError::Config(ConfigError::NotPowerOfTwo { value, .. })) => {
                assert_eq!(value, 3)
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("server started with an invalid queue capacity"),
        }
    }

    #[test]
    fn undersized_queue_fails_startup() {
        let mut config = local_config();
        config.scheduler.queue_capacity = 16;
        match LineTcpServer::start(&config, Arc::new(MemoryStorage::new())) {
            Err(ServerError::Config(ConfigError::TooSmall { value, .. })) => assert_eq!(value, 16),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("server started with a 16-slot queue"),
        }
    }

    #[test]
    fn busy_context_is_revisited_until_drained_without_new_readiness() {
        let (local, mut peer) = Socket::pair(Domain::UNIX, Type::STREAM, None).unwrap();
        local.set_nonblocking(true).unwrap();
        let storage = Arc::new(MemoryStorage::new());
        let config = SchedulerConfig {
            queue_capacity: 64,
            drain_timeout: Duration::from_millis(100),
        };
        let (scheduler, mut writers) =
            MeasurementScheduler::new(&config, 1, storage.clone()).unwrap();
        let mut publisher = scheduler.publisher();

        let mut registry = Registry::default();
        let entry = registry.contexts.vacant_entry();
        let token = entry.key();
        let mut context = ConnectionContext::new(0, 4096);
        context.bind(local, None, token, 1);
        entry.insert(context);

        let payload: String = (0..100).map(|seq| format!("cpu seq={seq}i\n")).collect();
        peer.write_all(payload.as_bytes()).unwrap();

        // One readiness event: the ring takes 64 and the rest stays with the context.
        let status = registry.contexts[token].handle_io(&mut publisher);
        assert!(status.is_busy());
        assert_eq!(registry.contexts[token].published(), 64);
        let mut busy = vec![token];

        // Nothing has drained the ring yet.
        assert!(!revisit_busy_contexts(&mut registry, &mut publisher, &mut busy));
        assert_eq!(busy, vec![token]);
        assert_eq!(registry.rearmed, 0);

        let mut passes = 0;
        while !busy.is_empty() {
            assert!(passes < 100, "busy context never drained");
            writers[0].process_one_poll_cycle();
            revisit_busy_contexts(&mut registry, &mut publisher, &mut busy);
            passes += 1;
        }
        writers[0].process_one_poll_cycle();

        assert_eq!(registry.rearmed, 1);
        assert_eq!(registry.disconnected, 0);
        assert_eq!(registry.contexts[token].published(), 100);
        let seqs: Vec<_> = storage
            .rows("cpu")
            .iter()
            .map(|m| m.field("seq").cloned())
            .collect();
        let expected: Vec<_> = (0..100).map(|s| Some(FieldValue::Integer(s))).collect();
        assert_eq!(seqs, expected);
        assert_eq!(scheduler.stats().rejected, 2);
    }

    #[test]
    fn start_then_close_walks_the_states() {
        if io_uring::IoUring::new(8).is_err() {
            eprintln!("skipping: io_uring unavailable");
            return;
        }
        let mut server = LineTcpServer::start(&local_config(), Arc::new(MemoryStorage::new()))
            .unwrap()
            .unwrap();
        assert_eq!(server.state(), ServerState::Running);
        assert_ne!(server.local_addr().port(), 0);

        server.close();
        assert_eq!(server.state(), ServerState::Stopped);
        let contexts = server.context_stats();
        assert_eq!(contexts.bound, 0);
        assert_eq!(contexts.allocated, contexts.freed);
        server.close();
    }
}
