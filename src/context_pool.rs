//! Connection context pooling.
//!
//! Every network thread owns one `ContextPool`; the pool is `!Send`, so contexts parked in it
//! can never be popped by another thread. The shared `ContextFactory` only carries the reuse
//! policy (open vs closed) and counters, so acquiring and releasing a context takes no lock.

use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use socket2::Socket;
use tracing::{debug, info, warn};

use crate::context::ConnectionContext;
use crate::metrics;

/// Idle, unbound contexts belonging to one worker thread.
pub struct ContextPool {
    worker_id: usize,
    idle: Vec<ConnectionContext>,
    allocated: usize,
    _thread_bound: PhantomData<*const ()>,
}

impl ContextPool {
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Contexts currently parked in the pool.
    pub fn len(&self) -> usize {
        self.idle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.idle.is_empty()
    }

    /// Contexts this pool has ever allocated.
    pub fn allocated(&self) -> usize {
        self.allocated
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    pub allocated: usize,
    pub recycled: usize,
    pub freed: usize,
    /// Contexts currently bound to a live connection.
    pub bound: usize,
}

pub struct ContextFactory {
    recv_buffer_size: usize,
    initial_capacity: usize,
    closed: AtomicBool,
    next_connection_id: AtomicU64,
    allocated: AtomicUsize,
    recycled: AtomicUsize,
    freed: AtomicUsize,
    bound: AtomicUsize,
}

impl ContextFactory {
    pub fn new(recv_buffer_size: usize, initial_capacity: usize) -> Self {
        Self {
            recv_buffer_size,
            initial_capacity,
            closed: AtomicBool::new(false),
            next_connection_id: AtomicU64::new(1),
            allocated: AtomicUsize::new(0),
            recycled: AtomicUsize::new(0),
            freed: AtomicUsize::new(0),
            bound: AtomicUsize::new(0),
        }
    }

    /// Create the calling thread's pool and fill it to the initial capacity.
    pub fn setup(&self, worker_id: usize) -> ContextPool {
        let mut pool = ContextPool {
            worker_id,
            idle: Vec::with_capacity(self.initial_capacity),
            allocated: 0,
            _thread_bound: PhantomData,
        };
        for _ in 0..self.initial_capacity {
            let context = self.allocate(&mut pool);
            pool.idle.push(context);
        }
        debug!(worker = worker_id, contexts = pool.idle.len(), "context pool ready");
        pool
    }

    /// Pop an idle context (allocating when the pool is empty) and bind it to `socket`.
    pub fn new_instance(
        &self,
        pool: &mut ContextPool,
        socket: Socket,
        peer: Option<SocketAddr>,
        token: usize,
    ) -> ConnectionContext {
        let mut context = match pool.idle.pop() {
            Some(context) => context,
            None => self.allocate(pool),
        };
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        context.bind(socket, peer, token, connection_id);
        self.bound.fetch_add(1, Ordering::Relaxed);
        context
    }

    /// Take back a context whose connection ended. Reused unless the factory is closed.
    pub fn done(&self, pool: &mut ContextPool, mut context: ConnectionContext) {
        self.bound.fetch_sub(1, Ordering::Relaxed);
        if self.closed.load(Ordering::Acquire) {
            self.free(context);
            return;
        }
        if context.worker_id() != pool.worker_id {
            warn!(
                owner = context.worker_id(),
                worker = pool.worker_id,
                "context returned to a foreign pool, freeing it"
            );
            self.free(context);
            return;
        }
        context.unbind();
        pool.idle.push(context);
        self.recycled.fetch_add(1, Ordering::Relaxed);
        metrics::inc_contexts_recycled();
    }

    /// Stop reusing contexts. Bound contexts stay valid and are freed as they disconnect.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("context factory closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Free every idle context of the calling thread's pool.
    pub fn close_context_pool(&self, pool: &mut ContextPool) {
        let count = pool.idle.len();
        for context in pool.idle.drain(..) {
            self.free(context);
        }
        info!(worker = pool.worker_id, freed = count, "context pool closed");
    }

    pub fn stats(&self) -> ContextStats {
        ContextStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            recycled: self.recycled.load(Ordering::Relaxed),
            freed: self.freed.load(Ordering::Relaxed),
            bound: self.bound.load(Ordering::Relaxed),
        }
    }

    fn allocate(&self, pool: &mut ContextPool) -> ConnectionContext {
        pool.allocated += 1;
        self.allocated.fetch_add(1, Ordering::Relaxed);
        metrics::inc_contexts_allocated();
        ConnectionContext::new(pool.worker_id, self.recv_buffer_size)
    }

    fn free(&self, context: ConnectionContext) {
        drop(context);
        self.freed.fetch_add(1, Ordering::Relaxed);
        metrics::inc_contexts_freed();
    }
}
