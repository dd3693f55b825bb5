//! io_uring readiness dispatcher, one per network thread.
//!
//! Readiness is a one-shot `PollAdd` per connection. A poll is re-armed only after the context
//! reports `Drained`, so a context is either waiting on its poll or sitting in the caller's busy
//! list, never both. The listener is shared by every dispatcher and polled the same way.

use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use io_uring::{
    IoUring, opcode,
    squeue::Entry,
    types::{Fd, Timespec},
};
use slab::Slab;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, warn};

use crate::config::DispatcherConfig;
use crate::context::{ConnectionContext, DisconnectReason, IoStatus};
use crate::context_pool::{ContextFactory, ContextPool};
use crate::metrics;

/// Encode operation type + slab key into io_uring user_data.
const OP_ACCEPT: u64 = 0;
const OP_POLL: u64 = 1;
const OP_TIMEOUT: u64 = 2;

fn encode_user_data(op: u64, key: u32) -> u64 {
    (op << 32) | key as u64
}

fn decode_user_data(user_data: u64) -> (u64, u32) {
    (user_data >> 32, user_data as u32)
}

/// Push an SQE, flushing the submission queue if full.
fn push_sqe(ring: &mut IoUring, sqe: &Entry) -> io::Result<()> {
    loop {
        // SAFETY: poll entries only carry fds; the timeout entry points at the dispatcher's boxed
        // timespec, which is dropped after the ring.
        let result = unsafe { ring.submission().push(sqe) };
        match result {
            Ok(()) => return Ok(()),
            Err(_) => {
                ring.submit()?;
            }
        }
    }
}

fn timespec(duration: Duration) -> Timespec {
    Timespec::new()
        .sec(duration.as_secs())
        .nsec(duration.subsec_nanos())
}

/// Bind a non-blocking TCP listener shared by all dispatchers.
pub fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;
    Ok(socket)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOperation {
    /// The socket became readable (or hung up; the read will tell).
    Read,
    /// The readiness poll itself failed.
    Disconnect,
}

/// Receives readiness events for bound contexts.
pub trait IoRequestProcessor {
    fn on_request(
        &mut self,
        operation: IoOperation,
        token: usize,
        context: &mut ConnectionContext,
    ) -> IoStatus;
}

pub struct IoDispatcher {
    worker_id: usize,
    ring: IoUring,
    listener: Arc<Socket>,
    listener_armed: bool,
    factory: Arc<ContextFactory>,
    pool: ContextPool,
    contexts: Slab<ConnectionContext>,
    accepting: Arc<AtomicBool>,
    max_connections: usize,
    timeout: Box<Timespec>,
    timeout_armed: bool,
    completions: Vec<(u64, i32)>,
    closed: bool,
    #[cfg(test)]
    fail_listener_arm: bool,
}

impl IoDispatcher {
    /// Must run on the thread that will drive the dispatcher: the context pool is thread-bound.
    pub fn new(
        worker_id: usize,
        config: &DispatcherConfig,
        listener: Arc<Socket>,
        factory: Arc<ContextFactory>,
        accepting: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        let ring = IoUring::new(config.ring_entries)?;
        let pool = factory.setup(worker_id);
        let mut dispatcher = Self {
            worker_id,
            ring,
            listener,
            listener_armed: false,
            factory,
            pool,
            contexts: Slab::with_capacity(config.max_connections.min(1024)),
            accepting,
            max_connections: config.max_connections,
            timeout: Box::new(timespec(config.poll_timeout)),
            timeout_armed: false,
            completions: Vec::with_capacity(256),
            closed: false,
            #[cfg(test)]
            fail_listener_arm: false,
        };
        dispatcher.arm_listener()?;
        debug!(worker = worker_id, "dispatcher ready");
        Ok(dispatcher)
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn connection_count(&self) -> usize {
        self.contexts.len()
    }

    pub fn context_mut(&mut self, token: usize) -> Option<&mut ConnectionContext> {
        self.contexts.get_mut(token)
    }

    /// Submit pending work and dispatch every completion. With `wait`, block until at least one
    /// completion arrives or the poll timeout fires. Returns true if anything was dispatched.
    pub fn process_io_queue<P: IoRequestProcessor>(
        &mut self,
        processor: &mut P,
        wait: bool,
    ) -> io::Result<bool> {
        if self.closed {
            return Ok(false);
        }
        if !self.listener_armed {
            if let Err(e) = self.arm_listener() {
                warn!(worker = self.worker_id, error = %e, "listener still not armed");
            }
        }
        if wait {
            if !self.timeout_armed {
                let sqe = opcode::Timeout::new(&*self.timeout as *const Timespec)
                    .build()
                    .user_data(encode_user_data(OP_TIMEOUT, 0));
                push_sqe(&mut self.ring, &sqe)?;
                self.timeout_armed = true;
            }
            match self.ring.submit_and_wait(1) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        } else {
            self.ring.submit()?;
        }

        let mut completions = std::mem::take(&mut self.completions);
        completions.extend(
            self.ring
                .completion()
                .map(|cqe| (cqe.user_data(), cqe.result())),
        );

        let useful = self.dispatch_completions(processor, &completions);
        completions.clear();
        self.completions = completions;
        Ok(useful)
    }

    /// Dispatch one batch of completions. A failure on one entry never drops the rest.
    fn dispatch_completions<P: IoRequestProcessor>(
        &mut self,
        processor: &mut P,
        completions: &[(u64, i32)],
    ) -> bool {
        let mut useful = false;
        for &(user_data, result) in completions {
            let (op, key) = decode_user_data(user_data);
            match op {
                OP_ACCEPT => {
                    self.listener_armed = false;
                    if result < 0 {
                        warn!(
                            worker = self.worker_id,
                            error = %io::Error::from_raw_os_error(-result),
                            "listener poll failed"
                        );
                    }
                    useful |= self.accept() > 0;
                    // Retried at the start of the next pass.
                    if let Err(e) = self.arm_listener() {
                        error!(worker = self.worker_id, error = %e, "failed to re-arm listener");
                    }
                }
                OP_POLL => {
                    useful = true;
                    self.handle_poll(processor, key as usize, result);
                }
                OP_TIMEOUT => self.timeout_armed = false,
                _ => {}
            }
        }
        useful
    }

    /// Apply a context's `handle_io` outcome: re-arm on `Drained`, release on `Disconnected`.
    /// `Busy` contexts stay registered without a poll; the caller revisits them.
    pub fn complete(&mut self, token: usize, status: IoStatus) {
        match status {
            IoStatus::Busy => {}
            IoStatus::Drained => {
                if let Err(e) = self.arm_poll(token) {
                    warn!(worker = self.worker_id, token, error = %e, "failed to re-arm poll");
                    self.disconnect(token, DisconnectReason::Io(e.kind()));
                }
            }
            IoStatus::Disconnected(reason) => self.disconnect(token, reason),
        }
    }

    /// Deregister `token` and hand its context back to the factory.
    pub fn disconnect(&mut self, token: usize, reason: DisconnectReason) {
        let Some(context) = self.contexts.try_remove(token) else {
            return;
        };
        debug!(
            worker = self.worker_id,
            connection = context.connection_id(),
            peer = ?context.peer(),
            published = context.published(),
            %reason,
            "connection closed"
        );
        metrics::inc_disconnects();
        self.factory.done(&mut self.pool, context);
    }

    /// Disconnect every bound context and release this thread's context pool. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let open = self.contexts.len();
        for context in self.contexts.drain() {
            metrics::inc_disconnects();
            self.factory.done(&mut self.pool, context);
        }
        self.factory.close_context_pool(&mut self.pool);
        info!(worker = self.worker_id, disconnected = open, "dispatcher closed");
    }

    fn handle_poll<P: IoRequestProcessor>(&mut self, processor: &mut P, token: usize, result: i32) {
        let Some(context) = self.contexts.get_mut(token) else {
            return;
        };
        let operation = if result < 0 {
            IoOperation::Disconnect
        } else {
            IoOperation::Read
        };
        let status = processor.on_request(operation, token, context);
        self.complete(token, status);
    }

    /// Accept until the listener would block. Returns the number of connections registered.
    fn accept(&mut self) -> usize {
        let mut registered = 0;
        loop {
            let (socket, addr) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(worker = self.worker_id, error = %e, "accept failed");
                    break;
                }
            };
            if !self.accepting.load(Ordering::Acquire) {
                continue;
            }
            if self.contexts.len() >= self.max_connections {
                metrics::inc_connections_rejected();
                warn!(
                    worker = self.worker_id,
                    limit = self.max_connections,
                    peer = ?addr.as_socket(),
                    "connection limit reached, rejecting"
                );
                continue;
            }
            if let Err(e) = socket.set_nonblocking(true).and_then(|_| socket.set_nodelay(true)) {
                warn!(worker = self.worker_id, error = %e, "failed to configure accepted socket");
                continue;
            }

            let entry = self.contexts.vacant_entry();
            let token = entry.key();
            let peer = addr.as_socket();
            let context = self.factory.new_instance(&mut self.pool, socket, peer, token);
            entry.insert(context);
            metrics::inc_connections_accepted();
            debug!(worker = self.worker_id, token, peer = ?peer, "connection accepted");

            match self.arm_poll(token) {
                Ok(()) => registered += 1,
                Err(e) => {
                    warn!(worker = self.worker_id, token, error = %e, "failed to arm poll");
                    self.disconnect(token, DisconnectReason::Io(e.kind()));
                }
            }
        }
        registered
    }

    fn arm_listener(&mut self) -> io::Result<()> {
        #[cfg(test)]
        if std::mem::take(&mut self.fail_listener_arm) {
            return Err(io::Error::other("listener arm refused"));
        }
        let sqe = opcode::PollAdd::new(Fd(self.listener.as_raw_fd()), libc::POLLIN as u32)
            .build()
            .user_data(encode_user_data(OP_ACCEPT, 0));
        push_sqe(&mut self.ring, &sqe)?;
        self.listener_armed = true;
        Ok(())
    }

    fn arm_poll(&mut self, token: usize) -> io::Result<()> {
        let fd = self
            .contexts
            .get(token)
            .and_then(ConnectionContext::fd)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))?;
        let sqe = opcode::PollAdd::new(Fd(fd), libc::POLLIN as u32)
            .build()
            .user_data(encode_user_data(OP_POLL, token as u32));
        push_sqe(&mut self.ring, &sqe)
    }
}

impl Drop for IoDispatcher {
    fn drop(&mut self) {
        self.close();
    }
}
