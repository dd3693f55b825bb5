//! Per-connection state, reused across connections through the context pool.

use std::io::{self, Read};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::Socket;

use crate::protocol::ParseError;
use crate::request_flow::{self, FlowStop};
use crate::ring_types::Measurement;
use crate::scheduler::MeasurementPublisher;

#[derive(Debug, thiserror::Error)]
pub enum DisconnectReason {
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("socket hang-up or error reported by poll")]
    Hangup,
    #[error("read failed: {0:?}")]
    Io(io::ErrorKind),
    #[error("malformed line: {0}")]
    Parse(#[from] ParseError),
    #[error("line exceeds the receive buffer")]
    LineTooLong,
    #[error("server is shutting down")]
    ShuttingDown,
    #[error("context has no socket")]
    Unbound,
}

/// Outcome of one `handle_io` pass.
#[derive(Debug)]
pub enum IoStatus {
    /// Everything readable was consumed; wait for the next readiness event.
    Drained,
    /// Unconsumed input or a measurement refused by the scheduler remains. Revisit without
    /// waiting for readiness.
    Busy,
    /// Deregister the connection and hand the context back to the factory.
    Disconnected(DisconnectReason),
}

impl IoStatus {
    pub fn is_busy(&self) -> bool {
        matches!(self, IoStatus::Busy)
    }
}

impl From<FlowStop> for IoStatus {
    fn from(stop: FlowStop) -> Self {
        match stop {
            FlowStop::Drained => IoStatus::Drained,
            FlowStop::Full => IoStatus::Busy,
            FlowStop::Closed => IoStatus::Disconnected(DisconnectReason::ShuttingDown),
        }
    }
}

pub struct ConnectionContext {
    worker_id: usize,
    socket: Option<Socket>,
    peer: Option<SocketAddr>,
    token: usize,
    connection_id: u64,
    read_buf: Box<[u8]>,
    read_len: usize,
    pending: Option<Measurement>,
    published: u64,
}

impl ConnectionContext {
    /// An unbound context owned by `worker_id`'s pool.
    pub fn new(worker_id: usize, recv_buffer_size: usize) -> Self {
        Self {
            worker_id,
            socket: None,
            peer: None,
            token: 0,
            connection_id: 0,
            read_buf: vec![0u8; recv_buffer_size].into_boxed_slice(),
            read_len: 0,
            pending: None,
            published: 0,
        }
    }

    /// Attach a freshly accepted socket. All decode state starts over.
    pub fn bind(
        &mut self,
        socket: Socket,
        peer: Option<SocketAddr>,
        token: usize,
        connection_id: u64,
    ) -> &mut Self {
        self.reset();
        self.socket = Some(socket);
        self.peer = peer;
        self.token = token;
        self.connection_id = connection_id;
        self
    }

    /// Close the socket and clear per-connection state; the read buffer is kept for reuse.
    pub fn unbind(&mut self) {
        self.reset();
        self.socket = None;
        self.peer = None;
    }

    fn reset(&mut self) {
        self.read_len = 0;
        self.pending = None;
        self.published = 0;
    }

    pub fn is_bound(&self) -> bool {
        self.socket.is_some()
    }

    pub fn fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn token(&self) -> usize {
        self.token
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Measurements accepted by the scheduler since the last bind.
    pub fn published(&self) -> u64 {
        self.published
    }

    /// Bytes received but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.read_len
    }

    /// Decode what is buffered, then do at most one read and decode again.
    pub fn handle_io(&mut self, publisher: &mut MeasurementPublisher) -> IoStatus {
        match self.drain_buffer(publisher) {
            Ok(FlowStop::Drained) => {}
            Ok(stop) => return stop.into(),
            Err(e) => return IoStatus::Disconnected(e.into()),
        }
        if self.read_len == self.read_buf.len() {
            return IoStatus::Disconnected(DisconnectReason::LineTooLong);
        }

        let Some(socket) = self.socket.as_ref() else {
            return IoStatus::Disconnected(DisconnectReason::Unbound);
        };
        let free = self.read_buf.len() - self.read_len;
        let mut stream: &Socket = socket;
        let read = loop {
            match stream.read(&mut self.read_buf[self.read_len..]) {
                Ok(0) => return IoStatus::Disconnected(DisconnectReason::PeerClosed),
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return IoStatus::Drained,
                Err(e) => return IoStatus::Disconnected(DisconnectReason::Io(e.kind())),
            }
        };
        self.read_len += read;

        match self.drain_buffer(publisher) {
            // A read that filled the buffer likely left more in the socket.
            Ok(FlowStop::Drained) if read == free => IoStatus::Busy,
            Ok(stop) => stop.into(),
            Err(e) => IoStatus::Disconnected(e.into()),
        }
    }

    fn drain_buffer(&mut self, publisher: &mut MeasurementPublisher) -> Result<FlowStop, ParseError> {
        let progress = request_flow::publish_measurements_from_buffer(
            &self.read_buf[..self.read_len],
            publisher,
            &mut self.pending,
            self.connection_id,
        )?;
        if progress.consumed > 0 {
            self.read_buf.copy_within(progress.consumed..self.read_len, 0);
            self.read_len -= progress.consumed;
        }
        self.published += progress.published as u64;
        Ok(progress.stop)
    }
}
