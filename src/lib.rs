//! Library crate for linewire: a line-protocol TCP ingestion receiver.
//!
//! Network workers drive one io_uring `IoDispatcher` each, decode lines into `Measurement`s and
//! publish them to the `MeasurementScheduler`; writer workers apply them to a `StorageEngine`.
//! `LineTcpServer` wires the pieces together. `request_flow` and `protocol` need no io_uring and
//! are what the benches and most integration tests drive directly.

pub mod config;
pub mod context;
pub mod context_pool;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod request_flow;
pub mod ring_types;
pub mod scheduler;
pub mod server;
pub mod storage;
pub mod worker_pool;
