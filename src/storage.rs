//! Storage collaborator seen from the writer threads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::trace;

use crate::error::StorageError;
use crate::ring_types::Measurement;

/// Applies accepted measurements. Called only from writer threads; all measurements for one
/// table arrive on the same writer, in acceptance order.
pub trait StorageEngine: Send + Sync {
    fn apply(&self, measurement: &Measurement) -> Result<(), StorageError>;
}

/// Keeps every applied row in memory, grouped by table.
#[derive(Default)]
pub struct MemoryStorage {
    tables: Mutex<HashMap<String, Vec<Measurement>>>,
    rows: AtomicU64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows of `table` in the order they were applied.
    pub fn rows(&self, table: &str) -> Vec<Measurement> {
        let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        tables.get(table).cloned().unwrap_or_default()
    }

    pub fn row_count(&self) -> u64 {
        self.rows.load(Ordering::Acquire)
    }

    pub fn tables(&self) -> Vec<String> {
        let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = tables.keys().cloned().collect();
        names.sort();
        names
    }
}

impl StorageEngine for MemoryStorage {
    fn apply(&self, measurement: &Measurement) -> Result<(), StorageError> {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        tables
            .entry(measurement.table.clone())
            .or_default()
            .push(measurement.clone());
        self.rows.fetch_add(1, Ordering::Release);
        Ok(())
    }
}

/// Counts rows and drops them. Used by the server binary when no engine is attached.
#[derive(Default)]
pub struct CountingStorage {
    rows: AtomicU64,
}

impl CountingStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row_count(&self) -> u64 {
        self.rows.load(Ordering::Relaxed)
    }
}

impl StorageEngine for CountingStorage {
    fn apply(&self, measurement: &Measurement) -> Result<(), StorageError> {
        trace!(table = %measurement.table, fields = measurement.fields.len(), "row");
        self.rows.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
