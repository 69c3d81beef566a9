//! Batch Buffer - Size-Bounded Record Batching
//!
//! Accumulates serialized span records and hands newline-joined batches to a
//! [`Transport`]. Like a plain collection it has no internal locking: the
//! transport is passed to `add()`/`flush()` rather than stored, and the
//! shared, timer-driven wrapper lives in [`crate::pipeline`].
//!
//! # Ceilings
//!
//! Two limits hold after every mutation:
//!
//! - `len() <= max_count`
//! - `buffered_bytes() <= bytes_limit`
//!
//! `add()` flushes the existing buffer *before* appending when the incoming
//! record would reach the byte ceiling, so a large record opens a fresh batch
//! instead of producing an oversized one. After appending, reaching either
//! ceiling flushes immediately.
//!
//! # Wire format
//!
//! Records are joined with `\n`. The reported byte size is the sum of the
//! record sizes plus one byte per separator.
//!
//! ```rust,ignore
//! use netspan::{BatchBuffer, BatchConfig};
//!
//! let mut buffer = BatchBuffer::new(BatchConfig::default());
//! buffer.add(&span, transport.as_ref())?;
//!
//! // Timer or teardown path
//! buffer.flush(transport.as_ref());
//! ```

use crate::span::SpanRecord;
use crate::transport::Transport;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};

/// Supplies contextual attributes merged into every record at serialization
pub type ContextProvider = Arc<dyn Fn() -> Map<String, Value> + Send + Sync>;

/// Error types for batch operations
#[derive(Debug, Error)]
pub enum BatchError {
    /// The record could not be serialized
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Configuration for batching
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum number of records per batch
    pub max_count: usize,
    /// Byte ceiling for one batch
    pub bytes_limit: usize,
    /// Period of the timer-driven flush
    pub flush_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_count: 50,
            bytes_limit: 16 * 1024,
            flush_interval: Duration::from_secs(30),
        }
    }
}

impl BatchConfig {
    pub fn with_max_count(mut self, max_count: usize) -> Self {
        self.max_count = max_count;
        self
    }

    pub fn with_bytes_limit(mut self, bytes_limit: usize) -> Self {
        self.bytes_limit = bytes_limit;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }
}

/// Metrics for batching (plain u64 - the buffer is never shared unguarded)
#[derive(Debug, Default, Clone)]
pub struct BatchMetrics {
    /// Records appended
    pub records_added: u64,
    /// Batches handed to the transport
    pub batches_flushed: u64,
    /// Records handed to the transport
    pub records_flushed: u64,
    /// Records dropped because they could not be serialized
    pub records_dropped: u64,
}

/// A joined batch ready for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Newline-joined records
    pub payload: String,
    /// Payload size in bytes, separators included
    pub bytes: usize,
    /// Number of records joined
    pub count: usize,
}

/// Ordered, size-bounded buffer of serialized records.
pub struct BatchBuffer {
    records: Vec<String>,
    buffered_bytes: usize,
    config: BatchConfig,
    context: Option<ContextProvider>,
    metrics: BatchMetrics,
}

impl BatchBuffer {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            records: Vec::new(),
            buffered_bytes: 0,
            config,
            context: None,
            metrics: BatchMetrics::default(),
        }
    }

    /// Sets the provider whose attributes are merged into every record.
    pub fn with_context(mut self, context: ContextProvider) -> Self {
        self.context = Some(context);
        self
    }

    /// Serializes `record` and appends it, flushing as the ceilings require.
    pub fn add(&mut self, record: &SpanRecord, transport: &dyn Transport) -> Result<(), BatchError> {
        let serialized = match self.serialize(record) {
            Ok(serialized) => serialized,
            Err(e) => {
                self.metrics.records_dropped += 1;
                return Err(e);
            }
        };
        self.push(serialized, transport);
        Ok(())
    }

    /// Appends an already serialized record, flushing as the ceilings require.
    pub fn push(&mut self, serialized: String, transport: &dyn Transport) {
        let size = serialized.len();

        if self.buffered_bytes + size >= self.config.bytes_limit {
            self.flush(transport);
        }

        self.records.push(serialized);
        self.buffered_bytes += size;
        self.metrics.records_added += 1;

        if self.records.len() >= self.config.max_count
            || self.buffered_bytes >= self.config.bytes_limit
        {
            self.flush(transport);
        }

        debug_assert!(
            self.records.len() <= self.config.max_count,
            "buffered count {} exceeds max_count {}",
            self.records.len(),
            self.config.max_count
        );
        debug_assert!(
            self.buffered_bytes <= self.config.bytes_limit,
            "buffered bytes {} exceed bytes_limit {}",
            self.buffered_bytes,
            self.config.bytes_limit
        );
    }

    /// Hands the buffered batch to `transport`. No-op when empty.
    pub fn flush(&mut self, transport: &dyn Transport) {
        if let Some(batch) = self.take_batch() {
            debug!(records = batch.count, bytes = batch.bytes, "flushing batch");
            transport.send(batch.payload, batch.bytes);
        }
    }

    /// Takes the buffered records as a joined batch, leaving the buffer empty.
    ///
    /// Returns `None` if nothing is buffered.
    pub fn take_batch(&mut self) -> Option<Batch> {
        if self.records.is_empty() {
            return None;
        }

        let records = std::mem::take(&mut self.records);
        let count = records.len();
        let bytes = std::mem::take(&mut self.buffered_bytes) + (count - 1);
        let payload = records.join("\n");

        self.metrics.batches_flushed += 1;
        self.metrics.records_flushed += count as u64;
        Some(Batch {
            payload,
            bytes,
            count,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn metrics(&self) -> &BatchMetrics {
        &self.metrics
    }

    /// Record fields win over context attributes with the same key.
    fn serialize(&self, record: &SpanRecord) -> Result<String, BatchError> {
        let mut value = serde_json::to_value(record)?;
        if let (Some(context), Value::Object(fields)) = (&self.context, &mut value) {
            for (key, attribute) in context() {
                fields.entry(key).or_insert(attribute);
            }
        }
        let serialized = serde_json::to_string(&value)?;
        trace!(bytes = serialized.len(), "serialized record");
        Ok(serialized)
    }
}
