//! Trait seams for the two message buses.
//!
//! The write-bus is a keyed partitioned log with consumer-group offsets;
//! committed offsets must lag behind the dispatch-queue inserts they caused.
//! The execution bus is a visibility-timeout queue: received messages are
//! hidden until acknowledged or until the timeout expires, at which point
//! they are redelivered.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;

pub use memory::{MemoryExecutionBus, MemoryWriteBus};

/// One record of the partitioned submission log.
#[derive(Debug, Clone)]
pub struct BusRecord {
    pub partition: usize,
    pub offset: usize,
    pub key: String,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait WriteBus: Send + Sync {
    /// Append a keyed record; records with the same key land in the same
    /// partition and are delivered in order.
    async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<()>;

    /// Join a consumer group, resuming from its committed offsets.
    async fn subscribe(&self, group: &str) -> Result<Box<dyn WriteBusConsumer>>;
}

#[async_trait]
pub trait WriteBusConsumer: Send + Sync {
    /// The next undelivered record, waiting up to `wait`. Redelivery starts
    /// from the committed offset when a consumer rejoins.
    async fn poll(&mut self, wait: Duration) -> Result<Option<BusRecord>>;

    /// Mark everything up to and including `record` as processed.
    async fn commit(&mut self, record: &BusRecord) -> Result<()>;
}

/// A message claimed from the execution bus, hidden from other consumers
/// until `delete` is called with its receipt handle or the visibility
/// timeout expires.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: Uuid,
    pub receipt_handle: Uuid,
    pub body: String,
    pub receive_count: u32,
}

#[async_trait]
pub trait ExecutionBus: Send + Sync {
    async fn send(&self, body: String) -> Result<()>;

    /// Long-poll receive of up to `max_messages`, waiting up to `wait`.
    async fn receive(&self, max_messages: usize, wait: Duration) -> Result<Vec<ReceivedMessage>>;

    /// Acknowledge by receipt handle. Handles from expired claims are
    /// ignored; the message has already been redelivered under a new one.
    async fn delete(&self, receipt_handle: Uuid) -> Result<()>;
}
