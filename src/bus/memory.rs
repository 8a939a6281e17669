//! Embedded engines backing the bus traits.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::bus::{BusRecord, ExecutionBus, ReceivedMessage, WriteBus, WriteBusConsumer};
use crate::error::Result;

const DEFAULT_PARTITIONS: usize = 4;

// Long-poll loops re-check on this cadence so visibility expiries are
// observed even without a send waking them.
const POLL_SLICE: Duration = Duration::from_millis(25);

fn partition_for(key: &str, partitions: usize) -> usize {
    let mut h: u64 = 0xcbf29ce484222325;
    for b in key.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    (h % partitions as u64) as usize
}

struct WriteBusState {
    partitions: Vec<Vec<(String, Vec<u8>)>>,
    // group -> per-partition committed offsets (next offset to deliver)
    committed: HashMap<String, Vec<usize>>,
}

struct WriteBusShared {
    state: Mutex<WriteBusState>,
    notify: Notify,
}

/// Keyed partitioned log with consumer-group offsets.
pub struct MemoryWriteBus {
    shared: Arc<WriteBusShared>,
}

impl Default for MemoryWriteBus {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITIONS)
    }
}

impl MemoryWriteBus {
    pub fn new(partitions: usize) -> Self {
        Self {
            shared: Arc::new(WriteBusShared {
                state: Mutex::new(WriteBusState {
                    partitions: vec![Vec::new(); partitions],
                    committed: HashMap::new(),
                }),
                notify: Notify::new(),
            }),
        }
    }
}

#[async_trait]
impl WriteBus for MemoryWriteBus {
    async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<()> {
        {
            let mut state = self.shared.state.lock().await;
            let partitions = state.partitions.len();
            let p = partition_for(key, partitions);
            state.partitions[p].push((key.to_string(), payload));
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(&self, group: &str) -> Result<Box<dyn WriteBusConsumer>> {
        let delivered = {
            let mut state = self.shared.state.lock().await;
            let partitions = state.partitions.len();
            state
                .committed
                .entry(group.to_string())
                .or_insert_with(|| vec![0; partitions])
                .clone()
        };
        Ok(Box::new(MemoryWriteBusConsumer {
            shared: self.shared.clone(),
            group: group.to_string(),
            delivered,
            cursor: 0,
        }))
    }
}

struct MemoryWriteBusConsumer {
    shared: Arc<WriteBusShared>,
    group: String,
    // Per-partition next offset to hand out. Starts from the committed
    // offsets, so an uncommitted record is delivered again after a rejoin.
    delivered: Vec<usize>,
    cursor: usize,
}

impl MemoryWriteBusConsumer {
    async fn try_next(&mut self) -> Option<BusRecord> {
        let state = self.shared.state.lock().await;
        let n = state.partitions.len();
        for i in 0..n {
            let p = (self.cursor + i) % n;
            let offset = self.delivered[p];
            if let Some((key, payload)) = state.partitions[p].get(offset) {
                self.delivered[p] += 1;
                self.cursor = (p + 1) % n;
                return Some(BusRecord {
                    partition: p,
                    offset,
                    key: key.clone(),
                    payload: payload.clone(),
                });
            }
        }
        None
    }
}

#[async_trait]
impl WriteBusConsumer for MemoryWriteBusConsumer {
    async fn poll(&mut self, wait: Duration) -> Result<Option<BusRecord>> {
        let deadline = Instant::now() + wait;
        loop {
            let shared = self.shared.clone();
            let notified = shared.notify.notified();
            if let Some(record) = self.try_next().await {
                return Ok(Some(record));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let slice = POLL_SLICE.min(deadline - now);
            let _ = tokio::time::timeout(slice, notified).await;
        }
    }

    async fn commit(&mut self, record: &BusRecord) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        if let Some(offsets) = state.committed.get_mut(&self.group) {
            if offsets[record.partition] <= record.offset {
                offsets[record.partition] = record.offset + 1;
            }
        }
        Ok(())
    }
}

struct StoredMessage {
    message_id: Uuid,
    body: String,
    visible_at: Instant,
    receipt_handle: Option<Uuid>,
    receive_count: u32,
}

#[derive(Default)]
struct ExecutionBusState {
    messages: Vec<StoredMessage>,
    dead_letters: Vec<String>,
}

/// Visibility-timeout queue with receipt handles and a receive-count
/// dead-letter policy.
pub struct MemoryExecutionBus {
    visibility_timeout: Duration,
    max_receive_count: u32,
    state: Mutex<ExecutionBusState>,
    notify: Notify,
}

impl MemoryExecutionBus {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            visibility_timeout,
            max_receive_count: 5,
            state: Mutex::new(ExecutionBusState::default()),
            notify: Notify::new(),
        }
    }

    pub fn with_max_receive_count(mut self, max_receive_count: u32) -> Self {
        self.max_receive_count = max_receive_count;
        self
    }

    /// Messages that exceeded the redelivery budget.
    pub async fn dead_letters(&self) -> Vec<String> {
        self.state.lock().await.dead_letters.clone()
    }

    /// Messages still on the queue, visible or in flight.
    pub async fn depth(&self) -> usize {
        self.state.lock().await.messages.len()
    }

    async fn try_claim(&self, max_messages: usize) -> Vec<ReceivedMessage> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let mut claimed = Vec::new();
        let mut poisoned = Vec::new();

        for (idx, msg) in state.messages.iter_mut().enumerate() {
            if claimed.len() >= max_messages {
                break;
            }
            if msg.visible_at > now {
                continue;
            }
            if msg.receive_count >= self.max_receive_count {
                poisoned.push(idx);
                continue;
            }
            let receipt = Uuid::new_v4();
            msg.receive_count += 1;
            msg.receipt_handle = Some(receipt);
            msg.visible_at = now + self.visibility_timeout;
            claimed.push(ReceivedMessage {
                message_id: msg.message_id,
                receipt_handle: receipt,
                body: msg.body.clone(),
                receive_count: msg.receive_count,
            });
        }

        for idx in poisoned.into_iter().rev() {
            let msg = state.messages.remove(idx);
            tracing::warn!(message_id = %msg.message_id, "Dead-lettering poison message");
            state.dead_letters.push(msg.body);
        }

        claimed
    }
}

#[async_trait]
impl ExecutionBus for MemoryExecutionBus {
    async fn send(&self, body: String) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            state.messages.push(StoredMessage {
                message_id: Uuid::new_v4(),
                body,
                visible_at: Instant::now(),
                receipt_handle: None,
                receive_count: 0,
            });
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn receive(&self, max_messages: usize, wait: Duration) -> Result<Vec<ReceivedMessage>> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            let batch = self.try_claim(max_messages).await;
            if !batch.is_empty() {
                return Ok(batch);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let slice = POLL_SLICE.min(deadline - now);
            let _ = tokio::time::timeout(slice, notified).await;
        }
    }

    async fn delete(&self, receipt_handle: Uuid) -> Result<()> {
        let mut state = self.state.lock().await;
        let before = state.messages.len();
        state
            .messages
            .retain(|m| m.receipt_handle != Some(receipt_handle));
        if state.messages.len() == before {
            tracing::debug!(%receipt_handle, "Delete with stale receipt handle ignored");
        }
        Ok(())
    }
}
