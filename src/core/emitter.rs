//! Event emission: durable log first, live channel second.
//!
//! The `EventHub` owns the live consumers, one bounded channel per
//! execution. An `EventEmitter` is bound to one execution; it stamps
//! sequence numbers, appends durable events to the `EventStore`, then
//! offers the record to whoever is subscribed. A slow or absent consumer
//! only ever loses non-terminal live events.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

use super::event_store::EventStore;
use crate::domain::{EventRecord, PipelineEvent, StageId};

/// Counters for live delivery
#[derive(Debug, Default)]
pub struct EmitterMetrics {
    /// Events appended to a durable log
    persisted: AtomicU64,

    /// Events accepted by a live consumer
    delivered: AtomicU64,

    /// Events a live consumer missed (full buffer, gone, or too slow)
    dropped: AtomicU64,
}

impl EmitterMetrics {
    fn record_persist(&self) {
        self.persisted.fetch_add(1, Ordering::Relaxed);
    }

    fn record_delivery(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn persisted(&self) -> u64 {
        self.persisted.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "persisted": self.persisted(),
            "delivered": self.delivered(),
            "dropped": self.dropped(),
        })
    }
}

/// Live event stream for one execution.
///
/// Ends (returns `None`) after a terminal event or a checkpoint save, or
/// when another subscriber replaces this one.
#[derive(Debug)]
pub struct EventStream {
    execution_id: Uuid,
    rx: mpsc::Receiver<EventRecord>,
}

impl EventStream {
    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub async fn recv(&mut self) -> Option<EventRecord> {
        self.rx.recv().await
    }

    /// Receive events up to and including the first one matching `until`.
    ///
    /// Stops early if the stream closes.
    pub async fn recv_until<F>(&mut self, mut until: F) -> Vec<EventRecord>
    where
        F: FnMut(&PipelineEvent) -> bool,
    {
        let mut records = Vec::new();
        while let Some(record) = self.rx.recv().await {
            let done = until(&record.event);
            records.push(record);
            if done {
                break;
            }
        }
        records
    }

    /// Receive everything until the stream closes
    pub async fn collect(mut self) -> Vec<EventRecord> {
        let mut records = Vec::new();
        while let Some(record) = self.rx.recv().await {
            records.push(record);
        }
        records
    }
}

/// Registry of live consumers plus the durable log location
pub struct EventHub {
    base_dir: PathBuf,
    buffer: usize,
    terminal_timeout: Duration,
    subscribers: Mutex<HashMap<Uuid, mpsc::Sender<EventRecord>>>,

    /// Emitters still held by a driver; at most one per execution
    emitters: tokio::sync::Mutex<HashMap<Uuid, Weak<EmitterInner>>>,

    metrics: EmitterMetrics,
}

impl EventHub {
    pub fn new(base_dir: impl Into<PathBuf>, buffer: usize, terminal_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            base_dir: base_dir.into(),
            buffer: buffer.max(1),
            terminal_timeout,
            subscribers: Mutex::new(HashMap::new()),
            emitters: tokio::sync::Mutex::new(HashMap::new()),
            metrics: EmitterMetrics::default(),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn metrics(&self) -> &EmitterMetrics {
        &self.metrics
    }

    fn subscribers(&self) -> MutexGuard<'_, HashMap<Uuid, mpsc::Sender<EventRecord>>> {
        // Recover from poisoning
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach a live consumer, replacing any previous one
    pub fn subscribe(&self, execution_id: Uuid) -> EventStream {
        let (tx, rx) = mpsc::channel(self.buffer);
        if self.subscribers().insert(execution_id, tx).is_some() {
            debug!(%execution_id, "Replaced live subscriber");
        }
        EventStream { execution_id, rx }
    }

    /// Detach the live consumer, closing its stream
    pub fn release(&self, execution_id: Uuid) {
        self.subscribers().remove(&execution_id);
    }

    pub fn is_subscribed(&self, execution_id: Uuid) -> bool {
        self.subscribers().contains_key(&execution_id)
    }

    /// Emitter for an execution.
    ///
    /// Shares the live emitter if a driver still holds one; otherwise opens
    /// a new one continuing the sequence of the durable log.
    pub async fn emitter(self: &Arc<Self>, execution_id: Uuid) -> Result<EventEmitter> {
        let mut emitters = self.emitters.lock().await;
        if let Some(inner) = emitters.get(&execution_id).and_then(Weak::upgrade) {
            return Ok(EventEmitter { inner });
        }

        let store = EventStore::open(&self.base_dir, execution_id).await?;
        let last_seq = store.last_seq().await?;
        let inner = Arc::new(EmitterInner {
            execution_id,
            store,
            seq: tokio::sync::Mutex::new(last_seq),
            hub: Arc::clone(self),
        });

        emitters.retain(|_, weak| weak.strong_count() > 0);
        emitters.insert(execution_id, Arc::downgrade(&inner));
        Ok(EventEmitter { inner })
    }

    /// Replay the durable log of an execution
    pub async fn history(&self, execution_id: Uuid) -> Result<Vec<EventRecord>> {
        EventStore::open(&self.base_dir, execution_id)
            .await?
            .replay()
            .await
    }

    fn release_if_same(&self, execution_id: Uuid, tx: &mpsc::Sender<EventRecord>) {
        let mut subscribers = self.subscribers();
        if subscribers
            .get(&execution_id)
            .is_some_and(|current| current.same_channel(tx))
        {
            subscribers.remove(&execution_id);
        }
    }

    async fn deliver(&self, record: &EventRecord) {
        let execution_id = record.execution_id;
        let Some(tx) = self.subscribers().get(&execution_id).cloned() else {
            return;
        };

        if record.event.closes_stream() {
            match tokio::time::timeout(self.terminal_timeout, tx.send(record.clone())).await {
                Ok(Ok(())) => self.metrics.record_delivery(),
                Ok(Err(_)) => self.metrics.record_drop(),
                Err(_) => {
                    self.metrics.record_drop();
                    warn!(%execution_id, kind = record.event.kind(), "Live consumer did not accept closing event");
                }
            }
            self.release_if_same(execution_id, &tx);
            return;
        }

        match tx.try_send(record.clone()) {
            Ok(()) => self.metrics.record_delivery(),
            Err(TrySendError::Full(_)) => {
                self.metrics.record_drop();
                debug!(%execution_id, seq = record.seq, "Live buffer full, event dropped");
            }
            Err(TrySendError::Closed(_)) => {
                self.metrics.record_drop();
                self.release_if_same(execution_id, &tx);
            }
        }
    }
}

struct EmitterInner {
    execution_id: Uuid,
    store: EventStore,

    /// Last assigned sequence number; held across append and delivery so
    /// the log and the live stream see the same order
    seq: tokio::sync::Mutex<u64>,

    hub: Arc<EventHub>,
}

/// Emits events for one execution
#[derive(Clone)]
pub struct EventEmitter {
    inner: Arc<EmitterInner>,
}

impl EventEmitter {
    pub fn execution_id(&self) -> Uuid {
        self.inner.execution_id
    }

    /// Emit an event.
    ///
    /// Durable events are appended to the log before live delivery; a log
    /// failure is returned and nothing is delivered.
    pub async fn emit(&self, event: PipelineEvent) -> Result<EventRecord> {
        let mut seq = self.inner.seq.lock().await;

        let record = if event.is_durable() {
            let record = EventRecord::new(*seq + 1, self.inner.execution_id, event);
            self.inner.store.append(&record).await?;
            *seq += 1;
            self.inner.hub.metrics.record_persist();
            record
        } else {
            EventRecord::new(*seq, self.inner.execution_id, event)
        };

        self.inner.hub.deliver(&record).await;
        Ok(record)
    }

    /// Live-only progress signal during a long stage call
    pub async fn heartbeat(&self, stage: StageId, elapsed: Duration) {
        let event = PipelineEvent::Heartbeat {
            stage,
            elapsed_ms: elapsed.as_millis() as u64,
        };
        if let Err(e) = self.emit(event).await {
            debug!(error = %e, "Heartbeat not delivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ExecutionMode;
    use tempfile::TempDir;

    fn stage_start(stage: StageId) -> PipelineEvent {
        PipelineEvent::StageStart {
            stage,
            index: 0,
            label: stage.to_string(),
        }
    }

    fn error_event() -> PipelineEvent {
        PipelineEvent::PipelineError {
            stage: None,
            message: "boom".to_string(),
        }
    }

    #[tokio::test]
    async fn test_durable_before_live_and_heartbeat_not_persisted() {
        let temp = TempDir::new().unwrap();
        let hub = EventHub::new(temp.path(), 16, Duration::from_secs(1));
        let execution_id = Uuid::new_v4();
        let mut stream = hub.subscribe(execution_id);
        let emitter = hub.emitter(execution_id).await.unwrap();

        emitter
            .emit(PipelineEvent::PipelineStart {
                mode: ExecutionMode::Automatic,
                topic: "t".to_string(),
                stages: vec![StageId::Research],
            })
            .await
            .unwrap();
        emitter
            .heartbeat(StageId::Research, Duration::from_millis(500))
            .await;
        emitter.emit(error_event()).await.unwrap();

        let live = stream.collect().await;
        assert_eq!(live.len(), 3);
        assert_eq!(live[1].event.kind(), "heartbeat");
        assert_eq!(live[1].seq, 1);
        assert_eq!(live[2].seq, 2);

        let history = hub.history(execution_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|r| r.event.is_durable()));
        assert_eq!(hub.metrics().persisted(), 2);
        assert!(!hub.is_subscribed(execution_id));
    }

    #[tokio::test]
    async fn test_sequence_continues_after_reopen() {
        let temp = TempDir::new().unwrap();
        let hub = EventHub::new(temp.path(), 16, Duration::from_secs(1));
        let execution_id = Uuid::new_v4();

        let first = hub.emitter(execution_id).await.unwrap();
        first.emit(stage_start(StageId::Research)).await.unwrap();
        first.emit(stage_start(StageId::ToneAnalysis)).await.unwrap();
        drop(first);

        let second = hub.emitter(execution_id).await.unwrap();
        let record = second.emit(stage_start(StageId::Outline)).await.unwrap();
        assert_eq!(record.seq, 3);
    }

    #[tokio::test]
    async fn test_live_emitter_is_shared() {
        let temp = TempDir::new().unwrap();
        let hub = EventHub::new(temp.path(), 16, Duration::from_secs(1));
        let execution_id = Uuid::new_v4();

        let a = hub.emitter(execution_id).await.unwrap();
        let b = hub.emitter(execution_id).await.unwrap();
        assert_eq!(a.emit(stage_start(StageId::Research)).await.unwrap().seq, 1);
        assert_eq!(b.emit(stage_start(StageId::ToneAnalysis)).await.unwrap().seq, 2);
    }

    #[tokio::test]
    async fn test_full_buffer_drops_non_terminal_but_keeps_log() {
        let temp = TempDir::new().unwrap();
        let hub = EventHub::new(temp.path(), 1, Duration::from_millis(50));
        let execution_id = Uuid::new_v4();
        let mut stream = hub.subscribe(execution_id);
        let emitter = hub.emitter(execution_id).await.unwrap();

        emitter.emit(stage_start(StageId::Research)).await.unwrap();
        emitter.emit(stage_start(StageId::ToneAnalysis)).await.unwrap();
        assert_eq!(hub.metrics().dropped(), 1);

        let first = stream.recv().await.unwrap();
        assert_eq!(first.seq, 1);

        emitter.emit(error_event()).await.unwrap();
        let terminal = stream.recv().await.unwrap();
        assert!(terminal.event.is_terminal());
        assert!(stream.recv().await.is_none());

        assert_eq!(hub.history(execution_id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_emitting_without_consumer_succeeds() {
        let temp = TempDir::new().unwrap();
        let hub = EventHub::new(temp.path(), 4, Duration::from_millis(10));
        let execution_id = Uuid::new_v4();
        let stream = hub.subscribe(execution_id);
        drop(stream);

        let emitter = hub.emitter(execution_id).await.unwrap();
        emitter.emit(stage_start(StageId::Research)).await.unwrap();
        emitter.emit(error_event()).await.unwrap();
        assert_eq!(hub.history(execution_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_previous_stream() {
        let temp = TempDir::new().unwrap();
        let hub = EventHub::new(temp.path(), 4, Duration::from_millis(10));
        let execution_id = Uuid::new_v4();
        let mut old = hub.subscribe(execution_id);
        let mut new = hub.subscribe(execution_id);

        assert!(old.recv().await.is_none());

        let emitter = hub.emitter(execution_id).await.unwrap();
        emitter.emit(stage_start(StageId::Research)).await.unwrap();
        assert_eq!(new.recv().await.unwrap().seq, 1);
    }
}
