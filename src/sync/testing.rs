//! Test doubles: an in-memory backend and a hand-driven clock

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{oneshot, Notify};

use super::clock::Clock;
use super::error::TransportError;
use super::transport::SyncTransport;
use super::types::{EntityType, ServerEntity};

/// Request as the backend received it
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Fetch(String),
    Create(Value),
    Update {
        id: String,
        payload: Value,
        base_version: Option<u64>,
    },
    Delete {
        id: String,
        base_version: Option<u64>,
    },
}

/// Versioned entity store with scripted failures
#[derive(Clone, Default)]
pub struct MemoryTransport {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    entities: Mutex<HashMap<String, ServerEntity>>,
    failures: Mutex<VecDeque<TransportError>>,
    calls: Mutex<Vec<Call>>,
    next_id: AtomicU64,
    hang_next: AtomicBool,
    /// Requests to let through before holding one
    hold_after: Mutex<Option<usize>>,
    entered: Notify,
    release: Notify,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put an entity on the server as if another client created it
    pub fn seed(&self, id: &str, version: u64, data: Value) -> ServerEntity {
        let entity = ServerEntity {
            id: id.to_string(),
            version,
            data,
        };
        self.inner
            .entities
            .lock()
            .insert(id.to_string(), entity.clone());
        entity
    }

    /// Edit an entity as another client would, bumping its version
    pub fn edit(&self, id: &str, data: Value) -> ServerEntity {
        let mut entities = self.inner.entities.lock();
        let entity = entities.entry(id.to_string()).or_insert(ServerEntity {
            id: id.to_string(),
            version: 0,
            data: Value::Null,
        });
        entity.version += 1;
        entity.data = data;
        entity.clone()
    }

    pub fn remove(&self, id: &str) {
        self.inner.entities.lock().remove(id);
    }

    pub fn get(&self, id: &str) -> Option<ServerEntity> {
        self.inner.entities.lock().get(id).cloned()
    }

    /// Fail the next request with `error`; queued failures apply in order
    pub fn fail_next(&self, error: TransportError) {
        self.inner.failures.lock().push_back(error);
    }

    /// Never answer the next request
    pub fn hang_next(&self) {
        self.inner.hang_next.store(true, Ordering::SeqCst);
    }

    /// Pause the next request until [`release`](Self::release) is called
    pub fn hold_next(&self) {
        self.hold_after(0);
    }

    /// Let `skip` requests through, then hold the one after them
    pub fn hold_after(&self, skip: usize) {
        *self.inner.hold_after.lock() = Some(skip);
    }

    /// Wait until a held request has reached the backend
    pub async fn entered(&self) {
        self.inner.entered.notified().await;
    }

    pub fn release(&self) {
        self.inner.release.notify_one();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.calls.lock().clone()
    }

    async fn receive(&self, call: Call) -> Result<(), TransportError> {
        self.inner.calls.lock().push(call);

        if self.inner.hang_next.swap(false, Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let hold = {
            let mut hold_after = self.inner.hold_after.lock();
            match *hold_after {
                Some(0) => {
                    *hold_after = None;
                    true
                }
                Some(n) => {
                    *hold_after = Some(n - 1);
                    false
                }
                None => false,
            }
        };
        if hold {
            self.inner.entered.notify_one();
            self.inner.release.notified().await;
        }

        match self.inner.failures.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn check_version(entity: &ServerEntity, base_version: Option<u64>) -> Result<(), TransportError> {
        match base_version {
            Some(version) if version != entity.version => Err(TransportError::VersionMismatch),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl SyncTransport for MemoryTransport {
    async fn fetch(&self, _entity_type: EntityType, id: &str) -> Result<ServerEntity, TransportError> {
        self.receive(Call::Fetch(id.to_string())).await?;
        self.get(id)
            .ok_or_else(|| TransportError::NotFound(id.to_string()))
    }

    async fn create(&self, entity_type: EntityType, payload: &Value) -> Result<ServerEntity, TransportError> {
        self.receive(Call::Create(payload.clone())).await?;
        let n = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("{}-{}", entity_type.as_str(), n);
        Ok(self.seed(&id, 1, payload.clone()))
    }

    async fn update(
        &self,
        _entity_type: EntityType,
        id: &str,
        payload: &Value,
        base_version: Option<u64>,
    ) -> Result<ServerEntity, TransportError> {
        self.receive(Call::Update {
            id: id.to_string(),
            payload: payload.clone(),
            base_version,
        })
        .await?;

        let mut entities = self.inner.entities.lock();
        let entity = entities
            .get_mut(id)
            .ok_or_else(|| TransportError::NotFound(id.to_string()))?;
        Self::check_version(entity, base_version)?;
        entity.version += 1;
        entity.data = payload.clone();
        Ok(entity.clone())
    }

    async fn delete(
        &self,
        _entity_type: EntityType,
        id: &str,
        base_version: Option<u64>,
    ) -> Result<(), TransportError> {
        self.receive(Call::Delete {
            id: id.to_string(),
            base_version,
        })
        .await?;

        let mut entities = self.inner.entities.lock();
        let entity = entities
            .get(id)
            .ok_or_else(|| TransportError::NotFound(id.to_string()))?;
        Self::check_version(entity, base_version)?;
        entities.remove(id);
        Ok(())
    }
}

// ============================================================================
// Clock
// ============================================================================

/// Test clock that only moves when told to
///
/// In auto-advance mode `sleep` moves time forward by the requested amount
/// and returns immediately. Otherwise sleepers park until `advance` passes
/// their deadline.
#[derive(Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualClockInner>>,
}

struct ManualClockInner {
    now: DateTime<Utc>,
    auto_advance: bool,
    sleepers: Vec<(DateTime<Utc>, oneshot::Sender<()>)>,
    slept: Vec<Duration>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self::build(start, false)
    }

    /// Clock whose sleeps complete instantly by advancing time
    pub fn auto_advance(start: DateTime<Utc>) -> Self {
        Self::build(start, true)
    }

    fn build(start: DateTime<Utc>, auto_advance: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualClockInner {
                now: start,
                auto_advance,
                sleepers: Vec::new(),
                slept: Vec::new(),
            })),
        }
    }

    /// Move time forward, waking every sleeper whose deadline passed
    pub fn advance(&self, duration: Duration) {
        let woken = {
            let mut inner = self.inner.lock();
            inner.now = inner.now + to_chrono(duration);
            let now = inner.now;
            let (due, pending): (Vec<_>, Vec<_>) = inner
                .sleepers
                .drain(..)
                .partition(|(deadline, _)| *deadline <= now);
            inner.sleepers = pending;
            due
        };

        for (_, tx) in woken {
            let _ = tx.send(());
        }
    }

    /// Every delay requested so far, in order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.inner.lock().slept.clone()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.inner.lock().now
    }

    async fn sleep(&self, duration: Duration) {
        let rx = {
            let mut inner = self.inner.lock();
            inner.slept.push(duration);
            if inner.auto_advance || duration.is_zero() {
                inner.now = inner.now + to_chrono(duration);
                None
            } else {
                let (tx, rx) = oneshot::channel();
                let deadline = inner.now + to_chrono(duration);
                inner.sleepers.push((deadline, tx));
                Some(rx)
            }
        };

        match rx {
            Some(rx) => {
                let _ = rx.await;
            }
            None => tokio::task::yield_now().await,
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}

mod tests {
    use super::*;

    #[tokio::test]
    async fn test_auto_advance_moves_time() {
        let start = Utc::now();
        let clock = ManualClock::auto_advance(start);

        clock.sleep(Duration::from_secs(2)).await;
        clock.sleep(Duration::from_secs(4)).await;

        assert_eq!(clock.now() - start, chrono::Duration::seconds(6));
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(2), Duration::from_secs(4)]
        );
    }

    #[tokio::test]
    async fn test_manual_sleep_waits_for_advance() {
        let clock = ManualClock::new(Utc::now());
        let sleeper = clock.clone();
        let handle = tokio::spawn(async move {
            sleeper.sleep(Duration::from_secs(10)).await;
        });

        tokio::task::yield_now().await;
        clock.advance(Duration::from_secs(5));
        tokio::task::yield_now().await;
        assert!(!handle.is_finished());

        clock.advance(Duration::from_secs(5));
        handle.await.unwrap();
    }
}
