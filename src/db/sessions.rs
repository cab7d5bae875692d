// Connection Registry
// One live session per canonical connection string. Concurrent opens of the
// same key share a single in-flight attempt; a failed attempt leaves no entry.

use crate::db::descriptor::{ConnectionDescriptor, ConnectionKey};
use crate::db::error::DatabaseError;
use crate::db::registry::DriverRegistry;
use crate::db::traits::{Connection, DatabaseDriver, DatabaseFamily, NativeResult, QueryParam};
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

type OpenResult = Result<Arc<Session>, DatabaseError>;
type PendingOpen = Shared<BoxFuture<'static, OpenResult>>;

enum Slot {
    /// Open in flight; every caller for the key awaits the same future
    Opening(PendingOpen),
    Ready(Arc<Session>),
}

/// An open session: the driver handle plus bookkeeping
pub struct Session {
    id: Uuid,
    key: ConnectionKey,
    family: DatabaseFamily,
    target: String,
    connection: Box<dyn Connection>,
    driver: Arc<dyn DatabaseDriver>,
    opened_at: DateTime<Utc>,
    last_used: Mutex<Instant>,
}

impl Session {
    fn new(
        descriptor: &ConnectionDescriptor,
        connection: Box<dyn Connection>,
        driver: Arc<dyn DatabaseDriver>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            key: descriptor.key(),
            family: descriptor.family(),
            target: descriptor.redacted(),
            connection,
            driver,
            opened_at: Utc::now(),
            last_used: Mutex::new(Instant::now()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    pub fn family(&self) -> DatabaseFamily {
        self.family
    }

    /// Connection string with credentials masked
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    /// Run a statement or command on this session
    pub async fn execute(
        &self,
        text: &str,
        params: &[QueryParam],
    ) -> Result<NativeResult, DatabaseError> {
        self.touch();
        let result = self
            .driver
            .execute(self.connection.as_ref(), text, params)
            .await;
        self.touch();
        result
    }

    pub async fn is_alive(&self) -> bool {
        self.connection.is_alive().await
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.to_string(),
            family: self.family,
            target: self.target.clone(),
            driver: self.driver.driver_name().to_string(),
            opened_at: self.opened_at,
            idle_secs: self.idle_for().as_secs(),
        }
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Best-effort close; failures are logged and swallowed
    async fn shutdown(&self) {
        match self.driver.close(self.connection.as_ref()).await {
            Ok(()) => info!("Closed session {} ({})", self.id, self.target),
            Err(e) => warn!("Error while closing session {} ({}): {}", self.id, self.target, e),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("family", &self.family)
            .field("target", &self.target)
            .finish()
    }
}

/// Snapshot of an open session for listing
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub family: DatabaseFamily,
    pub target: String,
    pub driver: String,
    pub opened_at: DateTime<Utc>,
    pub idle_secs: u64,
}

struct Inner {
    drivers: Arc<DriverRegistry>,
    slots: Mutex<HashMap<ConnectionKey, Slot>>,
}

impl Inner {
    // The map is never held across an await, so a poisoned lock still holds
    // consistent data.
    fn slots(&self) -> MutexGuard<'_, HashMap<ConnectionKey, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Process-wide table of open sessions
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Inner>,
}

impl ConnectionRegistry {
    pub fn new(drivers: Arc<DriverRegistry>) -> Self {
        Self {
            inner: Arc::new(Inner {
                drivers,
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Return the session for `descriptor`, opening it if needed.
    ///
    /// At most one open per key is ever in flight. Callers arriving while an
    /// open is pending get that open's outcome, success or failure.
    pub async fn resolve(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Arc<Session>, DatabaseError> {
        let key = descriptor.key();

        if let Some(session) = self.get(&key) {
            return Ok(session);
        }

        let driver = self.inner.drivers.get_driver(descriptor.family())?;

        let pending = {
            let mut slots = self.inner.slots();
            match slots.get(&key) {
                Some(Slot::Ready(session)) => {
                    session.touch();
                    return Ok(Arc::clone(session));
                }
                Some(Slot::Opening(pending)) => pending.clone(),
                None => {
                    debug!("Opening session for {}", key);
                    let pending = self.start_open(key.clone(), descriptor.clone(), driver);
                    slots.insert(key, Slot::Opening(pending.clone()));
                    pending
                }
            }
        };

        pending.await
    }

    /// The ready session for `key`, if any. Never opens.
    pub fn get(&self, key: &ConnectionKey) -> Option<Arc<Session>> {
        match self.inner.slots().get(key) {
            Some(Slot::Ready(session)) => {
                session.touch();
                Some(Arc::clone(session))
            }
            _ => None,
        }
    }

    /// Close and forget the session for `key`. Returns whether one existed.
    ///
    /// A pending open is allowed to settle first, so a close racing a load
    /// closes the freshly opened session instead of leaking it.
    pub async fn release(&self, key: &ConnectionKey) -> bool {
        let session = loop {
            let pending = {
                let mut slots = self.inner.slots();
                let pending = match slots.get(key) {
                    None => return false,
                    Some(Slot::Opening(pending)) => Some(pending.clone()),
                    Some(Slot::Ready(_)) => None,
                };
                match pending {
                    Some(pending) => pending,
                    None => match slots.remove(key) {
                        Some(Slot::Ready(session)) => break session,
                        _ => return false,
                    },
                }
            };
            let _ = pending.await;
        };

        session.shutdown().await;
        true
    }

    /// Close every session. Returns whether any existed.
    pub async fn release_all(&self) -> bool {
        let keys: Vec<ConnectionKey> = self.inner.slots().keys().cloned().collect();
        let released = futures::future::join_all(keys.iter().map(|key| self.release(key))).await;
        released.into_iter().any(|closed| closed)
    }

    /// Snapshot of the ready sessions
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .inner
            .slots()
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(session) => Some(session.info()),
                Slot::Opening(_) => None,
            })
            .collect();
        infos.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        infos
    }

    pub fn len(&self) -> usize {
        self.inner
            .slots()
            .values()
            .filter(|slot| matches!(slot, Slot::Ready(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close sessions unused for at least `max_idle`. Sessions with a query
    /// in flight are skipped. Returns the number closed.
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let expired: Vec<Arc<Session>> = {
            let mut slots = self.inner.slots();
            let keys: Vec<ConnectionKey> = slots
                .iter()
                .filter_map(|(key, slot)| match slot {
                    // Only the map holds it: nobody is using it right now
                    Slot::Ready(session)
                        if Arc::strong_count(session) == 1 && session.idle_for() >= max_idle =>
                    {
                        Some(key.clone())
                    }
                    _ => None,
                })
                .collect();
            keys.iter()
                .filter_map(|key| match slots.remove(key) {
                    Some(Slot::Ready(session)) => Some(session),
                    _ => None,
                })
                .collect()
        };

        for session in &expired {
            info!(
                "Evicting idle session {} ({}), unused for {}s",
                session.id,
                session.target,
                session.idle_for().as_secs()
            );
            session.shutdown().await;
        }
        expired.len()
    }

    /// Periodically evict idle sessions. The task ends once every handle to
    /// this registry is dropped.
    pub fn spawn_idle_reaper(&self, every: Duration, max_idle: Duration) -> JoinHandle<()> {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // First tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    debug!("Registry dropped, stopping idle reaper");
                    break;
                };
                let registry = ConnectionRegistry { inner };
                let evicted = registry.evict_idle(max_idle).await;
                if evicted > 0 {
                    debug!("Idle reaper closed {} session(s)", evicted);
                }
            }
        })
    }

    fn start_open(
        &self,
        key: ConnectionKey,
        descriptor: ConnectionDescriptor,
        driver: Arc<dyn DatabaseDriver>,
    ) -> PendingOpen {
        let inner = Arc::clone(&self.inner);
        let settle_key = key.clone();

        // Runs detached, so the slot is settled even if every waiter gives up
        let task = tokio::spawn(async move {
            let outcome = driver.connect(&descriptor).await;
            let mut slots = inner.slots();
            match outcome {
                Ok(connection) => {
                    let session = Arc::new(Session::new(&descriptor, connection, driver));
                    info!(
                        "Opened {} session {} ({})",
                        session.family.display_name(),
                        session.id,
                        session.target
                    );
                    slots.insert(settle_key, Slot::Ready(Arc::clone(&session)));
                    Ok(session)
                }
                Err(e) => {
                    warn!("Failed to open {}: {}", settle_key, e);
                    slots.remove(&settle_key);
                    Err(e)
                }
            }
        });

        let inner = Arc::clone(&self.inner);
        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    // The open task panicked or was cancelled before settling
                    let mut slots = inner.slots();
                    if matches!(slots.get(&key), Some(Slot::Opening(_))) {
                        slots.remove(&key);
                    }
                    Err(DatabaseError::internal(format!("open task failed: {}", e)))
                }
            }
        }
        .boxed()
        .shared()
    }
}
