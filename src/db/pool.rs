//! Connection pool management.
//!
//! The pool owns a bounded set of connections produced by a `ConnectionFactory`.
//! Callers lease a `PooledConnection`, use it exclusively, and give it back with
//! `Pool::release` (or by dropping it). Capacity is enforced with a fair
//! semaphore, so callers blocked at capacity resume in FIFO order.

use crate::config::{PoolConfig, PoolOptions};
use crate::db::connection::{Connection, ConnectionFactory, CursorId};
use crate::error::{DbError, DbResult};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

struct IdleConnection<C> {
    id: u64,
    conn: C,
    last_used: Instant,
    /// Cursors left open by the previous lease holder.
    stale_cursors: Vec<CursorId>,
}

struct PoolState<C> {
    idle: Vec<IdleConnection<C>>,
    leased: HashSet<u64>,
    closed: bool,
}

pub(crate) struct PoolInner<F: ConnectionFactory> {
    id: Uuid,
    factory: F,
    config: PoolConfig,
    state: Mutex<PoolState<F::Connection>>,
    semaphore: Arc<Semaphore>,
    next_connection_id: AtomicU64,
}

impl<F: ConnectionFactory> PoolInner<F> {
    fn lock_state(&self) -> DbResult<MutexGuard<'_, PoolState<F::Connection>>> {
        self.state
            .lock()
            .map_err(|e| DbError::connection(format!("Pool state lock poisoned: {}", e)))
    }

    async fn acquire_permit(&self) -> DbResult<OwnedSemaphorePermit> {
        let acquire = self.semaphore.clone().acquire_owned();
        let result = match self.config.acquire_timeout {
            Some(deadline) => match tokio::time::timeout(deadline, acquire).await {
                Ok(result) => result,
                Err(_) => {
                    debug!(pool_id = %self.id, waited_ms = deadline.as_millis() as u64, "Acquire deadline exceeded");
                    return Err(DbError::pool_exhausted(
                        self.config.max_size,
                        deadline.as_millis() as u64,
                    ));
                }
            },
            None => acquire.await,
        };
        result.map_err(|_| DbError::connection("Connection pool is closed"))
    }

    /// Take one idle connection, splitting off any that outlived the idle timeout.
    fn take_idle(
        &self,
    ) -> DbResult<(
        Option<IdleConnection<F::Connection>>,
        Vec<IdleConnection<F::Connection>>,
    )> {
        let mut state = self.lock_state()?;
        if state.closed {
            return Err(DbError::connection("Connection pool is closed"));
        }

        let mut expired = Vec::new();
        let idle_timeout = self.config.idle_timeout;
        if !idle_timeout.is_zero() {
            let now = Instant::now();
            let (stale, fresh): (Vec<_>, Vec<_>) = state
                .idle
                .drain(..)
                .partition(|entry| now.duration_since(entry.last_used) >= idle_timeout);
            state.idle = fresh;
            expired = stale;
        }

        Ok((state.idle.pop(), expired))
    }

    fn mark_leased(&self, id: u64) -> DbResult<()> {
        let mut state = self.lock_state()?;
        if state.closed {
            return Err(DbError::connection("Connection pool is closed"));
        }
        state.leased.insert(id);
        Ok(())
    }

    fn is_leased(&self, id: u64) -> bool {
        self.lock_state()
            .map(|state| state.leased.contains(&id))
            .unwrap_or(false)
    }

    /// Return a connection to the idle set, or discard it.
    fn check_in(&self, id: u64, conn: F::Connection, stale_cursors: Vec<CursorId>, reusable: bool) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => {
                warn!(pool_id = %self.id, connection_id = id, "Pool state lock poisoned; discarding connection");
                return;
            }
        };
        state.leased.remove(&id);

        if !reusable || state.closed || !conn.is_valid() {
            drop(state);
            warn!(
                pool_id = %self.id,
                connection_id = id,
                "Discarding connection instead of returning it to the pool"
            );
            self.close_detached(id, conn);
            return;
        }

        state.idle.push(IdleConnection {
            id,
            conn,
            last_used: Instant::now(),
            stale_cursors,
        });
        debug!(pool_id = %self.id, connection_id = id, idle = state.idle.len(), "Connection returned to pool");
    }

    /// Close a discarded connection on the runtime. Check-in runs from `Drop`,
    /// so it cannot await the close itself.
    fn close_detached(&self, id: u64, conn: F::Connection) {
        let pool_id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = conn.close().await {
                        warn!(pool_id = %pool_id, connection_id = id, error = %e, "Failed to close discarded connection");
                    }
                });
            }
            Err(_) => {
                warn!(pool_id = %pool_id, connection_id = id, "No runtime to close discarded connection; dropping it");
            }
        }
    }

    async fn discard_all(&self, entries: Vec<IdleConnection<F::Connection>>) {
        for entry in entries {
            debug!(pool_id = %self.id, connection_id = entry.id, "Closing idle connection");
            if let Err(e) = entry.conn.close().await {
                warn!(pool_id = %self.id, connection_id = entry.id, error = %e, "Failed to close connection");
            }
        }
    }
}

/// A bounded pool of connections.
///
/// Cloning a `Pool` yields another reference to the same pool; use
/// [`Pool::configure`] for an independent one.
pub struct Pool<F: ConnectionFactory> {
    pub(crate) inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.inner.id)
            .field("config", &self.inner.config)
            .field("in_memory", &self.inner.factory.is_in_memory())
            .finish()
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub max_size: usize,
    pub idle: usize,
    pub leased: usize,
    pub closed: bool,
}

impl<F: ConnectionFactory> Pool<F> {
    /// Create a pool. No connection is opened until the first acquire.
    pub fn new(factory: F, config: PoolConfig) -> DbResult<Self> {
        if config.max_size == 0 {
            return Err(DbError::config("max_size must be greater than 0"));
        }
        let id = Uuid::new_v4();
        info!(
            pool_id = %id,
            max_size = config.max_size,
            idle_timeout_ms = config.idle_timeout.as_millis() as u64,
            in_memory = factory.is_in_memory(),
            "Connection pool created"
        );
        Ok(Self {
            inner: Arc::new(PoolInner {
                id,
                semaphore: Arc::new(Semaphore::new(config.max_size)),
                factory,
                config,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    leased: HashSet::new(),
                    closed: false,
                }),
                next_connection_id: AtomicU64::new(1),
            }),
        })
    }

    /// Create a new, independent pool with `opts` overlaid on this pool's
    /// configuration. The receiver is left untouched.
    pub fn configure(&self, opts: &PoolOptions) -> DbResult<Self> {
        let config = self.inner.config.merge(opts)?;
        let factory = self.inner.factory.reconfigure(&config)?;
        Self::new(factory, config)
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn is_in_memory(&self) -> bool {
        self.inner.factory.is_in_memory()
    }

    #[cfg(test)]
    pub(crate) fn inner_factory(&self) -> &F {
        &self.inner.factory
    }

    pub fn status(&self) -> PoolStatus {
        let (idle, leased, closed) = self
            .inner
            .lock_state()
            .map(|s| (s.idle.len(), s.leased.len(), s.closed))
            .unwrap_or((0, 0, true));
        PoolStatus {
            max_size: self.inner.config.max_size,
            idle,
            leased,
            closed,
        }
    }

    /// Lease a connection.
    ///
    /// Suspends while `max_size` connections are leased. Idle connections past
    /// the idle timeout are closed and replaced here rather than on a timer.
    pub async fn acquire(&self) -> DbResult<PooledConnection<F>> {
        let permit = self.inner.acquire_permit().await?;

        loop {
            let (idle, expired) = self.inner.take_idle()?;
            if !expired.is_empty() {
                warn!(pool_id = %self.inner.id, count = expired.len(), "Evicting expired idle connections");
                self.inner.discard_all(expired).await;
            }

            let Some(entry) = idle else {
                break;
            };

            let mut handle = PooledConnection::new(entry.id, entry.conn, self.inner.clone());
            handle.open_cursors = entry.stale_cursors;
            self.inner.mark_leased(handle.id)?;
            match handle.sweep_cursors().await {
                Ok(()) => {
                    handle.permit = Some(permit);
                    debug!(pool_id = %self.inner.id, connection_id = handle.id, "Leased idle connection");
                    return Ok(handle);
                }
                Err(e) => {
                    warn!(pool_id = %self.inner.id, connection_id = handle.id, error = %e, "Idle connection unusable");
                    handle.broken = true;
                    handle.finish(true);
                }
            }
        }

        let id = self.inner.next_connection_id.fetch_add(1, Ordering::SeqCst);
        debug!(pool_id = %self.inner.id, connection_id = id, "Opening new connection");
        let conn = self
            .inner
            .factory
            .connect(&self.inner.config)
            .await
            .map_err(|e| match e {
                DbError::Connection { .. } => e,
                other => DbError::connection(other.to_string()),
            })?;

        let mut handle = PooledConnection::new(id, conn, self.inner.clone());
        self.inner.mark_leased(id)?;
        handle.permit = Some(permit);
        debug!(pool_id = %self.inner.id, connection_id = id, "Leased new connection");
        Ok(handle)
    }

    /// Return a leased connection to this pool.
    ///
    /// Fails with `DbError::Usage` if the handle was not leased from this pool.
    pub fn release(&self, handle: PooledConnection<F>) -> DbResult<()> {
        if !Arc::ptr_eq(&handle.pool, &self.inner) {
            return Err(DbError::usage(format!(
                "connection {} was not leased from pool {}",
                handle.id, self.inner.id
            )));
        }
        if !self.inner.is_leased(handle.id) {
            return Err(DbError::usage(format!(
                "connection {} is not leased from pool {}",
                handle.id, self.inner.id
            )));
        }
        handle.release();
        Ok(())
    }

    /// Close the pool: idle connections are closed, waiters and future
    /// acquisitions fail, leased connections are discarded when returned.
    pub async fn close(&self) {
        let idle = match self.inner.lock_state() {
            Ok(mut state) => {
                state.closed = true;
                std::mem::take(&mut state.idle)
            }
            Err(e) => {
                warn!(pool_id = %self.inner.id, error = %e, "Closing pool with poisoned state");
                Vec::new()
            }
        };
        self.inner.semaphore.close();
        let count = idle.len();
        self.inner.discard_all(idle).await;
        info!(pool_id = %self.inner.id, closed_connections = count, "Connection pool closed");
    }
}

/// A leased connection.
///
/// Owned exclusively by the lease holder. Statements and transactions borrow it
/// mutably, so it is never used by two operations at once.
pub struct PooledConnection<F: ConnectionFactory> {
    id: u64,
    conn: Option<F::Connection>,
    pool: Arc<PoolInner<F>>,
    permit: Option<OwnedSemaphorePermit>,
    pub(crate) in_transaction: bool,
    pub(crate) open_cursors: Vec<CursorId>,
    pub(crate) broken: bool,
}

impl<F: ConnectionFactory> std::fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("pool_id", &self.pool.id)
            .field("in_transaction", &self.in_transaction)
            .field("open_cursors", &self.open_cursors.len())
            .finish()
    }
}

impl<F: ConnectionFactory> PooledConnection<F> {
    fn new(id: u64, conn: F::Connection, pool: Arc<PoolInner<F>>) -> Self {
        Self {
            id,
            conn: Some(conn),
            pool,
            permit: None,
            in_transaction: false,
            open_cursors: Vec::new(),
            broken: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn pool_id(&self) -> Uuid {
        self.pool.id
    }

    pub(crate) fn conn(&mut self) -> DbResult<&mut F::Connection> {
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::connection("Connection is no longer available"))
    }

    /// Close cursors abandoned by dropped statements.
    pub(crate) async fn sweep_cursors(&mut self) -> DbResult<()> {
        while let Some(cursor) = self.open_cursors.pop() {
            debug!(connection_id = self.id, cursor, "Closing abandoned cursor");
            if let Err(e) = self.conn()?.close_cursor(cursor).await {
                self.broken = true;
                return Err(e);
            }
        }
        Ok(())
    }

    pub(crate) fn forget_cursor(&mut self, cursor: CursorId) {
        self.open_cursors.retain(|c| *c != cursor);
    }

    /// Return this connection to the pool it was leased from.
    pub fn release(mut self) {
        self.finish(true);
    }

    pub(crate) fn finish(&mut self, explicit: bool) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if !explicit {
            warn!(
                pool_id = %self.pool.id,
                connection_id = self.id,
                "Connection dropped without release; returning it to the pool"
            );
        }
        if self.in_transaction {
            warn!(connection_id = self.id, "Connection released inside a transaction");
        }
        let reusable = !self.broken && !self.in_transaction;
        let cursors = std::mem::take(&mut self.open_cursors);
        self.pool.check_in(self.id, conn, cursors, reusable);
        // Free the slot only after the connection is back in the idle set
        self.permit.take();
        debug!(connection_id = self.id, "Lease released");
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        self.finish(false);
    }
}
