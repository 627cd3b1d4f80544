//! Adapter for synchronous drivers.
//!
//! Implement `BlockingFactory`/`BlockingConnection` for a driver whose calls
//! block the thread, and wrap it in `BlockingAdapter`. Every call then runs on
//! tokio's blocking thread pool, so a slow remote call suspends only the task
//! that issued it.

use crate::config::PoolConfig;
use crate::db::connection::{Connection, ConnectionFactory, CursorId, ExecOutcome};
use crate::error::{DbError, DbResult};
use crate::models::{Row, StatementKind, Value};
use std::sync::Arc;
use tracing::warn;

/// A connection whose calls block the current thread.
pub trait BlockingConnection: Send + 'static {
    fn execute(&mut self, sql: &str, params: &[Value], kind: StatementKind) -> DbResult<ExecOutcome>;

    fn execute_for_key(&mut self, sql: &str, params: &[Value]) -> DbResult<i64>;

    fn fetch_next(&mut self, cursor: CursorId, max_rows: usize) -> DbResult<Vec<Row>>;

    fn close_cursor(&mut self, cursor: CursorId) -> DbResult<()>;

    fn begin(&mut self) -> DbResult<()>;

    fn commit(&mut self) -> DbResult<()>;

    fn rollback(&mut self) -> DbResult<()>;

    fn close(self) -> DbResult<()>
    where
        Self: Sized;
}

/// A factory whose connect call blocks the current thread.
pub trait BlockingFactory: Send + Sync + 'static {
    type Connection: BlockingConnection;

    fn connect(&self, config: &PoolConfig) -> DbResult<Self::Connection>;

    fn reconfigure(&self, config: &PoolConfig) -> DbResult<Self>
    where
        Self: Sized;

    fn is_in_memory(&self) -> bool {
        false
    }
}

/// Runs a blocking factory or connection on the blocking thread pool.
pub struct BlockingAdapter<T> {
    inner: Arc<T>,
}

impl<T> BlockingAdapter<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }
}

impl<B: BlockingFactory> ConnectionFactory for BlockingAdapter<B> {
    type Connection = BlockingHandle<B::Connection>;

    async fn connect(&self, config: &PoolConfig) -> DbResult<Self::Connection> {
        let factory = self.inner.clone();
        let config = config.clone();
        let conn = tokio::task::spawn_blocking(move || factory.connect(&config))
            .await
            .map_err(|e| DbError::connection(format!("connection task failed: {}", e)))??;
        Ok(BlockingHandle { conn: Some(conn) })
    }

    fn reconfigure(&self, config: &PoolConfig) -> DbResult<Self> {
        Ok(Self::new(self.inner.reconfigure(config)?))
    }

    fn is_in_memory(&self) -> bool {
        self.inner.is_in_memory()
    }
}

/// A blocking connection driven from async code.
///
/// The connection moves onto a blocking thread for each call and comes back
/// with the result. If that thread panics the connection is lost, and the
/// handle reports itself invalid so the pool discards it.
pub struct BlockingHandle<C> {
    conn: Option<C>,
}

impl<C: BlockingConnection> BlockingHandle<C> {
    async fn with_connection<R, F>(&mut self, f: F) -> DbResult<R>
    where
        F: FnOnce(&mut C) -> DbResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self
            .conn
            .take()
            .ok_or_else(|| DbError::connection("Connection lost in a failed blocking call"))?;
        let join = tokio::task::spawn_blocking(move || {
            let mut conn = conn;
            let result = f(&mut conn);
            (conn, result)
        })
        .await;

        match join {
            Ok((conn, result)) => {
                self.conn = Some(conn);
                result
            }
            Err(e) => {
                warn!(error = %e, "Blocking call failed; connection lost");
                Err(DbError::connection(format!("blocking task failed: {}", e)))
            }
        }
    }
}

impl<C: BlockingConnection> Connection for BlockingHandle<C> {
    async fn execute(
        &mut self,
        sql: &str,
        params: &[Value],
        kind: StatementKind,
    ) -> DbResult<ExecOutcome> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_connection(move |conn| conn.execute(&sql, &params, kind))
            .await
    }

    async fn execute_for_key(&mut self, sql: &str, params: &[Value]) -> DbResult<i64> {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_connection(move |conn| conn.execute_for_key(&sql, &params))
            .await
    }

    async fn fetch_next(&mut self, cursor: CursorId, max_rows: usize) -> DbResult<Vec<Row>> {
        self.with_connection(move |conn| conn.fetch_next(cursor, max_rows))
            .await
    }

    async fn close_cursor(&mut self, cursor: CursorId) -> DbResult<()> {
        self.with_connection(move |conn| conn.close_cursor(cursor))
            .await
    }

    async fn begin(&mut self) -> DbResult<()> {
        self.with_connection(|conn| conn.begin()).await
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.with_connection(|conn| conn.commit()).await
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.with_connection(|conn| conn.rollback()).await
    }

    async fn close(mut self) -> DbResult<()> {
        match self.conn.take() {
            Some(conn) => tokio::task::spawn_blocking(move || conn.close())
                .await
                .map_err(|e| DbError::connection(format!("close task failed: {}", e)))?,
            None => Ok(()),
        }
    }

    fn is_valid(&self) -> bool {
        self.conn.is_some()
    }
}
