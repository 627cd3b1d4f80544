//! Resource collaborator interfaces.
//!
//! A `ConnectionFactory` opens physical connections; a `Connection` runs
//! statements, advances cursors and controls transactions. Every method takes
//! `&mut self`, so a connection never has more than one call outstanding.

use crate::config::PoolConfig;
use crate::error::DbResult;
use crate::models::{ColumnMetadata, Row, StatementKind, Value};
use std::future::Future;

/// Opaque server-side cursor identifier, unique per connection.
pub type CursorId = u64;

/// Outcome of executing a statement on a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecOutcome {
    /// Number of rows changed by an update-kind statement.
    Updated(u64),
    /// An open cursor over a query result, with its resolved column metadata.
    Cursor {
        cursor: CursorId,
        columns: Vec<ColumnMetadata>,
    },
}

/// One live resource connection.
pub trait Connection: Send + 'static {
    /// Run a statement. Query-kind statements open a cursor; update-kind
    /// statements report the number of changed rows.
    fn execute(
        &mut self,
        sql: &str,
        params: &[Value],
        kind: StatementKind,
    ) -> impl Future<Output = DbResult<ExecOutcome>> + Send;

    /// Run an insert and return the key generated for the new row.
    fn execute_for_key(
        &mut self,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = DbResult<i64>> + Send;

    /// Fetch up to `max_rows` rows. An empty chunk signals exhaustion.
    fn fetch_next(
        &mut self,
        cursor: CursorId,
        max_rows: usize,
    ) -> impl Future<Output = DbResult<Vec<Row>>> + Send;

    /// Release a cursor. Closing an unknown or exhausted cursor is a no-op.
    fn close_cursor(&mut self, cursor: CursorId) -> impl Future<Output = DbResult<()>> + Send;

    /// Disable auto-commit and open a transaction.
    fn begin(&mut self) -> impl Future<Output = DbResult<()>> + Send;

    fn commit(&mut self) -> impl Future<Output = DbResult<()>> + Send;

    fn rollback(&mut self) -> impl Future<Output = DbResult<()>> + Send;

    /// Close the physical connection.
    fn close(self) -> impl Future<Output = DbResult<()>> + Send
    where
        Self: Sized;

    /// False once the connection is known to be unusable.
    fn is_valid(&self) -> bool {
        true
    }
}

/// Creates connections for a pool.
pub trait ConnectionFactory: Send + Sync + Sized + 'static {
    type Connection: Connection;

    /// Open a new connection. Failures surface as `DbError::Connection`.
    fn connect(
        &self,
        config: &PoolConfig,
    ) -> impl Future<Output = DbResult<Self::Connection>> + Send;

    /// Produce an independent factory for a reconfigured pool. The result must
    /// share no connection state with `self`.
    fn reconfigure(&self, config: &PoolConfig) -> DbResult<Self>;

    /// True when connections target an embedded resource instead of a remote one.
    fn is_in_memory(&self) -> bool;
}
