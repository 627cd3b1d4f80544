//! Statement execution.
//!
//! A `Statement` is created by executing command text on a leased connection.
//! Query statements hold an open cursor; update statements hold an update
//! count. Statements run through the pool own their lease and give it back
//! when closed; statements run on a `PooledConnection` borrow it.

use crate::db::connection::{Connection, ConnectionFactory, CursorId, ExecOutcome};
use crate::db::pool::{Pool, PooledConnection};
use crate::db::sql;
use crate::db::stream::RowStream;
use crate::error::{DbError, DbResult};
use crate::models::{
    ColumnMetadata, Record, Row, StatementKind, StatementState, StreamOptions, Value, to_record,
};
use std::time::Instant;
use tracing::{debug, warn};

/// How a statement holds its connection.
pub(crate) enum Lease<'a, F: ConnectionFactory> {
    Owned(Option<PooledConnection<F>>),
    Borrowed(&'a mut PooledConnection<F>),
}

impl<F: ConnectionFactory> Lease<'_, F> {
    fn handle(&mut self) -> DbResult<&mut PooledConnection<F>> {
        match self {
            Lease::Owned(Some(handle)) => Ok(handle),
            Lease::Owned(None) => Err(DbError::connection("Lease already returned to the pool")),
            Lease::Borrowed(handle) => Ok(handle),
        }
    }

    fn give_back(&mut self) {
        if let Lease::Owned(slot) = self {
            if let Some(handle) = slot.take() {
                handle.release();
            }
        }
    }
}

/// An executed statement.
pub struct Statement<'a, F: ConnectionFactory> {
    lease: Lease<'a, F>,
    sql: String,
    kind: StatementKind,
    state: StatementState,
    columns: Vec<ColumnMetadata>,
    cursor: Option<CursorId>,
    updated: u64,
}

impl<F: ConnectionFactory> std::fmt::Debug for Statement<'_, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement")
            .field("sql", &self.sql)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("columns", &self.columns.len())
            .finish()
    }
}

impl<'a, F: ConnectionFactory> Statement<'a, F> {
    pub(crate) async fn open(mut lease: Lease<'a, F>, sql: &str, params: &[Value]) -> DbResult<Self> {
        let kind = sql::classify(sql);
        let start = Instant::now();
        let outcome = match Self::run(&mut lease, sql, params, kind).await {
            Ok(outcome) => outcome,
            Err(e) => {
                lease.give_back();
                return Err(e);
            }
        };

        let mut statement = Self {
            lease,
            sql: sql.to_string(),
            kind,
            state: StatementState::Open,
            columns: Vec::new(),
            cursor: None,
            updated: 0,
        };
        match outcome {
            ExecOutcome::Updated(count) => {
                debug!(rows_affected = count, elapsed_ms = start.elapsed().as_millis() as u64, "Update executed");
                statement.updated = count;
            }
            ExecOutcome::Cursor { cursor, columns } => {
                debug!(cursor, columns = columns.len(), elapsed_ms = start.elapsed().as_millis() as u64, "Cursor opened");
                statement.lease.handle()?.open_cursors.push(cursor);
                statement.cursor = Some(cursor);
                statement.columns = columns;
            }
        }
        Ok(statement)
    }

    async fn run(
        lease: &mut Lease<'a, F>,
        sql: &str,
        params: &[Value],
        kind: StatementKind,
    ) -> DbResult<ExecOutcome> {
        sql::check_binding(sql, params.len())?;
        let handle = lease.handle()?;
        handle.sweep_cursors().await?;
        debug!(
            connection_id = handle.id(),
            sql = %sql,
            params = params.len(),
            kind = ?kind,
            "Executing statement"
        );
        handle.conn()?.execute(sql, params, kind).await
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }

    pub fn is_query(&self) -> bool {
        self.kind == StatementKind::Query
    }

    pub fn state(&self) -> StatementState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == StatementState::Closed
    }

    /// Column metadata of a query result, resolved at execute time. Empty for
    /// update statements.
    pub fn metadata(&self) -> &[ColumnMetadata] {
        &self.columns
    }

    /// Number of rows changed by an update statement.
    pub fn updated(&self) -> DbResult<u64> {
        if self.is_query() {
            return Err(DbError::usage("updated() is only valid for update statements"));
        }
        Ok(self.updated)
    }

    /// Read every remaining row, then close the statement.
    pub async fn as_array(&mut self) -> DbResult<Vec<Row>> {
        self.ensure_open("as_array")?;
        let mut rows = Vec::new();
        loop {
            let chunk = self.fetch_chunk(StreamOptions::default().buffer_size).await?;
            if chunk.is_empty() {
                break;
            }
            rows.extend(chunk);
        }
        Ok(rows)
    }

    /// Like `as_array`, keying each row by column label.
    pub async fn as_records(&mut self) -> DbResult<Vec<Record>> {
        let rows = self.as_array().await?;
        Ok(rows
            .into_iter()
            .map(|row| to_record(&self.columns, row))
            .collect())
    }

    /// Turn a query statement into a pull-driven row stream.
    pub fn as_stream(mut self, options: StreamOptions) -> DbResult<RowStream<'a, F>> {
        self.ensure_open("as_stream")?;
        if !self.is_query() {
            return Err(DbError::usage("as_stream() is only valid for query statements"));
        }
        self.state = StatementState::Streaming;
        Ok(RowStream::new(self, options))
    }

    fn ensure_open(&self, operation: &str) -> DbResult<()> {
        if self.is_closed() {
            return Err(DbError::statement_closed(operation));
        }
        Ok(())
    }

    /// Fetch up to `max_rows` rows. An empty chunk means the cursor is
    /// exhausted and the statement is now closed. A failed fetch closes the
    /// statement before the error is returned.
    pub(crate) async fn fetch_chunk(&mut self, max_rows: usize) -> DbResult<Vec<Row>> {
        self.ensure_open("fetch")?;
        let Some(cursor) = self.cursor else {
            // Update statements have no rows
            self.close().await?;
            return Ok(Vec::new());
        };

        let result = match self.lease.handle() {
            Ok(handle) => match handle.conn() {
                Ok(conn) => conn.fetch_next(cursor, max_rows).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match result {
            Ok(rows) if rows.is_empty() => {
                debug!(cursor, "Cursor exhausted");
                self.close().await?;
                Ok(rows)
            }
            Ok(rows) => {
                debug!(cursor, rows = rows.len(), "Fetched chunk");
                Ok(rows)
            }
            Err(e) => {
                warn!(cursor, error = %e, "Fetch failed; closing statement");
                if let Err(close_err) = self.close().await {
                    debug!(error = %close_err, "Cursor close after failed fetch also failed");
                }
                Err(e)
            }
        }
    }

    /// Release the cursor and, for pool-owned statements, the lease.
    ///
    /// Calling `close` on a closed statement is a no-op.
    pub async fn close(&mut self) -> DbResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.state = StatementState::Closed;

        let mut result = Ok(());
        if let Some(cursor) = self.cursor.take() {
            if let Ok(handle) = self.lease.handle() {
                handle.forget_cursor(cursor);
                let closed = match handle.conn() {
                    Ok(conn) => conn.close_cursor(cursor).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = closed {
                    handle.broken = true;
                    result = Err(e);
                }
            }
            debug!(cursor, "Statement closed");
        }
        self.lease.give_back();
        result
    }
}

impl<F: ConnectionFactory> Drop for Statement<'_, F> {
    fn drop(&mut self) {
        // An open cursor stays registered on the connection and is swept
        // before its next use.
        self.lease.give_back();
    }
}

impl<F: ConnectionFactory> PooledConnection<F> {
    /// Execute a statement on this connection.
    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> DbResult<Statement<'_, F>> {
        Statement::open(Lease::Borrowed(self), sql, params).await
    }

    /// Run a query and return every row keyed by column label.
    pub async fn query(&mut self, sql: &str, params: &[Value]) -> DbResult<Vec<Record>> {
        let mut statement = self.execute(sql, params).await?;
        if !statement.is_query() {
            statement.close().await?;
            return Ok(Vec::new());
        }
        statement.as_records().await
    }

    /// Run an update and return the number of changed rows.
    pub async fn update(&mut self, sql: &str, params: &[Value]) -> DbResult<u64> {
        let mut statement = self.execute(sql, params).await?;
        let count = if statement.is_query() {
            0
        } else {
            statement.updated()?
        };
        statement.close().await?;
        Ok(count)
    }

    /// Run an insert and return the generated key.
    pub async fn insert_and_get_id(&mut self, sql: &str, params: &[Value]) -> DbResult<i64> {
        sql::check_binding(sql, params.len())?;
        self.sweep_cursors().await?;
        debug!(connection_id = self.id(), sql = %sql, params = params.len(), "Executing insert for generated key");
        let key = self.conn()?.execute_for_key(sql, params).await?;
        debug!(connection_id = self.id(), key, "Generated key returned");
        Ok(key)
    }
}

impl<F: ConnectionFactory> Pool<F> {
    /// Execute a statement on a fresh lease. The statement owns the lease and
    /// returns it to the pool when closed, exhausted or dropped.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> DbResult<Statement<'static, F>> {
        sql::check_binding(sql, params.len())?;
        let handle = self.acquire().await?;
        Statement::open(Lease::Owned(Some(handle)), sql, params).await
    }

    /// Run a query and return every row keyed by column label.
    pub async fn query(&self, sql: &str, params: &[Value]) -> DbResult<Vec<Record>> {
        let mut handle = self.acquire().await?;
        let result = handle.query(sql, params).await;
        handle.release();
        result
    }

    /// Run an update and return the number of changed rows.
    pub async fn update(&self, sql: &str, params: &[Value]) -> DbResult<u64> {
        let mut handle = self.acquire().await?;
        let result = handle.update(sql, params).await;
        handle.release();
        result
    }

    /// Run an insert and return the generated key.
    pub async fn insert_and_get_id(&self, sql: &str, params: &[Value]) -> DbResult<i64> {
        let mut handle = self.acquire().await?;
        let result = handle.insert_and_get_id(sql, params).await;
        handle.release();
        result
    }
}
