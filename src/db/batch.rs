//! Batch and list execution.
//!
//! Every batch runs on a single leased connection. Tuples are applied in input
//! order and the first failure aborts the rest of the batch.

use crate::db::connection::{Connection, ConnectionFactory, ExecOutcome};
use crate::db::pool::{Pool, PooledConnection};
use crate::db::sql;
use crate::error::{DbError, DbResult};
use crate::models::{Record, StatementKind, Value};
use tracing::{debug, warn};

impl<F: ConnectionFactory> PooledConnection<F> {
    /// Apply `sql` once per parameter tuple, returning one update count per tuple.
    ///
    /// All tuples are checked against the placeholder count before anything
    /// is sent. A failing tuple aborts the remaining ones and its error is
    /// returned; tuples already applied are not undone unless the batch runs
    /// inside a transaction.
    pub async fn batch_update(&mut self, sql: &str, tuples: &[Vec<Value>]) -> DbResult<Vec<u64>> {
        let expected = sql::count_placeholders(sql);
        if let Some((index, tuple)) = tuples
            .iter()
            .enumerate()
            .find(|(_, tuple)| tuple.len() != expected)
        {
            return Err(DbError::binding(format!(
                "batch tuple {} has {} parameter(s) but the statement has {} placeholder(s)",
                index,
                tuple.len(),
                expected
            )));
        }

        self.sweep_cursors().await?;
        debug!(connection_id = self.id(), sql = %sql, tuples = tuples.len(), "Executing batch");

        let mut counts = Vec::with_capacity(tuples.len());
        for (index, tuple) in tuples.iter().enumerate() {
            let outcome = self
                .conn()?
                .execute(sql, tuple, StatementKind::Update)
                .await
                .inspect_err(|e| {
                    warn!(tuple = index, error = %e, "Batch aborted");
                })?;
            match outcome {
                ExecOutcome::Updated(count) => counts.push(count),
                ExecOutcome::Cursor { cursor, .. } => {
                    self.conn()?.close_cursor(cursor).await?;
                    return Err(DbError::usage(
                        "batch_update requires an update statement, not a query",
                    ));
                }
            }
        }
        Ok(counts)
    }

    /// Insert each record into `table` and return the generated keys in input order.
    ///
    /// All records must have the same field set. One parameterized insert is
    /// built from those fields and executed once per record.
    pub async fn insert_list(
        &mut self,
        table: &str,
        key_column: &str,
        records: &[Record],
    ) -> DbResult<Vec<i64>> {
        sql::validate_identifier(key_column)?;
        let Some(first) = records.first() else {
            return Ok(Vec::new());
        };
        let columns: Vec<&str> = first.keys().map(String::as_str).collect();
        for (index, record) in records.iter().enumerate().skip(1) {
            if !record.keys().map(String::as_str).eq(columns.iter().copied()) {
                return Err(DbError::binding(format!(
                    "record {} has fields [{}] but record 0 has [{}]",
                    index,
                    record.keys().cloned().collect::<Vec<_>>().join(", "),
                    columns.join(", ")
                )));
            }
        }
        let sql = sql::insert_statement(table, &columns)?;

        self.sweep_cursors().await?;
        debug!(
            connection_id = self.id(),
            table = %table,
            key_column = %key_column,
            records = records.len(),
            "Inserting record list"
        );

        let mut keys = Vec::with_capacity(records.len());
        for record in records {
            let params: Vec<Value> = record.values().cloned().collect();
            keys.push(self.conn()?.execute_for_key(&sql, &params).await?);
        }
        Ok(keys)
    }
}

impl<F: ConnectionFactory> Pool<F> {
    /// Run a batch on one leased connection.
    pub async fn batch_update(&self, sql: &str, tuples: &[Vec<Value>]) -> DbResult<Vec<u64>> {
        let mut handle = self.acquire().await?;
        let result = handle.batch_update(sql, tuples).await;
        handle.release();
        result
    }

    /// Insert a list of records on one leased connection.
    pub async fn insert_list(
        &self,
        table: &str,
        key_column: &str,
        records: &[Record],
    ) -> DbResult<Vec<i64>> {
        let mut handle = self.acquire().await?;
        let result = handle.insert_list(table, key_column, records).await;
        handle.release();
        result
    }

    /// Open a batched writer for `sql` that flushes every `buffer_size` tuples.
    pub async fn create_write_stream(&self, sql: &str, buffer_size: usize) -> DbResult<BatchWriter<F>> {
        let handle = self.acquire().await?;
        Ok(BatchWriter::new(handle, sql, buffer_size))
    }
}

/// Buffers parameter tuples and applies them in batches on one leased connection.
pub struct BatchWriter<F: ConnectionFactory> {
    handle: Option<PooledConnection<F>>,
    sql: String,
    placeholders: usize,
    buffer_size: usize,
    pending: Vec<Vec<Value>>,
    written: u64,
}

impl<F: ConnectionFactory> BatchWriter<F> {
    pub fn new(handle: PooledConnection<F>, sql: &str, buffer_size: usize) -> Self {
        let buffer_size = buffer_size.max(1);
        Self {
            handle: Some(handle),
            sql: sql.to_string(),
            placeholders: sql::count_placeholders(sql),
            buffer_size,
            pending: Vec::with_capacity(buffer_size),
            written: 0,
        }
    }

    /// Rows changed by the batches flushed so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Queue one tuple, flushing when the buffer is full.
    pub async fn write(&mut self, tuple: Vec<Value>) -> DbResult<()> {
        if self.handle.is_none() {
            return Err(DbError::statement_closed("write"));
        }
        if tuple.len() != self.placeholders {
            return Err(DbError::binding(format!(
                "tuple has {} parameter(s) but the statement has {} placeholder(s)",
                tuple.len(),
                self.placeholders
            )));
        }
        self.pending.push(tuple);
        if self.pending.len() >= self.buffer_size {
            self.flush().await?;
        }
        Ok(())
    }

    /// Apply every queued tuple now.
    pub async fn flush(&mut self) -> DbResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let Some(handle) = self.handle.as_mut() else {
            return Err(DbError::statement_closed("flush"));
        };
        let tuples = std::mem::take(&mut self.pending);
        match handle.batch_update(&self.sql, &tuples).await {
            Ok(counts) => {
                self.written += counts.iter().sum::<u64>();
                Ok(())
            }
            Err(e) => {
                // A failed writer accepts no more input
                if let Some(handle) = self.handle.take() {
                    handle.release();
                }
                Err(e)
            }
        }
    }

    /// Flush the remainder, return the connection and report the total count.
    pub async fn finish(mut self) -> DbResult<u64> {
        self.flush().await?;
        if let Some(handle) = self.handle.take() {
            handle.release();
        }
        Ok(self.written)
    }
}

impl<F: ConnectionFactory> Drop for BatchWriter<F> {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            warn!(pending = self.pending.len(), "Batch writer dropped with unflushed tuples");
        }
        if let Some(handle) = self.handle.take() {
            handle.release();
        }
    }
}
