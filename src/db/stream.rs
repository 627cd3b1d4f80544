//! Pull-driven row streams over an open cursor.

use crate::db::connection::ConnectionFactory;
use crate::db::pool::Pool;
use crate::db::statement::Statement;
use crate::error::{DbError, DbResult};
use crate::models::{ColumnMetadata, MAX_BUFFER_SIZE, Row, StreamOptions, Value};
use futures_util::stream::{self, Stream};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Cancels a `RowStream` from outside the consuming task.
#[derive(Debug, Clone)]
pub struct StreamCloser {
    cancelled: Arc<AtomicBool>,
}

impl StreamCloser {
    /// Request early termination. The consumer sees a clean end of stream on
    /// its next read.
    pub fn close(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A finite, single-pass sequence of rows.
///
/// Rows are fetched one chunk of `buffer_size` at a time, and only when the
/// buffered chunk has been consumed.
pub struct RowStream<'a, F: ConnectionFactory> {
    statement: Statement<'a, F>,
    buffer: VecDeque<Row>,
    buffer_size: usize,
    cancelled: Arc<AtomicBool>,
    /// End of stream (clean or failed) has been reported.
    finished: bool,
    delivered: u64,
}

impl<F: ConnectionFactory> std::fmt::Debug for RowStream<'_, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStream")
            .field("statement", &self.statement)
            .field("buffered", &self.buffer.len())
            .field("buffer_size", &self.buffer_size)
            .field("delivered", &self.delivered)
            .field("finished", &self.finished)
            .finish()
    }
}

impl<'a, F: ConnectionFactory> RowStream<'a, F> {
    pub(crate) fn new(statement: Statement<'a, F>, options: StreamOptions) -> Self {
        Self {
            statement,
            buffer: VecDeque::new(),
            // The field is public, so a zero may arrive without going through
            // `with_buffer_size`. An empty fetch reads as exhaustion.
            buffer_size: options.buffer_size.clamp(1, MAX_BUFFER_SIZE),
            cancelled: Arc::new(AtomicBool::new(false)),
            finished: false,
            delivered: 0,
        }
    }

    pub fn metadata(&self) -> &[ColumnMetadata] {
        self.statement.metadata()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Rows handed to the consumer so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn closer(&self) -> StreamCloser {
        StreamCloser {
            cancelled: self.cancelled.clone(),
        }
    }

    /// Next row, or `None` at end of stream.
    ///
    /// After the end has been reported once, further reads fail with
    /// `DbError::StatementClosed`.
    pub async fn next_row(&mut self) -> DbResult<Option<Row>> {
        loop {
            if let Some(end) = self.check_end().await {
                return end.map(|()| None);
            }
            if let Some(row) = self.buffer.pop_front() {
                self.delivered += 1;
                return Ok(Some(row));
            }
            self.refill().await?;
        }
    }

    /// Next buffered chunk, or `None` at end of stream.
    pub async fn next_chunk(&mut self) -> DbResult<Option<Vec<Row>>> {
        loop {
            if let Some(end) = self.check_end().await {
                return end.map(|()| None);
            }
            if !self.buffer.is_empty() {
                let chunk: Vec<Row> = self.buffer.drain(..).collect();
                self.delivered += chunk.len() as u64;
                return Ok(Some(chunk));
            }
            self.refill().await?;
        }
    }

    /// Stop the stream now. Buffered rows are dropped and the statement closed.
    pub async fn close(&mut self) -> DbResult<()> {
        self.cancelled.store(true, Ordering::SeqCst);
        self.buffer.clear();
        self.statement.close().await
    }

    /// `Some(Ok(()))` for a clean end to report now, `Some(Err)` once the end
    /// was already reported, `None` to keep reading.
    async fn check_end(&mut self) -> Option<DbResult<()>> {
        if self.finished {
            return Some(Err(DbError::statement_closed("next_row")));
        }
        if self.cancelled.load(Ordering::SeqCst) {
            self.finished = true;
            self.buffer.clear();
            debug!(delivered = self.delivered, "Row stream cancelled");
            if let Err(e) = self.statement.close().await {
                warn!(error = %e, "Failed to close cancelled statement");
            }
            return Some(Ok(()));
        }
        if self.buffer.is_empty() && self.statement.is_closed() {
            self.finished = true;
            return Some(Ok(()));
        }
        None
    }

    async fn refill(&mut self) -> DbResult<()> {
        match self.statement.fetch_chunk(self.buffer_size).await {
            Ok(rows) => {
                // A cancel that raced the fetch discards the chunk on the next check
                self.buffer.extend(rows);
                Ok(())
            }
            Err(e) => {
                self.finished = true;
                self.buffer.clear();
                Err(e)
            }
        }
    }

    /// Adapt into a `futures::Stream`. The stream ends after the first error.
    pub fn into_stream(self) -> impl Stream<Item = DbResult<Row>> + Send + 'a {
        stream::unfold(Some(self), |state| async move {
            let mut rows = state?;
            match rows.next_row().await {
                Ok(Some(row)) => Some((Ok(row), Some(rows))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}

impl<F: ConnectionFactory> Pool<F> {
    /// Execute a query and stream its rows. The stream owns its lease.
    pub async fn create_read_stream(
        &self,
        sql: &str,
        params: &[Value],
        options: StreamOptions,
    ) -> DbResult<RowStream<'static, F>> {
        let statement = self.execute(sql, params).await?;
        statement.as_stream(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::db::mock::{MockFactory, MockScript};
    use crate::error::ErrorKind;
    use crate::models::StatementState;
    use futures_util::StreamExt;

    fn pool(script: MockScript) -> Pool<MockFactory> {
        Pool::new(MockFactory::new(script), PoolConfig::default()).unwrap()
    }

    fn fetch_calls(pool: &Pool<MockFactory>) -> usize {
        pool.inner_factory()
            .log()
            .iter()
            .filter(|e| e.starts_with("fetch"))
            .count()
    }

    #[tokio::test]
    async fn test_rows_in_cursor_order_exactly_once() {
        let pool = pool(MockScript::numbered_rows(110));
        let mut rows = pool
            .create_read_stream("select n from t", &[], StreamOptions::default())
            .await
            .unwrap();

        let mut seen = Vec::new();
        while let Some(row) = rows.next_row().await.unwrap() {
            seen.push(row[0].as_i64().unwrap());
        }
        assert_eq!(seen, (1..=110).collect::<Vec<_>>());
        // Two full chunks plus the empty end-of-cursor fetch
        assert_eq!(fetch_calls(&pool), 3);
        assert_eq!(pool.status().leased, 0);

        let err = rows.next_row().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StatementClosed);
    }

    #[tokio::test]
    async fn test_fetch_is_lazy() {
        let pool = pool(MockScript::numbered_rows(30));
        let mut rows = pool
            .create_read_stream(
                "select n from t",
                &[],
                StreamOptions::with_buffer_size(10),
            )
            .await
            .unwrap();
        assert_eq!(fetch_calls(&pool), 0);

        rows.next_row().await.unwrap();
        assert_eq!(fetch_calls(&pool), 1);
        for _ in 0..9 {
            rows.next_row().await.unwrap();
        }
        assert_eq!(fetch_calls(&pool), 1);
        rows.next_row().await.unwrap();
        assert_eq!(fetch_calls(&pool), 2);
    }

    #[tokio::test]
    async fn test_cancel_ends_cleanly_then_rejects() {
        let pool = pool(MockScript::numbered_rows(40));
        let mut rows = pool
            .create_read_stream(
                "select n from t",
                &[],
                StreamOptions::with_buffer_size(10),
            )
            .await
            .unwrap();
        let closer = rows.closer();

        let mut count = 0;
        while let Some(_row) = rows.next_row().await.unwrap() {
            count += 1;
            if count == 5 {
                closer.close();
            }
        }
        assert_eq!(count, 5);
        assert_eq!(rows.delivered(), 5);
        assert_eq!(pool.status().leased, 0);
        assert!(
            pool.inner_factory()
                .log()
                .iter()
                .any(|e| e.starts_with("close_cursor"))
        );

        let err = rows.next_row().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StatementClosed);
    }

    #[tokio::test]
    async fn test_fetch_failure_surfaces_once() {
        let pool = pool(MockScript {
            fail_fetch_at: Some(1),
            ..MockScript::numbered_rows(25)
        });
        let mut rows = pool
            .create_read_stream(
                "select n from t",
                &[],
                StreamOptions::with_buffer_size(10),
            )
            .await
            .unwrap();

        let mut delivered = 0;
        let err = loop {
            match rows.next_row().await {
                Ok(Some(_)) => delivered += 1,
                Ok(None) => panic!("stream ended without surfacing the fetch failure"),
                Err(e) => break e,
            }
        };
        assert_eq!(delivered, 10);
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert_eq!(pool.status().leased, 0);

        let err = rows.next_row().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StatementClosed);
    }

    #[tokio::test]
    async fn test_empty_result_has_metadata_and_clean_end() {
        let pool = pool(MockScript {
            rows: Vec::new(),
            ..MockScript::numbered_rows(0)
        });
        let statement = pool.execute("select n from t", &[]).await.unwrap();
        assert_eq!(statement.metadata().len(), 1);

        let mut rows = statement.as_stream(StreamOptions::default()).unwrap();
        assert_eq!(rows.metadata()[0].type_name, "INTEGER");
        assert!(rows.next_row().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_next_chunk() {
        let pool = pool(MockScript::numbered_rows(25));
        let mut rows = pool
            .create_read_stream(
                "select n from t",
                &[],
                StreamOptions::with_buffer_size(10),
            )
            .await
            .unwrap();
        let mut sizes = Vec::new();
        while let Some(chunk) = rows.next_chunk().await.unwrap() {
            sizes.push(chunk.len());
        }
        assert_eq!(sizes, vec![10, 10, 5]);
    }

    #[tokio::test]
    async fn test_into_stream_take_closes_statement() {
        let pool = pool(MockScript::numbered_rows(50));
        let rows = pool
            .create_read_stream(
                "select n from t",
                &[],
                StreamOptions::with_buffer_size(10),
            )
            .await
            .unwrap();

        let first: Vec<_> = rows.into_stream().take(3).collect().await;
        assert_eq!(first.len(), 3);
        // Dropping the adapter returned the lease; the cursor is swept on next use
        assert_eq!(pool.status().leased, 0);
        assert_eq!(pool.status().idle, 1);
    }

    #[tokio::test]
    async fn test_zero_buffer_size_still_delivers_every_row() {
        let pool = pool(MockScript::numbered_rows(5));
        let mut rows = pool
            .create_read_stream("select n from t", &[], StreamOptions { buffer_size: 0 })
            .await
            .unwrap();
        assert_eq!(rows.buffer_size(), 1);

        let mut seen = Vec::new();
        while let Some(row) = rows.next_row().await.unwrap() {
            seen.push(row[0].as_i64().unwrap());
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_oversized_buffer_is_capped() {
        let pool = pool(MockScript::numbered_rows(3));
        let rows = pool
            .create_read_stream(
                "select n from t",
                &[],
                StreamOptions {
                    buffer_size: MAX_BUFFER_SIZE * 2,
                },
            )
            .await
            .unwrap();
        assert_eq!(rows.buffer_size(), MAX_BUFFER_SIZE);
        assert!(format!("{:?}", rows).contains("RowStream"));
    }

    #[tokio::test]
    async fn test_as_stream_on_update_is_usage_error() {
        let pool = pool(MockScript::default());
        let statement = pool.execute("delete from t", &[]).await.unwrap();
        let err = statement.as_stream(StreamOptions::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Usage);
    }

    #[tokio::test]
    async fn test_stream_marks_statement_streaming() {
        let pool = pool(MockScript::numbered_rows(1));
        let statement = pool.execute("select n from t", &[]).await.unwrap();
        assert_eq!(statement.state(), StatementState::Open);
        let rows = statement.as_stream(StreamOptions::default()).unwrap();
        assert_eq!(rows.statement.state(), StatementState::Streaming);
    }
}
