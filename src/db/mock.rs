//! Scripted resource for failure-injection tests.

use crate::config::PoolConfig;
use crate::db::connection::{Connection, ConnectionFactory, CursorId, ExecOutcome};
use crate::error::{DbError, DbResult};
use crate::models::{ColumnMetadata, Row, StatementKind, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Default)]
pub struct MockScript {
    pub fail_connect: bool,
    /// Host name that cannot be reached.
    pub unreachable_host: Option<String>,
    /// Statements containing this text fail on execute.
    pub fail_execute_containing: Option<String>,
    /// Zero-based fetch call on which every cursor fails.
    pub fail_fetch_at: Option<usize>,
    pub fail_begin: bool,
    pub fail_commit: bool,
    pub fail_rollback: bool,
    pub columns: Vec<ColumnMetadata>,
    pub rows: Vec<Row>,
}

impl MockScript {
    /// A query result of `count` single-column integer rows, 1..=count.
    pub fn numbered_rows(count: i64) -> Self {
        Self {
            columns: vec![ColumnMetadata::new("N", "INTEGER")],
            rows: (1..=count).map(|n| vec![Value::Int(n)]).collect(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct MockShared {
    connects: AtomicUsize,
    closes: AtomicUsize,
    next_key: AtomicI64,
    log: Mutex<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct MockFactory {
    script: Arc<MockScript>,
    shared: Arc<MockShared>,
}

impl MockFactory {
    pub fn new(script: MockScript) -> Self {
        Self {
            script: Arc::new(script),
            shared: Arc::new(MockShared::default()),
        }
    }

    pub fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    /// Every call issued against any connection of this factory, in order.
    pub fn log(&self) -> Vec<String> {
        self.shared.log.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl ConnectionFactory for MockFactory {
    type Connection = MockConnection;

    async fn connect(&self, config: &PoolConfig) -> DbResult<MockConnection> {
        if self.script.fail_connect {
            return Err(DbError::connection("cannot establish the connection"));
        }
        if let (Some(host), Some(unreachable)) = (&config.host, &self.script.unreachable_host) {
            if host == unreachable {
                return Err(DbError::connection(format!(
                    "cannot establish the connection to {}",
                    host
                )));
            }
        }
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            script: self.script.clone(),
            shared: self.shared.clone(),
            cursors: HashMap::new(),
            next_cursor: 1,
        })
    }

    fn reconfigure(&self, _config: &PoolConfig) -> DbResult<Self> {
        Ok(Self::new((*self.script).clone()))
    }

    fn is_in_memory(&self) -> bool {
        true
    }
}

struct MockCursor {
    rows: VecDeque<Row>,
    fetches: usize,
}

pub struct MockConnection {
    script: Arc<MockScript>,
    shared: Arc<MockShared>,
    cursors: HashMap<CursorId, MockCursor>,
    next_cursor: CursorId,
}

impl MockConnection {
    fn record(&self, entry: impl Into<String>) {
        if let Ok(mut log) = self.shared.log.lock() {
            log.push(entry.into());
        }
    }
}

impl Connection for MockConnection {
    async fn execute(
        &mut self,
        sql: &str,
        _params: &[Value],
        kind: StatementKind,
    ) -> DbResult<ExecOutcome> {
        self.record(format!("execute {}", sql));
        if let Some(needle) = &self.script.fail_execute_containing {
            if sql.contains(needle.as_str()) {
                return Err(DbError::execution("execute", format!("scripted failure: {}", sql)));
            }
        }
        match kind {
            StatementKind::Update => Ok(ExecOutcome::Updated(1)),
            StatementKind::Query => {
                let cursor = self.next_cursor;
                self.next_cursor += 1;
                self.cursors.insert(
                    cursor,
                    MockCursor {
                        rows: self.script.rows.iter().cloned().collect(),
                        fetches: 0,
                    },
                );
                Ok(ExecOutcome::Cursor {
                    cursor,
                    columns: self.script.columns.clone(),
                })
            }
        }
    }

    async fn execute_for_key(&mut self, sql: &str, params: &[Value]) -> DbResult<i64> {
        self.execute(sql, params, StatementKind::Update).await?;
        Ok(self.shared.next_key.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn fetch_next(&mut self, cursor: CursorId, max_rows: usize) -> DbResult<Vec<Row>> {
        self.record(format!("fetch {}", cursor));
        let fail_at = self.script.fail_fetch_at;
        let state = self
            .cursors
            .get_mut(&cursor)
            .ok_or_else(|| DbError::execution("fetch", format!("unknown cursor {}", cursor)))?;
        let call = state.fetches;
        state.fetches += 1;
        if fail_at == Some(call) {
            return Err(DbError::execution("fetch", "scripted fetch failure"));
        }
        let take = max_rows.min(state.rows.len());
        Ok(state.rows.drain(..take).collect())
    }

    async fn close_cursor(&mut self, cursor: CursorId) -> DbResult<()> {
        self.record(format!("close_cursor {}", cursor));
        self.cursors.remove(&cursor);
        Ok(())
    }

    async fn begin(&mut self) -> DbResult<()> {
        self.record("begin");
        if self.script.fail_begin {
            return Err(DbError::execution("begin", "scripted begin failure"));
        }
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.record("commit");
        if self.script.fail_commit {
            return Err(DbError::execution("commit", "scripted commit failure"));
        }
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.record("rollback");
        if self.script.fail_rollback {
            return Err(DbError::execution("rollback", "scripted rollback failure"));
        }
        Ok(())
    }

    async fn close(self) -> DbResult<()> {
        self.shared.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
