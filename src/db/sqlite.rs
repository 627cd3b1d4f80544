//! Embedded SQLite resource.
//!
//! `SqliteFactory` opens sqlx SQLite connections, either to a file or to a
//! private in-memory database. Each in-memory factory gets its own database,
//! shared by all of its connections and kept alive by an anchor connection for
//! as long as the factory exists. Query rows are streamed from the driver
//! through a bounded channel rather than read up front.

use crate::config::{PoolConfig, PoolOptions};
use crate::db::connection::{Connection, ConnectionFactory, CursorId, ExecOutcome};
use crate::db::pool::Pool;
use crate::db::sql::{self, ProjectedColumn};
use crate::error::{DbError, DbResult};
use crate::models::{ColumnMetadata, Row, StatementKind, Value};
use futures_util::StreamExt;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteRow};
use sqlx::{Column as _, Connection as _, Executor as _, Row as _, Statement as _, TypeInfo as _, ValueRef as _};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

const IN_MEMORY_URL: &str = "sqlite::memory:";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Where an embedded database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqliteLocation {
    InMemory,
    File(PathBuf),
}

impl SqliteLocation {
    /// Parse `sqlite::memory:`, `sqlite:<path>` or `sqlite://<path>`.
    pub fn parse(database_url: &str) -> DbResult<Self> {
        let url = Url::parse(database_url)
            .map_err(|e| DbError::config(format!("Invalid database URL '{}': {}", database_url, e)))?;
        if url.scheme() != "sqlite" {
            return Err(DbError::config(format!(
                "Unsupported database URL scheme '{}'. Expected sqlite::memory: or sqlite:<path>",
                url.scheme()
            )));
        }
        if url.path() == ":memory:" {
            return Ok(Self::InMemory);
        }
        let path = match url.host_str() {
            Some(host) if !host.is_empty() => format!("{}{}", host, url.path()),
            _ => url.path().to_string(),
        };
        if path.is_empty() {
            return Err(DbError::config(format!(
                "Database URL '{}' has no file path",
                database_url
            )));
        }
        Ok(Self::File(PathBuf::from(path)))
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self, Self::InMemory)
    }
}

/// Factory for embedded SQLite connections.
pub struct SqliteFactory {
    location: SqliteLocation,
    options: SqliteConnectOptions,
    anchor: Arc<Mutex<Option<SqliteConnection>>>,
}

impl std::fmt::Debug for SqliteFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteFactory")
            .field("location", &self.location)
            .finish()
    }
}

impl SqliteFactory {
    pub fn new(location: SqliteLocation) -> DbResult<Self> {
        let options = match &location {
            // A fresh `:memory:` options value names a new private shared-cache database
            SqliteLocation::InMemory => SqliteConnectOptions::from_str(IN_MEMORY_URL)?,
            SqliteLocation::File(path) => SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .busy_timeout(BUSY_TIMEOUT),
        };
        Ok(Self {
            location,
            options,
            anchor: Arc::new(Mutex::new(None)),
        })
    }

    pub fn in_memory() -> DbResult<Self> {
        Self::new(SqliteLocation::InMemory)
    }

    pub fn file(path: impl Into<PathBuf>) -> DbResult<Self> {
        Self::new(SqliteLocation::File(path.into()))
    }

    pub fn location(&self) -> &SqliteLocation {
        &self.location
    }

    async fn open(&self) -> DbResult<SqliteConnection> {
        SqliteConnection::connect_with(&self.options)
            .await
            .map_err(|e| DbError::connection(format!("cannot establish the connection: {}", e)))
    }
}

impl ConnectionFactory for SqliteFactory {
    type Connection = SqliteResource;

    async fn connect(&self, config: &PoolConfig) -> DbResult<SqliteResource> {
        if let Some(host) = &config.host {
            return Err(DbError::connection(format!(
                "cannot establish the connection to {}: embedded databases do not accept a host",
                host
            )));
        }
        if self.location.is_in_memory() {
            let mut anchor = self.anchor.lock().await;
            if anchor.is_none() {
                debug!("Opening anchor connection for in-memory database");
                *anchor = Some(self.open().await?);
            }
        }
        Ok(SqliteResource::new(self.open().await?))
    }

    fn reconfigure(&self, _config: &PoolConfig) -> DbResult<Self> {
        Self::new(self.location.clone())
    }

    fn is_in_memory(&self) -> bool {
        self.location.is_in_memory()
    }
}

/// Pool over a new private in-memory database with default settings.
pub fn in_memory_pool() -> DbResult<Pool<SqliteFactory>> {
    Pool::new(SqliteFactory::in_memory()?, PoolConfig::default())
}

/// Pool over a database URL with `opts` applied.
pub fn open_pool(database_url: &str, opts: &PoolOptions) -> DbResult<Pool<SqliteFactory>> {
    let config = PoolConfig::default().merge(opts)?;
    let factory = SqliteFactory::new(SqliteLocation::parse(database_url)?)?;
    Pool::new(factory, config)
}

/// Rows a cursor reader may hold ahead of the consumer.
const READ_AHEAD: usize = 64;

/// A query whose rows are being read through the connection by a background task.
struct ActiveCursor {
    id: CursorId,
    rows: mpsc::Receiver<DbResult<Row>>,
    reader: JoinHandle<SqliteConnection>,
}

/// One embedded connection.
///
/// A query cursor streams its rows from a reader task that borrows the
/// connection until the cursor ends or is closed, so at most `READ_AHEAD`
/// undelivered rows are held in memory. SQLite runs one statement at a time
/// per connection: when another call needs the connection while a cursor is
/// still streaming, the rest of that cursor is read into memory first.
pub struct SqliteResource {
    /// `None` while a reader task holds the connection.
    conn: Option<SqliteConnection>,
    active: Option<ActiveCursor>,
    /// Cursors read to the end in memory, including a trailing read error.
    spilled: HashMap<CursorId, VecDeque<DbResult<Row>>>,
    next_cursor: CursorId,
}

impl std::fmt::Debug for SqliteResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteResource")
            .field("streaming", &self.active.as_ref().map(|a| a.id))
            .field("spilled_cursors", &self.spilled.len())
            .finish()
    }
}

fn bind_value<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, SqliteArguments<'q>>,
    value: &'q Value,
) -> sqlx::query::Query<'q, sqlx::Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(v) => query.bind(*v),
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::Text(v) => query.bind(v.as_str()),
        Value::Bytes(v) => query.bind(v.as_slice()),
    }
}

fn build_query<'q>(
    sql: &'q str,
    params: &'q [Value],
) -> sqlx::query::Query<'q, sqlx::Sqlite, SqliteArguments<'q>> {
    params
        .iter()
        .fold(sqlx::query(sql), |query, value| bind_value(query, value))
}

/// Decode one cell by its storage class.
fn decode_cell(row: &SqliteRow, idx: usize) -> DbResult<Value> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let storage = raw.type_info().name().to_string();
    let value = match storage.as_str() {
        "INTEGER" => Value::Int(row.try_get_unchecked::<i64, _>(idx)?),
        "REAL" => Value::Float(row.try_get_unchecked::<f64, _>(idx)?),
        "BLOB" => Value::Bytes(row.try_get_unchecked::<Vec<u8>, _>(idx)?),
        _ => Value::Text(row.try_get_unchecked::<String, _>(idx)?),
    };
    Ok(value)
}

fn decode_row(row: &SqliteRow) -> DbResult<Row> {
    (0..row.columns().len())
        .map(|idx| decode_cell(row, idx))
        .collect()
}

/// Move `conn` into a task that runs the query and feeds decoded rows into a
/// bounded channel. The task hands the connection back when the result is
/// exhausted, a row fails, or the receiver is dropped.
fn spawn_reader(cursor: CursorId, mut conn: SqliteConnection, sql: String, params: Vec<Value>) -> ActiveCursor {
    let (tx, rx) = mpsc::channel(READ_AHEAD);
    let reader = tokio::spawn(async move {
        {
            let mut rows = build_query(&sql, &params).fetch(&mut conn);
            while let Some(next) = rows.next().await {
                let row = next.map_err(DbError::from).and_then(|row| decode_row(&row));
                let failed = row.is_err();
                if tx.send(row).await.is_err() || failed {
                    break;
                }
            }
        }
        debug!(cursor, "Cursor reader finished");
        conn
    });
    ActiveCursor {
        id: cursor,
        rows: rx,
        reader,
    }
}

/// Take up to `max_rows` rows from a spilled cursor. A stored error is
/// returned once the rows before it have been delivered.
fn drain_spilled(rows: &mut VecDeque<DbResult<Row>>, max_rows: usize) -> DbResult<Vec<Row>> {
    let mut chunk = Vec::new();
    while chunk.len() < max_rows {
        match rows.pop_front() {
            Some(Ok(row)) => chunk.push(row),
            Some(Err(e)) if chunk.is_empty() => return Err(e),
            Some(Err(e)) => {
                rows.push_front(Err(e));
                break;
            }
            None => break,
        }
    }
    Ok(chunk)
}

/// Replace driver type names with the declared column types of the source
/// table when the query reads plain columns from one table.
async fn apply_declared_types(conn: &mut SqliteConnection, sql: &str, columns: &mut [ColumnMetadata]) {
    let Some(select) = sql::single_table_select(sql) else {
        return;
    };
    let pragma = format!("pragma table_info(\"{}\")", select.table.replace('"', "\"\""));
    let table_columns: Vec<(String, String)> = match sqlx::query(&pragma).fetch_all(&mut *conn).await {
        Ok(rows) => rows
            .iter()
            .filter_map(|row| {
                let name = row.try_get::<String, _>("name").ok()?;
                let declared = row.try_get::<String, _>("type").ok()?;
                Some((name, declared))
            })
            .collect(),
        Err(e) => {
            debug!(table = %select.table, error = %e, "Declared column types unavailable");
            return;
        }
    };

    let mut declared: Vec<Option<&str>> = Vec::with_capacity(columns.len());
    for item in &select.projection {
        match item {
            ProjectedColumn::All => {
                declared.extend(table_columns.iter().map(|(_, decl)| Some(decl.as_str())))
            }
            ProjectedColumn::Column(name) => declared.push(
                table_columns
                    .iter()
                    .find(|(column, _)| column.eq_ignore_ascii_case(name))
                    .map(|(_, decl)| decl.as_str()),
            ),
            ProjectedColumn::Computed => declared.push(None),
        }
    }
    if declared.len() != columns.len() {
        return;
    }

    for (column, decl) in columns.iter_mut().zip(declared) {
        if let Some((type_name, precision, scale)) = decl.and_then(sql::parse_declared_type) {
            column.type_name = type_name;
            column.precision = precision;
            column.scale = scale;
        }
    }
}

impl SqliteResource {
    fn new(conn: SqliteConnection) -> Self {
        Self {
            conn: Some(conn),
            active: None,
            spilled: HashMap::new(),
            next_cursor: 1,
        }
    }

    /// Get the connection back from a streaming cursor, if one holds it.
    ///
    /// With `keep_rows` the cursor's remaining rows are read into memory and
    /// stay fetchable; otherwise they are discarded.
    async fn reclaim(&mut self, keep_rows: bool) -> DbResult<&mut SqliteConnection> {
        if let Some(mut active) = self.active.take() {
            if keep_rows {
                let mut rest = VecDeque::new();
                while let Some(row) = active.rows.recv().await {
                    rest.push_back(row);
                }
                debug!(cursor = active.id, rows = rest.len(), "Cursor read into memory");
                self.spilled.insert(active.id, rest);
            }
            drop(active.rows);
            match active.reader.await {
                Ok(conn) => self.conn = Some(conn),
                Err(e) => {
                    warn!(cursor = active.id, error = %e, "Cursor reader failed; connection lost");
                    return Err(DbError::connection(format!("SQLite connection lost: {}", e)));
                }
            }
        }
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::connection("SQLite connection lost"))
    }
}

impl Connection for SqliteResource {
    async fn execute(
        &mut self,
        sql: &str,
        params: &[Value],
        kind: StatementKind,
    ) -> DbResult<ExecOutcome> {
        let conn = self.reclaim(true).await?;
        match kind {
            StatementKind::Update => {
                let result = build_query(sql, params).execute(&mut *conn).await?;
                Ok(ExecOutcome::Updated(result.rows_affected()))
            }
            StatementKind::Query => {
                // Column metadata comes from the prepared statement, so
                // zero-row results still describe their columns. Preparing
                // also surfaces syntax and missing-table errors here.
                let mut columns: Vec<ColumnMetadata> = {
                    let prepared = (&mut *conn).prepare(sql).await?;
                    prepared
                        .columns()
                        .iter()
                        .map(|c| ColumnMetadata::new(c.name(), c.type_info().name()))
                        .collect()
                };
                apply_declared_types(conn, sql, &mut columns).await;

                let conn = self
                    .conn
                    .take()
                    .ok_or_else(|| DbError::connection("SQLite connection lost"))?;
                let cursor = self.next_cursor;
                self.next_cursor += 1;
                self.active = Some(spawn_reader(cursor, conn, sql.to_string(), params.to_vec()));
                Ok(ExecOutcome::Cursor { cursor, columns })
            }
        }
    }

    async fn execute_for_key(&mut self, sql: &str, params: &[Value]) -> DbResult<i64> {
        let conn = self.reclaim(true).await?;
        let result = build_query(sql, params).execute(&mut *conn).await?;
        Ok(result.last_insert_rowid())
    }

    async fn fetch_next(&mut self, cursor: CursorId, max_rows: usize) -> DbResult<Vec<Row>> {
        if let Some(rows) = self.spilled.get_mut(&cursor) {
            let chunk = drain_spilled(rows, max_rows);
            if chunk.as_ref().map_or(true, |delivered| delivered.is_empty()) {
                self.spilled.remove(&cursor);
            }
            return chunk;
        }

        let mut chunk = Vec::new();
        while chunk.len() < max_rows {
            let next = match self.active.as_mut() {
                Some(active) if active.id == cursor => active.rows.recv().await,
                _ if chunk.is_empty() => {
                    return Err(DbError::execution("fetch", format!("Unknown cursor {}", cursor)));
                }
                _ => None,
            };
            match next {
                Some(Ok(row)) => chunk.push(row),
                Some(Err(e)) => {
                    self.reclaim(false).await?;
                    if chunk.is_empty() {
                        return Err(e);
                    }
                    // Deliver what was read; the error follows on the next fetch
                    self.spilled.insert(cursor, VecDeque::from([Err(e)]));
                    return Ok(chunk);
                }
                None => {
                    self.reclaim(false).await?;
                    break;
                }
            }
        }
        Ok(chunk)
    }

    async fn close_cursor(&mut self, cursor: CursorId) -> DbResult<()> {
        if self.spilled.remove(&cursor).is_some() {
            return Ok(());
        }
        if self.active.as_ref().is_some_and(|active| active.id == cursor) {
            self.reclaim(false).await?;
        }
        Ok(())
    }

    async fn begin(&mut self) -> DbResult<()> {
        let conn = self.reclaim(true).await?;
        sqlx::query("BEGIN")
            .execute(&mut *conn)
            .await
            .map_err(|e| DbError::execution("begin", e.to_string()))?;
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        let conn = self.reclaim(true).await?;
        sqlx::query("COMMIT")
            .execute(&mut *conn)
            .await
            .map_err(|e| DbError::execution("commit", e.to_string()))?;
        Ok(())
    }

    async fn rollback(&mut self) -> DbResult<()> {
        let conn = self.reclaim(true).await?;
        sqlx::query("ROLLBACK")
            .execute(&mut *conn)
            .await
            .map_err(|e| DbError::execution("rollback", e.to_string()))?;
        Ok(())
    }

    async fn close(mut self) -> DbResult<()> {
        self.reclaim(false).await?;
        if let Some(conn) = self.conn.take() {
            conn.close().await?;
        }
        Ok(())
    }

    fn is_valid(&self) -> bool {
        self.conn.is_some() || self.active.is_some()
    }
}
