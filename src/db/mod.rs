//! Database access core.
//!
//! - Connection collaborator traits and the pool that leases them
//! - Statement execution, row streams and transaction scopes
//! - Batch and list writes
//! - The embedded SQLite resource and the adapter for blocking drivers

pub mod batch;
pub mod blocking;
pub mod connection;
pub mod default_pool;
pub mod pool;
pub mod sql;
pub mod sqlite;
pub mod statement;
pub mod stream;
pub mod transaction;

#[cfg(test)]
pub(crate) mod mock;

pub use batch::BatchWriter;
pub use blocking::{BlockingAdapter, BlockingConnection, BlockingFactory, BlockingHandle};
pub use connection::{Connection, ConnectionFactory, CursorId, ExecOutcome};
pub use default_pool::DefaultPool;
pub use pool::{Pool, PoolStatus, PooledConnection};
pub use sqlite::{SqliteFactory, SqliteLocation, SqliteResource, in_memory_pool, open_pool};
pub use statement::Statement;
pub use stream::{RowStream, StreamCloser};
