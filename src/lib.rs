//! Database bridge library.
//!
//! Turns one expensive, stateful resource connection into a pooled,
//! streaming and transactional API for many concurrent callers.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod programs;

pub use config::{Config, PoolConfig, PoolOptions};
pub use db::{Pool, PooledConnection, RowStream, SqliteFactory, Statement};
pub use error::{DbError, DbResult, ErrorKind};
