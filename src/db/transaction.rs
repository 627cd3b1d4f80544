//! Transaction scopes.
//!
//! A unit of work runs against one leased connection with auto-commit
//! disabled. It commits when the work succeeds and rolls back when it fails;
//! the connection goes back to the pool exactly once either way.

use crate::db::connection::{Connection, ConnectionFactory};
use crate::db::pool::{Pool, PooledConnection};
use crate::error::{DbError, DbResult};
use futures_util::future::BoxFuture;
use tracing::{debug, error, info};

impl<F: ConnectionFactory> PooledConnection<F> {
    /// Run `work` inside a transaction on this connection.
    ///
    /// The error returned by `work` is passed through unchanged after the
    /// rollback. A failed commit yields `DbError::TransactionAborted` wrapping
    /// the commit error. If commit or rollback fails, the connection is marked
    /// unusable and discarded when released.
    ///
    /// Fails with `DbError::Usage` if this connection is already in a
    /// transaction.
    pub async fn transaction<T, E, W>(&mut self, work: W) -> Result<T, E>
    where
        W: for<'t> FnOnce(&'t mut PooledConnection<F>) -> BoxFuture<'t, Result<T, E>> + Send,
        E: From<DbError> + Send,
        T: Send,
    {
        if self.in_transaction {
            return Err(DbError::usage(format!(
                "connection {} is already in a transaction; nested transactions are not supported",
                self.id()
            ))
            .into());
        }

        self.sweep_cursors().await?;
        if let Err(e) = self.conn()?.begin().await {
            // Auto-commit state is unknown after a failed begin
            self.broken = true;
            error!(connection_id = self.id(), error = %e, "Begin failed; discarding connection");
            return Err(e.into());
        }
        self.in_transaction = true;
        debug!(connection_id = self.id(), "Transaction started");

        let outcome = work(&mut *self).await;

        match outcome {
            Ok(value) => match self.finish_transaction(true).await {
                Ok(()) => {
                    info!(connection_id = self.id(), "Transaction committed");
                    Ok(value)
                }
                Err(e) => {
                    error!(connection_id = self.id(), error = %e, "Commit failed");
                    Err(DbError::transaction_aborted(e).into())
                }
            },
            Err(err) => {
                match self.finish_transaction(false).await {
                    Ok(()) => info!(connection_id = self.id(), "Transaction rolled back"),
                    Err(e) => {
                        error!(connection_id = self.id(), error = %e, "Rollback failed; discarding connection")
                    }
                }
                Err(err)
            }
        }
    }

    async fn finish_transaction(&mut self, commit: bool) -> DbResult<()> {
        // Cursors opened inside the scope must not outlive it
        let swept = self.sweep_cursors().await;
        let result = match swept {
            Ok(()) => {
                let conn = self.conn()?;
                if commit {
                    conn.commit().await
                } else {
                    conn.rollback().await
                }
            }
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                self.in_transaction = false;
                Ok(())
            }
            Err(e) => {
                // Stays in_transaction, so the pool discards it on release
                self.broken = true;
                Err(e)
            }
        }
    }
}

impl<F: ConnectionFactory> Pool<F> {
    /// Lease a connection, run `work` in a transaction on it, and return the
    /// connection to the pool.
    pub async fn transaction<T, E, W>(&self, work: W) -> Result<T, E>
    where
        W: for<'t> FnOnce(&'t mut PooledConnection<F>) -> BoxFuture<'t, Result<T, E>> + Send,
        E: From<DbError> + Send,
        T: Send,
    {
        let mut handle = self.acquire().await?;
        let result = handle.transaction(work).await;
        handle.release();
        result
    }
}
