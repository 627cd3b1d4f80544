//! Lazily-initialized process default pool.
//!
//! `DefaultPool` builds its pool on first use from a configuration source
//! (the environment, unless another source is injected) and keeps it until
//! `shutdown()`. Initialization is single-flight: concurrent first callers wait
//! for one pool to be built and then share it.

use crate::config::PoolConfig;
use crate::db::connection::ConnectionFactory;
use crate::db::pool::Pool;
use crate::error::{DbError, DbResult};
use tokio::sync::Mutex;
use tracing::{debug, info};

type ConfigSource = Box<dyn Fn() -> DbResult<PoolConfig> + Send + Sync>;
type FactoryMaker<F> = Box<dyn Fn(&PoolConfig) -> DbResult<F> + Send + Sync>;

enum DefaultState<F: ConnectionFactory> {
    Uninit,
    Ready(Pool<F>),
    ShutDown,
}

/// Owner of the default pool.
pub struct DefaultPool<F: ConnectionFactory> {
    state: Mutex<DefaultState<F>>,
    source: ConfigSource,
    make_factory: FactoryMaker<F>,
}

impl<F: ConnectionFactory> DefaultPool<F> {
    /// Default pool configured from `DB_BRIDGE_*` environment variables.
    pub fn from_env<M>(make_factory: M) -> Self
    where
        M: Fn(&PoolConfig) -> DbResult<F> + Send + Sync + 'static,
    {
        Self::with_source(PoolConfig::from_env, make_factory)
    }

    pub fn with_source<S, M>(source: S, make_factory: M) -> Self
    where
        S: Fn() -> DbResult<PoolConfig> + Send + Sync + 'static,
        M: Fn(&PoolConfig) -> DbResult<F> + Send + Sync + 'static,
    {
        Self {
            state: Mutex::new(DefaultState::Uninit),
            source: Box::new(source),
            make_factory: Box::new(make_factory),
        }
    }

    /// The default pool, building it on first call.
    ///
    /// Fails with `DbError::Connection` after `shutdown()`. A failed build
    /// leaves the default uninitialized, so the next call tries again.
    pub async fn get(&self) -> DbResult<Pool<F>> {
        let mut state = self.state.lock().await;
        match &*state {
            DefaultState::Ready(pool) => Ok(pool.clone()),
            DefaultState::ShutDown => Err(DbError::connection("Default pool has been shut down")),
            DefaultState::Uninit => {
                let config = (self.source)()?;
                let factory = (self.make_factory)(&config)?;
                let pool = Pool::new(factory, config)?;
                info!(pool_id = %pool.id(), "Default pool initialized");
                *state = DefaultState::Ready(pool.clone());
                Ok(pool)
            }
        }
    }

    pub async fn is_initialized(&self) -> bool {
        matches!(&*self.state.lock().await, DefaultState::Ready(_))
    }

    /// Close the default pool. Later `get()` calls fail.
    pub async fn shutdown(&self) {
        let previous = {
            let mut state = self.state.lock().await;
            std::mem::replace(&mut *state, DefaultState::ShutDown)
        };
        match previous {
            DefaultState::Ready(pool) => pool.close().await,
            _ => debug!("Default pool shut down before first use"),
        }
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for DefaultPool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self.state.try_lock() {
            Ok(guard) => match &*guard {
                DefaultState::Uninit => "uninit",
                DefaultState::Ready(_) => "ready",
                DefaultState::ShutDown => "shut_down",
            },
            Err(_) => "busy",
        };
        f.debug_struct("DefaultPool").field("state", &state).finish()
    }
}
