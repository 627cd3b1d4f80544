//! db-bridge - Main entry point.
//!
//! Runs SQL statements through a connection pool. Query rows are streamed to
//! stdout as JSON lines; update counts are printed as JSON objects.

use clap::Parser;
use db_bridge::config::Config;
use db_bridge::db::{Pool, SqliteFactory};
use db_bridge::error::DbResult;
use db_bridge::models::{StreamOptions, to_record};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Execute one statement and print its result.
async fn run_statement(pool: &Pool<SqliteFactory>, sql: &str, options: StreamOptions) -> DbResult<()> {
    let mut statement = pool.execute(sql, &[]).await?;
    if !statement.is_query() {
        let updated = statement.updated()?;
        statement.close().await?;
        println!("{}", serde_json::json!({ "updated": updated }));
        return Ok(());
    }

    let mut rows = statement.as_stream(options)?;
    let columns = rows.metadata().to_vec();
    while let Some(row) = rows.next_row().await? {
        let record = to_record(&columns, row);
        match serde_json::to_string(&record) {
            Ok(line) => println!("{}", line),
            Err(e) => error!(error = %e, "Failed to serialize row"),
        }
    }
    Ok(())
}

/// Run the statements given on the command line, or read them from stdin.
async fn run_statements(
    config: &Config,
    pool: &Pool<SqliteFactory>,
    options: StreamOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    if !config.statements.is_empty() {
        for sql in &config.statements {
            run_statement(pool, sql, options).await?;
        }
        return Ok(());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let sql = line.trim();
        if !sql.is_empty() {
            run_statement(pool, sql, options).await?;
        }
    }
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse configuration from command line and environment
    let config = Config::parse();

    // Initialize logging
    init_tracing(&config);

    let location = config.location()?;
    let pool = Pool::new(SqliteFactory::new(location)?, config.pool_config()?)?;
    let options = StreamOptions::with_buffer_size(config.buffer_size);

    info!(
        database = %config.database,
        in_memory = pool.is_in_memory(),
        "Starting db-bridge v{}",
        env!("CARGO_PKG_VERSION")
    );

    let (result, interrupted) = tokio::select! {
        result = run_statements(&config, &pool, options) => (result, false),
        _ = wait_for_signal() => {
            info!("Shutdown signal received");
            (Ok(()), true)
        }
    };

    pool.close().await;

    if let Err(e) = result {
        error!(error = %e, "Statement failed");
        return Err(e);
    }

    if interrupted {
        // A pending stdin read would keep the runtime from shutting down
        std::process::exit(0);
    }

    info!("Shutdown complete");
    Ok(())
}
