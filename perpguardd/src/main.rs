//! perpguard Daemon
//!
//! Position, risk and execution engine for leveraged perpetual futures.
//!
//! # Usage
//!
//! ```bash
//! # Start against the stub exchange with an in-memory journal
//! cargo run -p perpguardd
//!
//! # Persist positions to a journal file
//! PERPGUARD_JOURNAL_PATH=/var/lib/perpguard/positions.jsonl cargo run -p perpguardd
//! ```
//!
//! # Environment Variables
//!
//! - `PERPGUARD_ENV`: Environment (test, development, production)
//! - `PERPGUARD_LEVERAGE`: Leverage (default: 8)
//! - `PERPGUARD_MAX_POSITIONS`: Concurrent position cap (default: 3)
//! - `PERPGUARD_MAX_ALLOCATION`: Capital ceiling fraction (default: 0.80)
//! - `PERPGUARD_SLOW_CYCLE_SECS`: Decision loop interval (default: 300)
//! - `PERPGUARD_FAST_MONITOR_SECS`: Protection loop interval (default: 5)
//! - `PERPGUARD_JOURNAL_PATH`: JSON-lines journal (default: in-memory)
//! - `PERPGUARD_DATABASE_URL`: Postgres journal (`postgres` feature)

use perpguardd::{Config, Daemon};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("perpguardd=info".parse()?))
        .init();

    // Load configuration
    let config = Config::from_env()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
        leverage = config.engine.leverage.value(),
        max_positions = config.engine.max_concurrent_positions,
        "perpguard daemon"
    );

    let journal = Daemon::open_journal(&config).await?;
    let daemon = Daemon::new_stub(config, journal)?;
    daemon.run().await?;

    Ok(())
}
