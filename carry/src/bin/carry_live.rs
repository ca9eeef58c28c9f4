use carry::{config::SystemConfig, engine::TradingEngine, logging};
use carry_execution::client::{MockVenue, VenueAdapter};
use std::sync::Arc;
use tracing::{error, info};

/// Live trading entrypoint: load config, start the engine, stop gracefully on interrupt.
///
/// Exit codes: 0 on a clean run, 1 on configuration or startup failure.
#[tokio::main]
async fn main() {
    // CARRY_LOG_FORMAT=json switches to structured output for log shipping
    match std::env::var("CARRY_LOG_FORMAT").as_deref() {
        Ok("json") => logging::init_json_logging(),
        _ => logging::init_logging(),
    }

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.json".to_owned());

    let config = match SystemConfig::load(&config_path) {
        Ok(config) => config,
        Err(config_error) => {
            error!(%config_error, path = %config_path, "configuration rejected");
            std::process::exit(1);
        }
    };

    // Paper trading routes submissions through the mock venue; concrete signed adapters plug
    // in behind the same seam
    let adapter: Arc<dyn VenueAdapter> = Arc::new(MockVenue::new());
    if !config.paper_trading {
        error!("no signed venue adapter is wired in this build - run with paper_trading=true");
        std::process::exit(1);
    }

    let mut engine = match TradingEngine::new(config, adapter) {
        Ok(engine) => engine,
        Err(engine_error) => {
            error!(%engine_error, "engine construction failed");
            std::process::exit(1);
        }
    };

    if let Err(engine_error) = engine.start() {
        error!(%engine_error, "engine startup failed");
        std::process::exit(1);
    }

    let shutdown = engine.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received - shutting down");
            shutdown.notify_one();
        }
    });

    if let Err(engine_error) = engine.run().await {
        error!(%engine_error, "engine terminated with error");
        std::process::exit(1);
    }
}
