//! Grid Trading Bot Binary
//!
//! Runs the grid engine or the volume cycler against the paper exchange.
//!
//! ## Setup
//!
//! 1. Write a config file (TOML, JSON or YAML), e.g. `config.toml`:
//!    ```toml
//!    mode = "grid"
//!
//!    [grid]
//!    symbol = "BTCUSDT"
//!    profit_percent = 1.0
//!    grid_count = 10
//!    ```
//!
//! 2. Optionally override values from `.env` or the environment:
//!    ```
//!    APP__GRID__GRID_COUNT=20
//!    APP__LOG__LEVEL=debug
//!    ```
//!
//! 3. Run the bot:
//!    ```bash
//!    cargo run --bin grid_bot -- --config config.toml
//!    ```

use std::env;

use log::error;

use spot_grid_engine::runner::BotRunner;

#[tokio::main]
async fn main() {
    // Load .env file; a missing file is fine
    dotenvy::dotenv().ok();

    // Parse arguments
    let args: Vec<String> = env::args().collect();
    let config_path = if args.len() > 2 && args[1] == "--config" {
        args[2].clone()
    } else {
        "config.toml".to_string()
    };

    let runner = match BotRunner::new(&config_path) {
        Ok(runner) => runner,
        Err(e) => {
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
                .init();
            error!("Failed to load config {}: {}", config_path, e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runner.run().await {
        error!("Bot stopped with error: {}", e);
        std::process::exit(1);
    }
}
