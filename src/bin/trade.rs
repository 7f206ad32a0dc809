//! Live trading binary
//!
//! ```bash
//! trade [--config tbot.toml] <strategy> [-b] <pair> [args...]
//! ```
//!
//! Credentials come from the environment (a `.env` file is loaded), e.g.
//! `APP_EXCHANGE__API_KEY` and `APP_EXCHANGE__API_SECRET`. With
//! `[driver] mode = "paper"` orders are matched locally against live prices.

use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use tbot::config::{DriverMode, Settings};
use tbot::market::{Gateway, RestGateway, SimulatedGateway, SimulatedGatewayInput};
use tbot::runner::{LiveRunner, LiveRunnerInput};
use tbot::strategy::{StrategyOptions, StrategyRegistry};

#[derive(Parser)]
#[command(name = "trade", about = "Run a trading plan against the exchange")]
struct Cli {
    /// Path to a TOML config file
    #[arg(long)]
    config: Option<String>,

    /// Plan: auto_bb, auto_bbrsi, targets, trailing, cut or ripple
    strategy: String,

    /// Open the position instead of managing an existing one
    #[arg(short, long, default_value_t = false)]
    buy: bool,

    /// Plan arguments, pair first
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

async fn run(cli: Cli, settings: Settings) -> tbot::Result<()> {
    let market: Arc<dyn Gateway> = Arc::new(RestGateway::new(&settings.exchange)?);
    let paper = match settings.driver.mode {
        DriverMode::Live => None,
        DriverMode::Paper => {
            info!(
                "Paper trading with balance {} / available {}",
                settings.driver.paper_balance, settings.driver.paper_available
            );
            let input = SimulatedGatewayInput {
                fee_rate: settings.simulation.fee_rate,
                balance: settings.driver.paper_balance,
                available: settings.driver.paper_available,
                candles: Vec::new(),
            };
            Some(Arc::new(SimulatedGateway::with_market_data(input, market.clone())))
        }
    };

    let input = LiveRunnerInput {
        plan: cli.strategy,
        args: cli.args,
        buy: cli.buy,
        poll_interval: settings.driver.poll_interval(),
        tape_dir: settings.driver.tape_dir.clone(),
        options: StrategyOptions {
            retry: settings.retry.policy(),
            ..Default::default()
        },
    };
    let runner = LiveRunner::new(input, &StrategyRegistry::with_defaults(), market, paper).await?;
    runner.run().await
}

#[tokio::main]
async fn main() {
    let dotenv = dotenvy::dotenv();
    let cli = Cli::parse();

    let settings = match Settings::new(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    settings.init_logging();
    match dotenv {
        Ok(path) => info!("Loaded environment from: {}", path.display()),
        Err(_) => info!("No .env file found, using system environment variables"),
    }

    if let Err(e) = run(cli, settings).await {
        error!("Trading stopped: {}", e);
        std::process::exit(1);
    }
}
