//! Replay a recorded tape against the simulated exchange
//!
//! ```bash
//! replay [--start-date "2018-01-10 12:00"] <strategy>|- <file.trade> [-b] [args...]
//! ```
//!
//! `-` replays the strategy recorded in the tape with its recorded
//! arguments. `TBOT_START_DATE` is used when `--start-date` is absent.

use std::path::PathBuf;

use chrono::NaiveDateTime;
use clap::Parser;
use log::{error, info};

use tbot::config::Settings;
use tbot::runner::{ReplayRequest, ReplayRunner};
use tbot::strategy::{StrategyOptions, StrategyRegistry};
use tbot::tape::Tape;
use tbot::Error;

#[derive(Parser)]
#[command(name = "replay", about = "Replay a recorded trade offline")]
struct Cli {
    /// Path to a TOML config file
    #[arg(long)]
    config: Option<String>,

    /// First bar to feed, "YYYY-MM-DD HH:MM"
    #[arg(long)]
    start_date: Option<String>,

    /// Print the report as JSON
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Plan to run, or - for the recorded one
    strategy: String,

    /// Tape written by `trade` or `json2trade`
    tape: PathBuf,

    /// Open the position instead of managing an existing one
    #[arg(short, long, default_value_t = false)]
    buy: bool,

    /// Plan arguments replacing the recorded ones
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn parse_start(value: Option<String>) -> tbot::Result<Option<NaiveDateTime>> {
    value
        .or_else(|| std::env::var("TBOT_START_DATE").ok())
        .map(|s| {
            NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M")
                .map_err(|e| Error::InvalidArgs(format!("start date '{}': {}", s, e)))
        })
        .transpose()
}

async fn run(cli: Cli, settings: Settings) -> tbot::Result<()> {
    let tape = Tape::load(&cli.tape)?;
    let request = ReplayRequest {
        strategy: (cli.strategy != "-").then_some(cli.strategy),
        args: (!cli.args.is_empty()).then_some(cli.args),
        buy: cli.buy,
        start: parse_start(cli.start_date)?,
    };

    let options = StrategyOptions {
        retry: settings.retry.policy(),
        ..Default::default()
    };
    let runner = ReplayRunner::new(StrategyRegistry::with_defaults(), options, &settings.simulation);
    let report = runner.run(&tape, &request).await?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        info!(
            "{} on {}: {} bars, finished={}, state={} capital={:.8}",
            report.strategy,
            tape.pair,
            report.bars_processed,
            report.finished,
            report.status.state,
            report.status.capital
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let settings = match Settings::new(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    settings.init_logging();

    if let Err(e) = run(cli, settings).await {
        error!("Replay failed: {}", e);
        std::process::exit(1);
    }
}
