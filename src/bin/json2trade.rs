//! Build a replayable tape from a JSON candle dump or the exchange's
//! one-minute candles
//!
//! ```bash
//! json2trade <candles.json|pair> <file.trade> <plan> <pair> [args...]
//! ```

use std::path::{Path, PathBuf};

use clap::Parser;
use log::{error, info};

use tbot::bars::Bar;
use tbot::config::Settings;
use tbot::market::{Gateway, RestGateway};
use tbot::tape::Tape;

#[derive(Parser)]
#[command(name = "json2trade", about = "Convert candles into a tape")]
struct Cli {
    /// Path to a TOML config file
    #[arg(long)]
    config: Option<String>,

    /// JSON file holding a candle array, or a pair to download
    source: String,

    /// Tape file to write
    tape: PathBuf,

    /// Plan recorded in the tape
    plan: String,

    pair: String,

    /// Plan arguments after the pair
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

async fn load_candles(source: &str, settings: &Settings) -> tbot::Result<Vec<Bar>> {
    if Path::new(source).is_file() {
        let json = std::fs::read_to_string(source)?;
        return Ok(serde_json::from_str(&json)?);
    }
    let gateway = RestGateway::new(&settings.exchange)?;
    gateway.get_candles(source, "oneMin").await
}

async fn run(cli: Cli, settings: Settings) -> tbot::Result<()> {
    let candles = load_candles(&cli.source, &settings).await?;
    info!("{} candles from {}", candles.len(), cli.source);

    let mut args = vec![cli.pair.clone()];
    args.extend(cli.args);
    let tape = Tape::from_candles(candles, &cli.plan, &cli.pair, args);
    tape.write_to(&cli.tape)?;
    println!("Trade saved");
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
        error!("Conversion failed: {}", e);
        std::process::exit(1);
    }
}
