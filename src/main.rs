use anyhow::Result;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use log::info;
use market_desk::{
    commands::{
        backtest, evaluate_predictions, export_history, gap, indicators, predict, quote, risk,
        serve,
    },
    config::ServiceSettings,
    context::{AppContext, DEFAULT_HORIZON_DAYS},
    models::HistoryRange,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "market-desk")]
#[command(about = "Market data, indicators, heuristic forecasts and backtests over REST and CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the REST API and dashboard
    Serve,
    /// Latest quote for a symbol
    Quote {
        symbol: String,
    },
    /// Quote plus RSI, MACD and Bollinger bands
    Indicators {
        symbol: String,
        /// History range (5d, 1mo, 3mo, 6mo, 1y, 2y, 5y, 10y, max)
        #[arg(long, value_parser = parse_range, default_value = "1y")]
        range: HistoryRange,
    },
    /// Ensemble price prediction; the result is logged to SQLite
    Predict {
        symbol: String,
        /// Trading days ahead (1-30)
        #[arg(long, default_value_t = DEFAULT_HORIZON_DAYS)]
        horizon: u32,
    },
    /// Backtest a strategy on one or more symbols
    Backtest {
        #[arg(required = true, num_args = 1..)]
        symbols: Vec<String>,
        /// Strategy id (see /api/strategies)
        #[arg(long)]
        strategy: String,
        #[arg(long, value_parser = parse_range)]
        range: Option<HistoryRange>,
        /// Replay a history snapshot instead of calling the provider
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: Option<PathBuf>,
        /// Strategy or simulation parameter, e.g. --param period=10
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,
    },
    /// Earnings, dividend, volatility and gap risk for a symbol
    Risk {
        symbol: String,
        /// Current VIX level
        #[arg(long)]
        vix: Option<f64>,
    },
    /// Predicted ASX 200 opening gap from the last US session
    Gap,
    /// Score matured predictions against actual closes
    EvaluatePredictions {
        /// Evaluate as of this date (YYYY-MM-DD, defaults to today)
        #[arg(long)]
        as_of: Option<NaiveDate>,
    },
    /// Save history for offline backtests
    ExportHistory {
        #[arg(required = true, num_args = 1..)]
        symbols: Vec<String>,
        #[arg(short, long = "output", value_name = "PATH")]
        output: PathBuf,
        #[arg(long, value_parser = parse_range, default_value = "5y")]
        range: HistoryRange,
    },
}

fn parse_range(raw: &str) -> std::result::Result<HistoryRange, String> {
    HistoryRange::parse(raw).map_err(|err| err.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();

    let settings = ServiceSettings::from_env()?;
    let app_context = AppContext::initialize(settings)?;

    info!("Starting market-desk. Not financial advice.");

    match command {
        Commands::Serve => serve::run(&app_context).await?,
        Commands::Quote { symbol } => quote::run(&app_context, &symbol).await?,
        Commands::Indicators { symbol, range } => {
            indicators::run(&app_context, &symbol, range).await?
        }
        Commands::Predict { symbol, horizon } => {
            predict::run(&app_context, &symbol, horizon).await?
        }
        Commands::Backtest {
            symbols,
            strategy,
            range,
            data_file,
            params,
        } => {
            backtest::run(
                &app_context,
                &symbols,
                &strategy,
                range,
                data_file.as_deref(),
                &params,
            )
            .await?
        }
        Commands::Risk { symbol, vix } => risk::run(&app_context, &symbol, vix).await?,
        Commands::Gap => gap::run(&app_context).await?,
        Commands::EvaluatePredictions { as_of } => {
            evaluate_predictions::run(&app_context, as_of).await?
        }
        Commands::ExportHistory {
            symbols,
            output,
            range,
        } => export_history::run(&app_context, &symbols, range, &output).await?,
    }

    Ok(())
}
