use std::sync::mpsc::sync_channel;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use depthcast::book::LoaderService;
use depthcast::config::{AppConfig, AppEnv};
use depthcast::error::{DepthcastError, Result};
use depthcast::exchange::BinanceFutures;
use depthcast::record::{AggTradeRecord, DataType, DepthRecord};
use depthcast::sink::file::{read_records, sorted_record_files};
use depthcast::sink::{spawn_writer, MarketRepository, SinkDispatcher, QUEUE_CAPACITY};

#[derive(Parser)]
#[command(name = "depthcast")]
#[command(version = "0.1.0")]
#[command(about = "Binance futures order book replication daemon", long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "config.yml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replicate order books and trades into the configured sinks
    LoadData,
    /// Load recorded msgpack files into Postgres
    Backfill {
        #[arg(value_enum)]
        data_type: DataTypeArg,
    },
    /// Print a summary of recorded msgpack files
    Read,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DataTypeArg {
    Depth,
    AggTrade,
}

impl From<DataTypeArg> for DataType {
    fn from(arg: DataTypeArg) -> Self {
        match arg {
            DataTypeArg::Depth => Self::Depth,
            DataTypeArg::AggTrade => Self::AggTrade,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;
    init_logging(&config);

    match cli.command {
        Commands::LoadData => run_load_data(config).await,
        Commands::Backfill { data_type } => {
            depthcast::backfill::run(&config, data_type.into()).await
        }
        Commands::Read => run_read(&config),
    }
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.env_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_load_data(config: AppConfig) -> Result<()> {
    std::fs::create_dir_all(&config.data_dir)?;

    let (queue_tx, queue_rx) = sync_channel(QUEUE_CAPACITY);
    let writer = spawn_writer(config.data_dir.clone(), queue_rx)?;

    // dev runs without a database; only the msgpack sink is live
    let repository = match config.env {
        AppEnv::Prod => {
            let repository = MarketRepository::connect(&config.postgres).await?;
            repository.ensure_depth_schema().await?;
            Some(repository)
        }
        AppEnv::Dev => None,
    };

    let sinks = SinkDispatcher::new(repository, queue_tx, config.postgres.synchronous_writes);
    let api = BinanceFutures::new(reqwest::Client::new(), config.loader.ws_speed);
    let mut service = LoaderService::new(
        api,
        sinks.clone(),
        config.loader.symbols.clone(),
        config.loader.depth_limit,
    );

    let result = tokio::select! {
        result = service.run() => result,
        _ = shutdown_signal() => {
            info!("shutdown requested, closing loader");
            Ok(())
        }
    };

    sinks.close();
    let joined = tokio::task::spawn_blocking(move || writer.join())
        .await
        .map_err(|e| DepthcastError::Internal(format!("writer join failed: {e}")))?;
    match joined {
        Ok(writer_result) => writer_result?,
        Err(_) => {
            return Err(DepthcastError::Internal(
                "writer thread panicked".to_string(),
            ))
        }
    }

    result
}

fn run_read(config: &AppConfig) -> Result<()> {
    let depth_dir = config.data_dir.join(DataType::Depth.as_str());
    if depth_dir.is_dir() {
        for file in sorted_record_files(&depth_dir)? {
            for record in read_records::<DepthRecord>(&file)? {
                info!(
                    symbol = record.symbol,
                    time = record.event_time_ms,
                    bids = record.bids.len(),
                    asks = record.asks.len(),
                    "depth record"
                );
            }
        }
    }

    let trade_dir = config.data_dir.join(DataType::AggTrade.as_str());
    if trade_dir.is_dir() {
        for file in sorted_record_files(&trade_dir)? {
            for record in read_records::<AggTradeRecord>(&file)? {
                info!(?record, "trade record");
            }
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
