//! Load recorded msgpack files into Postgres, one table per data type.

use std::path::Path;
use std::str::FromStr;

use rust_decimal::Decimal;
use tracing::info;

use crate::config::{AppConfig, AppEnv};
use crate::error::{DepthcastError, Result};
use crate::record::{AggTradeRecord, DataType, DepthRecord};
use crate::sink::database::{event_datetime, AggTradeRow, DepthRow, DepthSide, MarketRepository};
use crate::sink::file::{read_records, sorted_record_files};

/// Recreate the target table and replay every recorded file into it in
/// hour order. In dev the table is dropped first to refresh its schema.
pub async fn run(config: &AppConfig, data_type: DataType) -> Result<()> {
    let repository = MarketRepository::connect(&config.postgres).await?;
    let table = data_type.as_str();

    if config.env == AppEnv::Dev {
        repository.drop_table(table).await?;
    }
    match data_type {
        DataType::Depth => repository.ensure_depth_schema().await?,
        DataType::AggTrade => repository.ensure_agg_trade_schema().await?,
    }
    repository.truncate(table).await?;

    let dir = config.data_dir.join(table);
    for file in sorted_record_files(&dir)? {
        info!(file = %file.display(), "processing record file");
        match data_type {
            DataType::Depth => load_depth_file(&repository, &file).await?,
            DataType::AggTrade => load_agg_trade_file(&repository, &file).await?,
        }
    }
    info!(table, "backfill finished");
    Ok(())
}

async fn load_depth_file(repository: &MarketRepository, file: &Path) -> Result<()> {
    let records: Vec<DepthRecord> = read_records(file)?;
    for record in &records {
        let rows = depth_rows(record)?;
        repository.insert_depth_rows(&rows).await?;
    }
    info!(records = records.len(), file = %file.display(), "loaded depth records");
    Ok(())
}

async fn load_agg_trade_file(repository: &MarketRepository, file: &Path) -> Result<()> {
    let records: Vec<AggTradeRecord> = read_records(file)?;
    let rows = records
        .iter()
        .map(|record| {
            Ok(AggTradeRow {
                symbol: record.symbol.clone(),
                side: record.side.as_str().to_string(),
                price: parse_recorded_decimal(&record.price)?,
                quantity: parse_recorded_decimal(&record.quantity)?,
                datetime_at: event_datetime(record.event_time_ms),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    repository.insert_agg_trades(&rows).await?;
    info!(records = rows.len(), file = %file.display(), "loaded trade records");
    Ok(())
}

fn depth_rows(record: &DepthRecord) -> Result<Vec<DepthRow>> {
    let datetime_at = event_datetime(record.event_time_ms);
    let mut rows = Vec::with_capacity(record.bids.len() + record.asks.len());
    for (side, levels) in [(DepthSide::Bid, &record.bids), (DepthSide::Ask, &record.asks)] {
        for (price, quantity) in levels {
            rows.push(DepthRow {
                symbol: record.symbol.clone(),
                side,
                price: parse_recorded_decimal(price)?,
                quantity: parse_recorded_decimal(quantity)?,
                datetime_at,
            });
        }
    }
    Ok(rows)
}

fn parse_recorded_decimal(raw: &str) -> Result<Decimal> {
    Decimal::from_str(raw)
        .map_err(|_| DepthcastError::Internal(format!("corrupt recorded value {raw:?}")))
}
