//! Postgres sink: batched depth rows per applied snapshot, plus the
//! schema management used by the backfill command.

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, QueryBuilder};
use tracing::{info, warn};

use crate::book::ScaledPrice;
use crate::config::PostgresConfig;
use crate::error::Result;

const CREATE_DEPTH_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS depth (
    id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
    symbol text NOT NULL,
    type text NOT NULL,
    price numeric NOT NULL,
    quantity numeric NOT NULL,
    datetime_at timestamptz NOT NULL
)
"#;

const CREATE_AGG_TRADE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS agg_trade (
    id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
    symbol text NOT NULL,
    type text NOT NULL,
    price numeric NOT NULL,
    quantity numeric NOT NULL,
    datetime_at timestamptz NOT NULL
)
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthSide {
    Bid,
    Ask,
}

impl DepthSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bid => "bid",
            Self::Ask => "ask",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DepthRow {
    pub symbol: String,
    pub side: DepthSide,
    pub price: Decimal,
    pub quantity: Decimal,
    pub datetime_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AggTradeRow {
    pub symbol: String,
    pub side: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub datetime_at: DateTime<Utc>,
}

/// Rows for one projected window: `2 * depth_limit` entries, zero
/// quantities included (a zero row means the level was removed).
pub fn snapshot_rows(
    symbol: &str,
    event_time_ms: i64,
    bids: &HashMap<ScaledPrice, String>,
    asks: &HashMap<ScaledPrice, String>,
) -> Vec<DepthRow> {
    let datetime_at = event_datetime(event_time_ms);
    let mut rows = Vec::with_capacity(bids.len() + asks.len());
    for (side, levels) in [(DepthSide::Bid, bids), (DepthSide::Ask, asks)] {
        for (price, qty) in levels {
            let Ok(quantity) = Decimal::from_str(qty) else {
                warn!(symbol, qty, "unparseable quantity, skipping row");
                continue;
            };
            rows.push(DepthRow {
                symbol: symbol.to_string(),
                side,
                price: price.to_decimal(),
                quantity,
                datetime_at,
            });
        }
    }
    rows
}

pub fn event_datetime(event_time_ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(event_time_ms).unwrap_or_else(Utc::now)
}

/// Store for replicated market data
#[derive(Clone)]
pub struct MarketRepository {
    pool: PgPool,
}

impl MarketRepository {
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url())
            .await?;
        info!("connected to postgres");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_depth_schema(&self) -> Result<()> {
        sqlx::query(CREATE_DEPTH_TABLE).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn ensure_agg_trade_schema(&self) -> Result<()> {
        sqlx::query(CREATE_AGG_TRADE_TABLE)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn drop_table(&self, table: &str) -> Result<()> {
        sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn truncate(&self, table: &str) -> Result<()> {
        sqlx::query(&format!("TRUNCATE TABLE {table}"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// One multi-row INSERT per snapshot.
    pub async fn insert_depth_rows(&self, rows: &[DepthRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut builder = QueryBuilder::<sqlx::Postgres>::new(
            "INSERT INTO depth (symbol, type, price, quantity, datetime_at) ",
        );
        builder.push_values(rows, |mut values, row| {
            values
                .push_bind(&row.symbol)
                .push_bind(row.side.as_str())
                .push_bind(row.price)
                .push_bind(row.quantity)
                .push_bind(row.datetime_at);
        });
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    pub async fn insert_agg_trades(&self, rows: &[AggTradeRow]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut builder = QueryBuilder::<sqlx::Postgres>::new(
            "INSERT INTO agg_trade (symbol, type, price, quantity, datetime_at) ",
        );
        builder.push_values(rows, |mut values, row| {
            values
                .push_bind(&row.symbol)
                .push_bind(&row.side)
                .push_bind(row.price)
                .push_bind(row.quantity)
                .push_bind(row.datetime_at);
        });
        builder.build().execute(&self.pool).await?;
        Ok(())
    }
}
