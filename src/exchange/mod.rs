//! Exchange access: REST metadata and deep snapshots plus the
//! multiplexed market-data stream.

mod binance;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::book::ScaledPrice;
use crate::error::{DepthcastError, Result};

pub use binance::BinanceFutures;

/// Per-symbol trading metadata, immutable for a session
#[derive(Debug, Clone)]
pub struct SymbolInfo {
    pub symbol: String,
    pub tick_size: Decimal,
    /// Ticks per price unit, resolved once from `tick_size`
    pub scale: i64,
}

impl SymbolInfo {
    pub fn new(symbol: String, tick_size: Decimal) -> Result<Self> {
        let scale = ScaledPrice::scale_for_tick(tick_size).ok_or_else(|| {
            DepthcastError::Protocol(format!("unusable tick size {tick_size} for {symbol}"))
        })?;
        Ok(Self {
            symbol,
            tick_size,
            scale,
        })
    }
}

pub type ExchangeInfo = HashMap<String, SymbolInfo>;

/// Incremental order book change from the diff stream
#[derive(Debug, Clone)]
pub struct DepthDiff {
    pub symbol: String,
    pub event_time_ms: i64,
    pub first_update_id: i64,
    pub final_update_id: i64,
    /// `final_update_id` of the previous diff in the stream (`pu`)
    pub last_final_update_id: i64,
    pub bids: HashMap<ScaledPrice, String>,
    pub asks: HashMap<ScaledPrice, String>,
    /// Highest-priced bid carrying non-zero quantity, if any
    pub first_bid: Option<ScaledPrice>,
    /// Lowest-priced ask carrying non-zero quantity, if any
    pub first_ask: Option<ScaledPrice>,
}

/// One-shot REST image of a book
#[derive(Debug, Clone)]
pub struct DeepSnapshot {
    pub symbol: String,
    pub last_update_id: i64,
    pub bids: HashMap<ScaledPrice, String>,
    pub asks: HashMap<ScaledPrice, String>,
    pub first_bid: ScaledPrice,
    pub first_ask: ScaledPrice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSide {
    Long,
    Short,
}

impl TradeSide {
    /// Mapping of the maker flag (`m`) in aggregate trade events
    pub fn from_maker_flag(is_maker: bool) -> Self {
        if is_maker {
            Self::Long
        } else {
            Self::Short
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AggTrade {
    pub symbol: String,
    pub side: TradeSide,
    pub trade_id: i64,
    pub event_time_ms: i64,
    pub price: String,
    pub quantity: String,
}

/// Tagged union carried by the multiplexed stream
#[derive(Debug, Clone)]
pub enum MarketEvent {
    Depth(DepthDiff),
    AggTrade(AggTrade),
}

pub type MarketStream = BoxStream<'static, Result<MarketEvent>>;

#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Tick sizes for the requested symbols. Fails when the venue does
    /// not serve every requested symbol.
    async fn get_exchange_info(&self, symbols: &HashSet<String>) -> Result<ExchangeInfo>;

    /// Deep snapshot of one book at the given limit.
    async fn get_depth(
        &self,
        symbol: &str,
        limit: usize,
        info: &ExchangeInfo,
    ) -> Result<DeepSnapshot>;

    /// One multiplexed socket covering depth diffs and aggregate trades
    /// for every symbol. The stream ends on a websocket error or close;
    /// dropping it closes the socket.
    async fn listen(&self, symbols: &HashSet<String>, info: &ExchangeInfo)
        -> Result<MarketStream>;
}
