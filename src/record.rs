//! Queue entries and their on-disk MessagePack shapes.
//!
//! Records are flat maps with single-letter keys; the data type is not
//! part of the record, it is implied by the directory the file lives in.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::book::ScaledPrice;
use crate::exchange::{AggTrade, TradeSide};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Depth,
    AggTrade,
}

impl DataType {
    /// Directory name under the data root
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Depth => "depth",
            Self::AggTrade => "agg_trade",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Projected book window at one event time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthRecord {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "t")]
    pub event_time_ms: i64,
    #[serde(rename = "b")]
    pub bids: BTreeMap<String, String>,
    #[serde(rename = "a")]
    pub asks: BTreeMap<String, String>,
}

impl DepthRecord {
    pub fn new(
        symbol: &str,
        event_time_ms: i64,
        bids: &HashMap<ScaledPrice, String>,
        asks: &HashMap<ScaledPrice, String>,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            event_time_ms,
            bids: stringify_levels(bids),
            asks: stringify_levels(asks),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggTradeRecord {
    #[serde(rename = "m")]
    pub side: TradeSide,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "t")]
    pub event_time_ms: i64,
    #[serde(rename = "p")]
    pub price: String,
    #[serde(rename = "q")]
    pub quantity: String,
}

impl From<&AggTrade> for AggTradeRecord {
    fn from(trade: &AggTrade) -> Self {
        Self {
            side: trade.side,
            symbol: trade.symbol.clone(),
            event_time_ms: trade.event_time_ms,
            price: trade.price.clone(),
            quantity: trade.quantity.clone(),
        }
    }
}

/// What crosses the queue to the writer
#[derive(Debug, Clone)]
pub enum QueueEntry {
    Depth(DepthRecord),
    AggTrade(AggTradeRecord),
}

impl QueueEntry {
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Depth(_) => DataType::Depth,
            Self::AggTrade(_) => DataType::AggTrade,
        }
    }
}

fn stringify_levels(levels: &HashMap<ScaledPrice, String>) -> BTreeMap<String, String> {
    levels
        .iter()
        .map(|(price, qty)| (price.to_string(), qty.clone()))
        .collect()
}
