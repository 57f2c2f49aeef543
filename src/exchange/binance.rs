//! Binance USDⓈ-M futures adapter: REST metadata/snapshots and the
//! combined websocket stream.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use async_stream::stream;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::book::ScaledPrice;
use crate::error::{DepthcastError, Result};

use super::{
    AggTrade, DeepSnapshot, DepthDiff, ExchangeApi, ExchangeInfo, MarketEvent, MarketStream,
    SymbolInfo, TradeSide,
};

const API_URL: &str = "https://fapi.binance.com/fapi/v1/";
const WS_URL: &str = "wss://fstream.binance.com/stream";

pub struct BinanceFutures {
    http: reqwest::Client,
    api_url: String,
    ws_url: String,
    /// Diff stream cadence in milliseconds
    ws_speed: u32,
}

impl BinanceFutures {
    pub fn new(http: reqwest::Client, ws_speed: u32) -> Self {
        Self {
            http,
            api_url: API_URL.to_string(),
            ws_url: WS_URL.to_string(),
            ws_speed,
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, params: &[(&str, String)]) -> Result<T> {
        let response = self
            .http
            .get(format!("{}{path}", self.api_url))
            .query(params)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DepthcastError::ExchangeHttp {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }

    fn stream_names(symbols: &HashSet<String>, ws_speed: u32) -> Vec<String> {
        let mut names: Vec<String> = symbols
            .iter()
            .flat_map(|symbol| {
                let lower = symbol.to_lowercase();
                [
                    format!("{lower}@depth@{ws_speed}ms"),
                    format!("{lower}@aggTrade"),
                ]
            })
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl ExchangeApi for BinanceFutures {
    async fn get_exchange_info(&self, symbols: &HashSet<String>) -> Result<ExchangeInfo> {
        let response: ExchangeInfoResponse = self.get_json("exchangeInfo", &[]).await?;
        build_exchange_info(response, symbols)
    }

    async fn get_depth(
        &self,
        symbol: &str,
        limit: usize,
        info: &ExchangeInfo,
    ) -> Result<DeepSnapshot> {
        let params = [
            ("symbol", symbol.to_string()),
            ("limit", limit.to_string()),
        ];
        let response: DepthResponse = self.get_json("depth", &params).await?;
        let scale = symbol_scale(info, symbol)?;

        // Snapshot payloads order both sides best-first already.
        let (bids, first_bid) = parse_levels(&response.bids, scale, false)?;
        let (asks, first_ask) = parse_levels(&response.asks, scale, false)?;
        let (Some(first_bid), Some(first_ask)) = (first_bid, first_ask) else {
            return Err(DepthcastError::Protocol(format!(
                "no first bid or ask in depth snapshot for {symbol}"
            )));
        };

        Ok(DeepSnapshot {
            symbol: symbol.to_string(),
            last_update_id: response.last_update_id,
            bids,
            asks,
            first_bid,
            first_ask,
        })
    }

    async fn listen(
        &self,
        symbols: &HashSet<String>,
        info: &ExchangeInfo,
    ) -> Result<MarketStream> {
        let names = Self::stream_names(symbols, self.ws_speed);
        let (mut socket, _) = connect_async(self.ws_url.as_str()).await?;

        let request = serde_json::json!({
            "method": "SUBSCRIBE",
            "params": names,
            "id": 1,
        });
        socket.send(Message::Text(request.to_string())).await?;
        info!(streams = names.len(), "subscribed to market streams");

        let subscribed: HashSet<String> = names.into_iter().collect();
        let info = info.clone();

        Ok(Box::pin(stream! {
            let (mut write, mut read) = socket.split();
            loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        match parse_frame(&text, &subscribed, &info) {
                            Ok(Some(event)) => yield Ok(event),
                            Ok(None) => {}
                            Err(error) => {
                                warn!(%error, "dropping malformed frame");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        debug!("answering websocket ping");
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(?frame, "market stream closed by exchange");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        yield Err(error.into());
                        break;
                    }
                    None => break,
                }
            }
        }))
    }
}

#[derive(Debug, Deserialize)]
struct ExchangeInfoResponse {
    symbols: Vec<SymbolEntry>,
}

#[derive(Debug, Deserialize)]
struct SymbolEntry {
    symbol: String,
    status: String,
    #[serde(rename = "contractType", default)]
    contract_type: String,
    filters: Vec<FilterEntry>,
}

#[derive(Debug, Deserialize)]
struct FilterEntry {
    #[serde(rename = "filterType")]
    filter_type: String,
    #[serde(rename = "tickSize")]
    tick_size: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DepthResponse {
    #[serde(rename = "lastUpdateId")]
    last_update_id: i64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
struct RawDepthUpdate {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "T")]
    event_time_ms: i64,
    #[serde(rename = "U")]
    first_update_id: i64,
    #[serde(rename = "u")]
    final_update_id: i64,
    #[serde(rename = "pu")]
    last_final_update_id: i64,
    #[serde(rename = "b")]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a")]
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
struct RawAggTrade {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "m")]
    is_maker: bool,
    #[serde(rename = "a")]
    trade_id: i64,
    #[serde(rename = "T")]
    event_time_ms: i64,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "q")]
    quantity: String,
}

fn build_exchange_info(
    response: ExchangeInfoResponse,
    symbols: &HashSet<String>,
) -> Result<ExchangeInfo> {
    let mut info = ExchangeInfo::new();
    for entry in response.symbols {
        if !symbols.contains(&entry.symbol)
            || entry.status != "TRADING"
            || entry.contract_type != "PERPETUAL"
        {
            continue;
        }
        let tick_size = entry
            .filters
            .iter()
            .find(|filter| filter.filter_type == "PRICE_FILTER")
            .and_then(|filter| filter.tick_size.as_deref())
            .ok_or_else(|| {
                DepthcastError::Protocol(format!("no PRICE_FILTER for {}", entry.symbol))
            })?;
        let tick_size = parse_decimal(tick_size, "tickSize")?;
        info.insert(entry.symbol.clone(), SymbolInfo::new(entry.symbol, tick_size)?);
    }
    if info.len() != symbols.len() {
        let missing: Vec<&str> = symbols
            .iter()
            .filter(|symbol| !info.contains_key(*symbol))
            .map(String::as_str)
            .collect();
        return Err(DepthcastError::Validation(format!(
            "exchange does not serve requested symbols: {}",
            missing.join(", ")
        )));
    }
    Ok(info)
}

fn parse_frame(
    text: &str,
    subscribed: &HashSet<String>,
    info: &ExchangeInfo,
) -> Result<Option<MarketEvent>> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    // Subscription acks and unknown streams carry no payload of interest.
    let Some(stream_name) = value.get("stream").and_then(|v| v.as_str()) else {
        return Ok(None);
    };
    if !subscribed.contains(stream_name) {
        return Ok(None);
    }
    let data = value
        .get("data")
        .cloned()
        .ok_or_else(|| DepthcastError::Protocol("frame without data".to_string()))?;
    match data.get("e").and_then(|e| e.as_str()) {
        Some("depthUpdate") => {
            let raw: RawDepthUpdate = serde_json::from_value(data)?;
            Ok(Some(MarketEvent::Depth(depth_diff_from_raw(raw, info)?)))
        }
        Some("aggTrade") => {
            let raw: RawAggTrade = serde_json::from_value(data)?;
            Ok(Some(MarketEvent::AggTrade(AggTrade {
                symbol: raw.symbol,
                side: TradeSide::from_maker_flag(raw.is_maker),
                trade_id: raw.trade_id,
                event_time_ms: raw.event_time_ms,
                price: raw.price,
                quantity: raw.quantity,
            })))
        }
        other => Err(DepthcastError::Protocol(format!(
            "unexpected event type {other:?}"
        ))),
    }
}

fn depth_diff_from_raw(raw: RawDepthUpdate, info: &ExchangeInfo) -> Result<DepthDiff> {
    let scale = symbol_scale(info, &raw.symbol)?;
    // Diff bids are scanned reversed so the first non-zero level seen
    // is the highest-priced one.
    let (bids, first_bid) = parse_levels(&raw.bids, scale, true)?;
    let (asks, first_ask) = parse_levels(&raw.asks, scale, false)?;
    Ok(DepthDiff {
        symbol: raw.symbol,
        event_time_ms: raw.event_time_ms,
        first_update_id: raw.first_update_id,
        final_update_id: raw.final_update_id,
        last_final_update_id: raw.last_final_update_id,
        bids,
        asks,
        first_bid,
        first_ask,
    })
}

fn parse_levels(
    levels: &[[String; 2]],
    scale: i64,
    reverse: bool,
) -> Result<(HashMap<ScaledPrice, String>, Option<ScaledPrice>)> {
    let mut parsed = HashMap::with_capacity(levels.len());
    let mut first_price = None;

    let mut scan = |level: &[String; 2]| -> Result<()> {
        let [price, qty] = level;
        let price = ScaledPrice::from_price(parse_decimal(price, "price")?, scale);
        if first_price.is_none() && !parse_decimal(qty, "quantity")?.is_zero() {
            first_price = Some(price);
        }
        parsed.insert(price, qty.clone());
        Ok(())
    };
    if reverse {
        for level in levels.iter().rev() {
            scan(level)?;
        }
    } else {
        for level in levels {
            scan(level)?;
        }
    }

    Ok((parsed, first_price))
}

fn symbol_scale(info: &ExchangeInfo, symbol: &str) -> Result<i64> {
    info.get(symbol)
        .map(|entry| entry.scale)
        .ok_or_else(|| DepthcastError::Protocol(format!("unknown symbol {symbol}")))
}

fn parse_decimal(raw: &str, field: &str) -> Result<Decimal> {
    Decimal::from_str(raw)
        .map_err(|_| DepthcastError::Protocol(format!("unparseable {field} {raw:?}")))
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn sol_info() -> ExchangeInfo {
        let mut info = ExchangeInfo::new();
        info.insert(
            "SOLUSDT".to_string(),
            SymbolInfo::new("SOLUSDT".to_string(), dec!(0.01)).unwrap(),
        );
        info
    }

    fn subscribed() -> HashSet<String> {
        ["solusdt@depth@500ms", "solusdt@aggTrade"]
            .into_iter()
            .map(String::from)
            .collect()
    }

    #[test]
    fn decodes_depth_update_frame() {
        let frame = r#"{
            "stream": "solusdt@depth@500ms",
            "data": {
                "e": "depthUpdate", "E": 1700000000100, "T": 1700000000095,
                "s": "SOLUSDT", "U": 90, "u": 101, "pu": 89,
                "b": [["140.50", "3.2"], ["140.49", "0"]],
                "a": [["140.51", "1.1"]]
            }
        }"#;

        let event = parse_frame(frame, &subscribed(), &sol_info()).unwrap().unwrap();
        let MarketEvent::Depth(diff) = event else {
            panic!("expected a depth diff");
        };
        assert_eq!(diff.final_update_id, 101);
        assert_eq!(diff.last_final_update_id, 89);
        assert_eq!(diff.first_bid.unwrap().value(), 14050);
        assert_eq!(diff.first_ask.unwrap().value(), 14051);
        assert_eq!(diff.bids.len(), 2);
    }

    #[test]
    fn decodes_agg_trade_frame() {
        let frame = r#"{
            "stream": "solusdt@aggTrade",
            "data": {
                "e": "aggTrade", "s": "SOLUSDT", "m": true,
                "a": 42, "T": 1700000000100, "p": "140.50", "q": "2.5"
            }
        }"#;

        let event = parse_frame(frame, &subscribed(), &sol_info()).unwrap().unwrap();
        let MarketEvent::AggTrade(trade) = event else {
            panic!("expected an aggregate trade");
        };
        assert_eq!(trade.side, TradeSide::Long);
        assert_eq!(trade.trade_id, 42);
        assert_eq!(trade.price, "140.50");
    }

    #[test]
    fn skips_subscription_acks_and_foreign_streams() {
        let ack = r#"{"result": null, "id": 1}"#;
        assert!(parse_frame(ack, &subscribed(), &sol_info()).unwrap().is_none());

        let foreign = r#"{"stream": "btcusdt@depth@500ms", "data": {"e": "depthUpdate"}}"#;
        assert!(parse_frame(foreign, &subscribed(), &sol_info()).unwrap().is_none());
    }

    #[test]
    fn reverse_scan_picks_highest_nonzero_bid() {
        // Payload low-to-high with a zeroed top: reversed scan must land
        // on the highest level that still has quantity.
        let levels = [
            [String::from("140.48"), String::from("5")],
            [String::from("140.49"), String::from("2")],
            [String::from("140.50"), String::from("0")],
        ];
        let (parsed, first) = parse_levels(&levels, 100, true).unwrap();
        assert_eq!(first.unwrap().value(), 14049);
        assert_eq!(parsed.len(), 3);
    }

    #[test]
    fn natural_scan_picks_first_nonzero_level() {
        let levels = [
            [String::from("140.51"), String::from("0")],
            [String::from("140.52"), String::from("4")],
        ];
        let (_, first) = parse_levels(&levels, 100, false).unwrap();
        assert_eq!(first.unwrap().value(), 14052);
    }

    #[test]
    fn exchange_info_keeps_trading_perpetuals_only() {
        let response: ExchangeInfoResponse = serde_json::from_str(
            r#"{"symbols": [
                {"symbol": "SOLUSDT", "status": "TRADING", "contractType": "PERPETUAL",
                 "filters": [{"filterType": "PRICE_FILTER", "tickSize": "0.01"}]},
                {"symbol": "BTCUSDT_240329", "status": "TRADING", "contractType": "CURRENT_QUARTER",
                 "filters": [{"filterType": "PRICE_FILTER", "tickSize": "0.1"}]}
            ]}"#,
        )
        .unwrap();

        let symbols: HashSet<String> = [String::from("SOLUSDT")].into();
        let info = build_exchange_info(response, &symbols).unwrap();
        assert_eq!(info.len(), 1);
        assert_eq!(info["SOLUSDT"].scale, 100);
    }

    #[test]
    fn exchange_info_subset_is_an_error() {
        let response: ExchangeInfoResponse = serde_json::from_str(
            r#"{"symbols": [
                {"symbol": "SOLUSDT", "status": "TRADING", "contractType": "PERPETUAL",
                 "filters": [{"filterType": "PRICE_FILTER", "tickSize": "0.01"}]}
            ]}"#,
        )
        .unwrap();

        let symbols: HashSet<String> =
            [String::from("SOLUSDT"), String::from("ETHUSDT")].into();
        let error = build_exchange_info(response, &symbols).unwrap_err();
        assert!(matches!(error, DepthcastError::Validation(_)));
    }

    #[test]
    fn stream_names_cover_both_channels() {
        let symbols: HashSet<String> = [String::from("SOLUSDT")].into();
        let names = BinanceFutures::stream_names(&symbols, 500);
        assert_eq!(names, vec!["solusdt@aggTrade", "solusdt@depth@500ms"]);
    }
}
