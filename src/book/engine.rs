//! Depth replication engine: composites deep snapshots with the
//! incremental diff stream, detects desynchronization, and resets.
//!
//! Session lifecycle: buffer diffs until every symbol is covered,
//! install REST snapshots, then apply diffs one by one. Any continuity
//! gap clears all state and starts a fresh session.

use std::collections::HashSet;
use std::time::Duration;

use futures_util::future::try_join_all;
use futures_util::StreamExt;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use crate::book::state::DepthLedger;
use crate::error::{DepthcastError, Result};
use crate::exchange::{DepthDiff, ExchangeApi, MarketEvent, MarketStream};
use crate::sink::SinkDispatcher;

const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(10);
const RESTART_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    /// A validation failed; state was cleared in-engine
    Resync,
    /// The websocket ended; reconnect from scratch
    StreamClosed,
}

pub struct LoaderService<A> {
    api: A,
    sinks: SinkDispatcher,
    symbols: HashSet<String>,
    depth_limit: usize,
    ledger: DepthLedger,
}

impl<A: ExchangeApi> LoaderService<A> {
    pub fn new(
        api: A,
        sinks: SinkDispatcher,
        symbols: impl IntoIterator<Item = String>,
        depth_limit: usize,
    ) -> Self {
        Self {
            api,
            sinks,
            symbols: symbols.into_iter().collect(),
            depth_limit,
            ledger: DepthLedger::new(),
        }
    }

    /// Supervisor loop. Restarts the session on resync, stream loss, and
    /// retryable failures; returns only on a fatal error (cancellation is
    /// handled by the caller dropping this future).
    pub async fn run(&mut self) -> Result<()> {
        loop {
            info!("starting depth session");
            self.ledger.reset();
            match self.run_session().await {
                Ok(SessionEnd::Resync) => info!("resynchronizing"),
                Ok(SessionEnd::StreamClosed) => {
                    warn!("market stream ended, restarting");
                    sleep(RESTART_DELAY).await;
                }
                Err(error) if error.is_retryable() => {
                    error!(%error, "session failed, restarting");
                    sleep(RESTART_DELAY).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn run_session(&mut self) -> Result<SessionEnd> {
        let info = self.api.get_exchange_info(&self.symbols).await?;
        let mut stream = self.api.listen(&self.symbols, &info).await?;

        let covered = match timeout(BOOTSTRAP_TIMEOUT, self.bootstrap(&mut stream)).await {
            Ok(result) => result?,
            Err(_) => return Err(DepthcastError::BootstrapTimeout(BOOTSTRAP_TIMEOUT)),
        };
        if !covered {
            return Ok(SessionEnd::StreamClosed);
        }

        let snapshots = try_join_all(
            self.symbols
                .iter()
                .map(|symbol| self.api.get_depth(symbol, self.depth_limit, &info)),
        )
        .await?;
        self.ledger.install_snapshots(snapshots);
        info!(symbols = self.symbols.len(), "entering steady state");

        while let Some(event) = stream.next().await {
            match event? {
                MarketEvent::Depth(diff) => {
                    if !self.apply_diff(diff).await {
                        self.ledger.reset();
                        return Ok(SessionEnd::Resync);
                    }
                }
                MarketEvent::AggTrade(trade) => self.sinks.dispatch_agg_trade(&trade),
            }
        }
        Ok(SessionEnd::StreamClosed)
    }

    /// Buffer diffs until every configured symbol has one. Diffs are
    /// never applied here. Returns false when the stream ends early.
    async fn bootstrap(&mut self, stream: &mut MarketStream) -> Result<bool> {
        while !self.ledger.covers_all(&self.symbols) {
            match stream.next().await {
                Some(event) => match event? {
                    MarketEvent::Depth(diff) => self.ledger.record_diff(diff),
                    MarketEvent::AggTrade(trade) => self.sinks.dispatch_agg_trade(&trade),
                },
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Steady-state handling of one inbound diff. Returns false when the
    /// stream desynchronized and the session must resynchronize.
    async fn apply_diff(&mut self, diff: DepthDiff) -> bool {
        let symbol = diff.symbol.clone();
        let event_time_ms = diff.event_time_ms;
        let final_update_id = diff.final_update_id;
        let last_final_update_id = diff.last_final_update_id;
        self.ledger.record_diff(diff);

        if !self.ledger.initial_filter_done(&symbol) {
            self.ledger.filter_pending(&symbol);
            self.ledger.mark_filtered(&symbol);
            if !self.ledger.validate_first_pending(&symbol) {
                warn!(symbol, "buffered diffs do not cover the snapshot cursor");
                return false;
            }
        }

        if !self.ledger.validate_continuity(&symbol, last_final_update_id) {
            warn!(
                symbol,
                last_final_update_id, "continuity gap in the diff stream"
            );
            return false;
        }
        self.ledger.set_prev_final_update_id(&symbol, final_update_id);

        if !self.ledger.apply_and_project(&symbol, self.depth_limit) {
            warn!(symbol, "no book state for inbound diff");
            return false;
        }

        let Some(book) = self.ledger.book(&symbol) else {
            return false;
        };
        let bids = book.bids.clone();
        let asks = book.asks.clone();
        self.sinks
            .dispatch_depth(&symbol, event_time_ms, &bids, &asks)
            .await;
        true
    }
}
