//! Sink routing: every applied snapshot goes to the database (when
//! enabled) and to the writer queue; aggregate trades go straight to
//! the queue.

pub mod database;
pub mod file;

use std::collections::HashMap;
use std::sync::mpsc::{SyncSender, TrySendError};

use tracing::{error, warn};

use crate::book::ScaledPrice;
use crate::exchange::AggTrade;
use crate::record::{AggTradeRecord, DepthRecord, QueueEntry};

pub use database::{snapshot_rows, DepthRow, DepthSide, MarketRepository};
pub use file::{spawn_writer, WriterService};

/// Queue capacity between the loader and the writer
pub const QUEUE_CAPACITY: usize = 10_000;

/// Sentinel-terminated: `None` tells the writer to shut down
pub type QueueSender = SyncSender<Option<QueueEntry>>;

#[derive(Clone)]
pub struct SinkDispatcher {
    repository: Option<MarketRepository>,
    queue: QueueSender,
    synchronous_writes: bool,
}

impl SinkDispatcher {
    pub fn new(
        repository: Option<MarketRepository>,
        queue: QueueSender,
        synchronous_writes: bool,
    ) -> Self {
        Self {
            repository,
            queue,
            synchronous_writes,
        }
    }

    /// Route one applied window. Database failures are logged and never
    /// reach the engine.
    pub async fn dispatch_depth(
        &self,
        symbol: &str,
        event_time_ms: i64,
        bids: &HashMap<ScaledPrice, String>,
        asks: &HashMap<ScaledPrice, String>,
    ) {
        if let Some(repository) = &self.repository {
            let rows = snapshot_rows(symbol, event_time_ms, bids, asks);
            if self.synchronous_writes {
                if let Err(error) = repository.insert_depth_rows(&rows).await {
                    error!(%error, symbol, "depth insert failed");
                }
            } else {
                let repository = repository.clone();
                let symbol = symbol.to_string();
                tokio::spawn(async move {
                    if let Err(error) = repository.insert_depth_rows(&rows).await {
                        error!(%error, symbol, "depth insert failed");
                    }
                });
            }
        }

        self.enqueue(QueueEntry::Depth(DepthRecord::new(
            symbol,
            event_time_ms,
            bids,
            asks,
        )));
    }

    pub fn dispatch_agg_trade(&self, trade: &AggTrade) {
        self.enqueue(QueueEntry::AggTrade(AggTradeRecord::from(trade)));
    }

    fn enqueue(&self, entry: QueueEntry) {
        match self.queue.try_send(Some(entry)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("record queue full, dropping entry"),
            Err(TrySendError::Disconnected(_)) => warn!("record queue disconnected"),
        }
    }

    /// Ask the writer to finish. Safe to call more than once.
    pub fn close(&self) {
        let _ = self.queue.send(None);
    }
}
