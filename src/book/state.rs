//! Per-symbol replication state: the current projected book, the
//! pending diff buffer, and the continuity cursors.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::book::ScaledPrice;
use crate::exchange::{DeepSnapshot, DepthDiff};

/// Projected book for one symbol
#[derive(Debug, Clone)]
pub struct BookState {
    pub last_update_id: i64,
    pub bids: HashMap<ScaledPrice, String>,
    pub asks: HashMap<ScaledPrice, String>,
    pub first_bid: ScaledPrice,
    pub first_ask: ScaledPrice,
}

impl From<DeepSnapshot> for BookState {
    fn from(snapshot: DeepSnapshot) -> Self {
        Self {
            last_update_id: snapshot.last_update_id,
            bids: snapshot.bids,
            asks: snapshot.asks,
            first_bid: snapshot.first_bid,
            first_ask: snapshot.first_ask,
        }
    }
}

/// All per-symbol replication state, owned by the engine
#[derive(Debug, Default)]
pub struct DepthLedger {
    books: HashMap<String, BookState>,
    /// Buffered diffs keyed by `final_update_id`, ascending
    pending: HashMap<String, BTreeMap<i64, DepthDiff>>,
    initial_filter_done: HashMap<String, bool>,
    prev_final_update_ids: HashMap<String, i64>,
}

impl DepthLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear every book, pending buffer, and cursor.
    pub fn reset(&mut self) {
        self.books.clear();
        self.pending.clear();
        self.initial_filter_done.clear();
        self.prev_final_update_ids.clear();
    }

    pub fn record_diff(&mut self, diff: DepthDiff) {
        self.pending
            .entry(diff.symbol.clone())
            .or_default()
            .insert(diff.final_update_id, diff);
    }

    /// Whether every configured symbol has buffered at least one diff.
    pub fn covers_all(&self, symbols: &HashSet<String>) -> bool {
        symbols.iter().all(|symbol| {
            self.pending
                .get(symbol)
                .is_some_and(|diffs| !diffs.is_empty())
        })
    }

    pub fn install_snapshots(&mut self, snapshots: Vec<DeepSnapshot>) {
        self.books = snapshots
            .into_iter()
            .map(|snapshot| (snapshot.symbol.clone(), BookState::from(snapshot)))
            .collect();
    }

    pub fn book(&self, symbol: &str) -> Option<&BookState> {
        self.books.get(symbol)
    }

    pub fn initial_filter_done(&self, symbol: &str) -> bool {
        self.initial_filter_done.get(symbol).copied().unwrap_or(false)
    }

    pub fn mark_filtered(&mut self, symbol: &str) {
        self.initial_filter_done.insert(symbol.to_string(), true);
    }

    /// Drop buffered diffs that predate the installed snapshot.
    pub fn filter_pending(&mut self, symbol: &str) {
        let Some(book) = self.books.get(symbol) else {
            return;
        };
        if let Some(diffs) = self.pending.get_mut(symbol) {
            diffs.retain(|final_update_id, _| *final_update_id >= book.last_update_id);
        }
    }

    /// The first retained diff must straddle the snapshot cursor:
    /// `first_update_id <= last_update_id <= final_update_id`.
    pub fn validate_first_pending(&self, symbol: &str) -> bool {
        let Some(book) = self.books.get(symbol) else {
            return false;
        };
        let Some(first) = self
            .pending
            .get(symbol)
            .and_then(|diffs| diffs.values().next())
        else {
            return false;
        };
        first.first_update_id <= book.last_update_id && book.last_update_id <= first.final_update_id
    }

    /// Each diff's `pu` must equal the previously applied `u`; the first
    /// application is accepted unconditionally.
    pub fn validate_continuity(&self, symbol: &str, last_final_update_id: i64) -> bool {
        match self.prev_final_update_ids.get(symbol) {
            Some(prev) => *prev == last_final_update_id,
            None => true,
        }
    }

    pub fn set_prev_final_update_id(&mut self, symbol: &str, final_update_id: i64) {
        self.prev_final_update_ids
            .insert(symbol.to_string(), final_update_id);
    }

    /// Apply every pending diff in ascending id order and rebuild the
    /// fixed-width window around the anchors. Every level of the window
    /// is materialized, with `"0"` standing in for levels absent from
    /// both the diff and the prior book. Clears the pending buffer.
    pub fn apply_and_project(&mut self, symbol: &str, depth_limit: usize) -> bool {
        let Some(book) = self.books.get_mut(symbol) else {
            return false;
        };
        let Some(diffs) = self.pending.get_mut(symbol) else {
            return false;
        };

        for diff in diffs.values() {
            let first_bid = diff.first_bid.unwrap_or(book.first_bid);
            let first_ask = diff.first_ask.unwrap_or(book.first_ask);
            if first_bid.is_next_ask_for_bid(&first_ask) {
                book.first_bid = first_bid;
                book.first_ask = first_ask;
            }

            let mut new_bids = HashMap::with_capacity(depth_limit);
            let mut new_asks = HashMap::with_capacity(depth_limit);
            for tick in 0..depth_limit as i64 {
                let bid_key = book.first_bid.next(-tick);
                let ask_key = book.first_ask.next(tick);
                let bid_qty = diff
                    .bids
                    .get(&bid_key)
                    .or_else(|| book.bids.get(&bid_key))
                    .cloned()
                    .unwrap_or_else(|| "0".to_string());
                let ask_qty = diff
                    .asks
                    .get(&ask_key)
                    .or_else(|| book.asks.get(&ask_key))
                    .cloned()
                    .unwrap_or_else(|| "0".to_string());
                new_bids.insert(bid_key, bid_qty);
                new_asks.insert(ask_key, ask_qty);
            }
            book.bids = new_bids;
            book.asks = new_asks;
            book.last_update_id = diff.final_update_id;
        }
        diffs.clear();
        true
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
            && self.pending.values().all(BTreeMap::is_empty)
            && self.prev_final_update_ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use super::*;

    const SYMBOL: &str = "SOLUSDT";
    const SCALE: i64 = 100;
    const DEPTH_LIMIT: usize = 5;

    fn price(raw: Decimal) -> ScaledPrice {
        ScaledPrice::from_price(raw, SCALE)
    }

    fn levels(entries: &[(Decimal, &str)]) -> HashMap<ScaledPrice, String> {
        entries
            .iter()
            .map(|(p, q)| (price(*p), q.to_string()))
            .collect()
    }

    fn snapshot() -> DeepSnapshot {
        DeepSnapshot {
            symbol: SYMBOL.to_string(),
            last_update_id: 100,
            bids: levels(&[
                (dec!(140.50), "10"),
                (dec!(140.49), "11"),
                (dec!(140.48), "12"),
                (dec!(140.47), "13"),
                (dec!(140.46), "14"),
            ]),
            asks: levels(&[
                (dec!(140.51), "20"),
                (dec!(140.52), "21"),
                (dec!(140.53), "22"),
                (dec!(140.54), "23"),
                (dec!(140.55), "24"),
            ]),
            first_bid: price(dec!(140.50)),
            first_ask: price(dec!(140.51)),
        }
    }

    fn diff(
        first: i64,
        last: i64,
        prev: i64,
        bids: &[(Decimal, &str)],
        asks: &[(Decimal, &str)],
    ) -> DepthDiff {
        let first_bid = bids.iter().rev().find(|(_, q)| *q != "0").map(|(p, _)| price(*p));
        let first_ask = asks.iter().find(|(_, q)| *q != "0").map(|(p, _)| price(*p));
        DepthDiff {
            symbol: SYMBOL.to_string(),
            event_time_ms: 1_700_000_000_000 + last,
            first_update_id: first,
            final_update_id: last,
            last_final_update_id: prev,
            bids: levels(bids),
            asks: levels(asks),
            first_bid,
            first_ask,
        }
    }

    fn steady_ledger() -> DepthLedger {
        let mut ledger = DepthLedger::new();
        ledger.install_snapshots(vec![snapshot()]);
        ledger
    }

    #[test]
    fn filter_drops_stale_diffs_only() {
        let mut ledger = steady_ledger();
        ledger.record_diff(diff(80, 90, 79, &[], &[]));
        ledger.record_diff(diff(95, 101, 90, &[], &[]));
        ledger.filter_pending(SYMBOL);

        let retained = &ledger.pending[SYMBOL];
        assert_eq!(retained.len(), 1);
        assert!(retained.contains_key(&101));
    }

    #[test]
    fn first_pending_must_straddle_the_cursor() {
        let mut ledger = steady_ledger();
        ledger.record_diff(diff(95, 101, 90, &[], &[]));
        assert!(ledger.validate_first_pending(SYMBOL));

        let mut gapped = steady_ledger();
        gapped.record_diff(diff(102, 110, 101, &[], &[]));
        assert!(!gapped.validate_first_pending(SYMBOL));
    }

    #[test]
    fn empty_pending_fails_first_validation() {
        let ledger = steady_ledger();
        assert!(!ledger.validate_first_pending(SYMBOL));
    }

    #[test]
    fn continuity_accepts_first_then_requires_chain() {
        let mut ledger = steady_ledger();
        assert!(ledger.validate_continuity(SYMBOL, 999));
        ledger.set_prev_final_update_id(SYMBOL, 101);
        assert!(ledger.validate_continuity(SYMBOL, 101));
        assert!(!ledger.validate_continuity(SYMBOL, 999));
    }

    #[test]
    fn apply_keeps_fixed_window_and_adjacent_anchors() {
        let mut ledger = steady_ledger();
        ledger.record_diff(diff(101, 102, 101, &[(dec!(140.50), "9")], &[]));
        assert!(ledger.apply_and_project(SYMBOL, DEPTH_LIMIT));

        let book = ledger.book(SYMBOL).unwrap();
        assert_eq!(book.bids.len(), DEPTH_LIMIT);
        assert_eq!(book.asks.len(), DEPTH_LIMIT);
        assert_eq!(book.first_bid.value() + 1, book.first_ask.value());
        assert_eq!(book.bids[&price(dec!(140.50))], "9");
        // untouched levels carried over from the prior book
        assert_eq!(book.bids[&price(dec!(140.49))], "11");
        assert!(ledger.pending[SYMBOL].is_empty());
    }

    #[test]
    fn zeroed_level_is_materialized_inside_the_window() {
        let mut ledger = steady_ledger();
        ledger.record_diff(diff(101, 102, 101, &[(dec!(140.50), "0")], &[]));
        ledger.apply_and_project(SYMBOL, DEPTH_LIMIT);

        let book = ledger.book(SYMBOL).unwrap();
        // anchors unchanged: the diff carried no non-zero bid
        assert_eq!(book.first_bid.value(), 14050);
        assert_eq!(book.bids[&price(dec!(140.50))], "0");
        assert_eq!(book.bids.len(), DEPTH_LIMIT);
    }

    #[test]
    fn anchor_shift_recenters_the_window() {
        let mut ledger = steady_ledger();
        ledger.record_diff(diff(
            101,
            102,
            101,
            &[(dec!(140.51), "5")],
            &[(dec!(140.52), "6")],
        ));
        ledger.apply_and_project(SYMBOL, DEPTH_LIMIT);

        let book = ledger.book(SYMBOL).unwrap();
        assert_eq!(book.first_bid.value(), 14051);
        assert_eq!(book.first_ask.value(), 14052);
        assert!(book.bids.contains_key(&price(dec!(140.47))));
        // the old deepest bid fell out of the recentered window
        assert!(!book.bids.contains_key(&price(dec!(140.46))));
        assert_eq!(book.bids.len(), DEPTH_LIMIT);
        assert_eq!(book.asks.len(), DEPTH_LIMIT);
    }

    #[test]
    fn non_adjacent_candidates_do_not_promote() {
        let mut ledger = steady_ledger();
        // candidate bid 140.49 against book ask 140.51 is two ticks away
        ledger.record_diff(diff(101, 102, 101, &[(dec!(140.49), "5")], &[]));
        ledger.apply_and_project(SYMBOL, DEPTH_LIMIT);

        let book = ledger.book(SYMBOL).unwrap();
        assert_eq!(book.first_bid.value(), 14050);
        assert_eq!(book.first_ask.value(), 14051);
    }

    #[test]
    fn empty_pending_apply_is_identity() {
        let mut ledger = steady_ledger();
        let before = ledger.book(SYMBOL).unwrap().clone();
        ledger.pending.entry(SYMBOL.to_string()).or_default();
        assert!(ledger.apply_and_project(SYMBOL, DEPTH_LIMIT));

        let after = ledger.book(SYMBOL).unwrap();
        assert_eq!(after.last_update_id, before.last_update_id);
        assert_eq!(after.bids, before.bids);
        assert_eq!(after.asks, before.asks);
    }

    #[test]
    fn snapshot_projects_to_itself_at_depth() {
        let mut ledger = steady_ledger();
        // a no-op diff inside the stream: no levels touched
        ledger.record_diff(diff(101, 102, 101, &[], &[]));
        ledger.apply_and_project(SYMBOL, DEPTH_LIMIT);

        let book = ledger.book(SYMBOL).unwrap();
        let reference = snapshot();
        assert_eq!(book.bids, reference.bids);
        assert_eq!(book.asks, reference.asks);
    }

    #[test]
    fn applied_ids_are_monotonic() {
        let mut ledger = steady_ledger();
        ledger.record_diff(diff(101, 102, 101, &[], &[]));
        ledger.record_diff(diff(103, 105, 102, &[], &[]));
        ledger.apply_and_project(SYMBOL, DEPTH_LIMIT);
        assert_eq!(ledger.book(SYMBOL).unwrap().last_update_id, 105);
    }

    #[test]
    fn reset_clears_everything() {
        let mut ledger = steady_ledger();
        ledger.record_diff(diff(101, 102, 101, &[], &[]));
        ledger.set_prev_final_update_id(SYMBOL, 102);
        ledger.mark_filtered(SYMBOL);
        ledger.reset();

        assert!(ledger.is_empty());
        assert!(!ledger.initial_filter_done(SYMBOL));
        assert!(ledger.book(SYMBOL).is_none());
    }
}
