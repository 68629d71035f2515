//! Subscription Ledger
//!
//! Per-channel, per-kind record of what the exchange should be streaming.
//!
//! # Design
//!
//! The ledger tracks:
//! - Which symbols each component owns, per data kind (the live set is the
//!   union over owners)
//! - One-shot snapshot requests, consumed by the next reconciliation
//! - The last set confirmed on the wire (the reconciled baseline)
//!
//! Every outbound frame re-sends the full live set, so the baseline is only
//! used to decide *whether* a reconciliation is needed, never *what* to send.
//! The supervisor drives the handshake: [`SubscriptionLedger::plan`] takes a
//! snapshot of the live set, [`SubscriptionLedger::commit`] advances the
//! baseline once the frame is on the wire, [`SubscriptionLedger::abandon`]
//! puts consumed snapshots back after a failed send.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::domain::streaming::{ComponentId, DataKind, LogicalChannel, StreamSpec, Symbol};

// =============================================================================
// Types
// =============================================================================

/// Callback fired when a channel's live set diverges from its baseline.
pub type ChangeListener = Arc<dyn Fn(LogicalChannel) + Send + Sync>;

/// Symbols per kind, ordered for deterministic frames.
pub type KindSymbols = BTreeMap<DataKind, BTreeSet<Symbol>>;

/// One kind to request in an outbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStream {
    /// Data kind.
    pub kind: DataKind,
    /// Full symbol list (live set plus one-shot symbols).
    pub symbols: BTreeSet<Symbol>,
    /// No persistent owner; only one-shot symbols were requested.
    pub snapshot_only: bool,
}

/// What the supervisor should put on the wire for one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationPlan {
    /// Channel the plan targets.
    pub channel: LogicalChannel,
    /// Live set at planning time; becomes the baseline on commit.
    pub live: KindSymbols,
    /// One-shot symbols drained from the queue.
    pub snapshots: KindSymbols,
    epoch: u64,
}

impl ReconciliationPlan {
    /// Nothing to request: every subscription was withdrawn.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live.is_empty() && self.snapshots.is_empty()
    }

    /// Merge live and one-shot symbols into per-kind stream requests.
    #[must_use]
    pub fn streams(&self) -> Vec<PlannedStream> {
        let kinds: BTreeSet<DataKind> = self
            .live
            .keys()
            .chain(self.snapshots.keys())
            .copied()
            .collect();

        kinds
            .into_iter()
            .map(|kind| {
                let mut symbols = self.live.get(&kind).cloned().unwrap_or_default();
                if let Some(extra) = self.snapshots.get(&kind) {
                    symbols.extend(extra.iter().cloned());
                }
                PlannedStream {
                    kind,
                    symbols,
                    snapshot_only: !self.live.contains_key(&kind),
                }
            })
            .collect()
    }
}

/// Existing-vs-new split for one kind, relative to the baseline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KindClassification {
    /// Live and already reconciled.
    pub existing: BTreeSet<Symbol>,
    /// Live but not yet on the wire.
    pub added: BTreeSet<Symbol>,
    /// On the wire but no longer live.
    pub withdrawn: BTreeSet<Symbol>,
}

impl KindClassification {
    /// No pending change for this kind.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.added.is_empty() && self.withdrawn.is_empty()
    }
}

// =============================================================================
// Ledger State
// =============================================================================

/// Owners of one (channel, kind) entry.
#[derive(Debug, Default)]
struct LedgerEntry {
    owners: HashMap<ComponentId, BTreeSet<Symbol>>,
    symbols: BTreeSet<Symbol>,
}

impl LedgerEntry {
    fn rebuild(&mut self) {
        self.symbols = self.owners.values().flatten().cloned().collect();
    }
}

#[derive(Debug, Default)]
struct ChannelLedger {
    entries: BTreeMap<DataKind, LedgerEntry>,
    reconciled: KindSymbols,
    snapshots: KindSymbols,
    epoch: u64,
}

impl ChannelLedger {
    fn live(&self) -> KindSymbols {
        self.entries
            .iter()
            .map(|(kind, entry)| (*kind, entry.symbols.clone()))
            .collect()
    }

    fn diverges(&self) -> bool {
        !self.snapshots.is_empty() || self.live() != self.reconciled
    }

    /// Add symbols for an owner. Returns true when the union changed.
    fn add(
        &mut self,
        component: &ComponentId,
        kind: DataKind,
        symbols: &BTreeSet<Symbol>,
    ) -> bool {
        let entry = self.entries.entry(kind).or_default();
        let was_present = !entry.owners.is_empty();
        let owned = entry.owners.entry(component.clone()).or_default();
        owned.extend(symbols.iter().cloned());

        let before = entry.symbols.len();
        entry.rebuild();
        !was_present || entry.symbols.len() != before
    }

    /// Drop every contribution of an owner. Returns true when any union changed.
    fn remove_owner(&mut self, component: &ComponentId) -> bool {
        let mut changed = false;

        self.entries.retain(|_, entry| {
            if entry.owners.remove(component).is_some() {
                let before = entry.symbols.clone();
                entry.rebuild();
                if entry.owners.is_empty() {
                    changed = true;
                    return false;
                }
                changed |= entry.symbols != before;
            }
            true
        });

        changed
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    channels: HashMap<LogicalChannel, ChannelLedger>,
}

impl LedgerState {
    fn channel(&mut self, channel: LogicalChannel) -> &mut ChannelLedger {
        self.channels.entry(channel).or_default()
    }
}

// =============================================================================
// Subscription Ledger
// =============================================================================

/// Tracks live and one-shot subscriptions across all channels.
///
/// All mutations serialize through one lock. The change listener is invoked
/// after the lock is released, and only when a channel's live set changed and
/// no longer matches what was last reconciled.
///
/// # Example
///
/// ```rust
/// use exchange_stream_mux::domain::streaming::{ComponentId, DataKind, LogicalChannel};
/// use exchange_stream_mux::domain::subscription::SubscriptionLedger;
///
/// let ledger = SubscriptionLedger::new();
/// let a = ComponentId::new("chart");
/// let b = ComponentId::new("watchlist");
///
/// assert!(ledger.register(&a, DataKind::Ticker, ["KRW-BTC"]));
/// assert!(ledger.register(&b, DataKind::Ticker, ["KRW-BTC", "KRW-ETH"]));
///
/// let plan = ledger.plan(LogicalChannel::Public).unwrap();
/// assert_eq!(plan.streams()[0].symbols.len(), 2);
/// ledger.commit(&plan);
///
/// // Same request again: nothing to reconcile.
/// assert!(!ledger.register(&a, DataKind::Ticker, ["KRW-BTC"]));
/// assert!(ledger.plan(LogicalChannel::Public).is_none());
/// ```
#[derive(Default)]
pub struct SubscriptionLedger {
    state: Mutex<LedgerState>,
    listener: RwLock<Option<ChangeListener>>,
}

impl std::fmt::Debug for SubscriptionLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionLedger")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl SubscriptionLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the change listener, replacing any previous one.
    pub fn set_listener(&self, listener: ChangeListener) {
        *self.listener.write() = Some(listener);
    }

    /// Add `symbols` to the component's live set for `kind`.
    ///
    /// Returns true if the change listener was notified.
    pub fn register<I, S>(&self, component: &ComponentId, kind: DataKind, symbols: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<Symbol>,
    {
        let symbols: BTreeSet<Symbol> = symbols.into_iter().map(Into::into).collect();
        let channel = kind.channel();

        let notify = {
            let mut state = self.state.lock();
            let ledger = state.channel(channel);
            ledger.add(component, kind, &symbols) && ledger.diverges()
        };

        if notify {
            self.notify(channel);
        }
        notify
    }

    /// Remove the component's contribution from every entry.
    ///
    /// Returns the channels whose listener was notified.
    pub fn unregister(&self, component: &ComponentId) -> Vec<LogicalChannel> {
        let mut notified = Vec::new();
        {
            let mut state = self.state.lock();
            for channel in LogicalChannel::all() {
                let ledger = state.channel(*channel);
                if ledger.remove_owner(component) && ledger.diverges() {
                    notified.push(*channel);
                }
            }
        }

        for channel in &notified {
            self.notify(*channel);
        }
        notified
    }

    /// Queue a one-shot request merged into the next reconciliation.
    pub fn request_snapshot<I, S>(&self, kind: DataKind, symbols: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<Symbol>,
    {
        let channel = kind.channel();
        {
            let mut state = self.state.lock();
            state
                .channel(channel)
                .snapshots
                .entry(kind)
                .or_default()
                .extend(symbols.into_iter().map(Into::into));
        }
        self.notify(channel);
    }

    /// Take what should be sent next, draining pending snapshots.
    ///
    /// Returns `None` when the wire already matches the live set.
    #[must_use]
    pub fn plan(&self, channel: LogicalChannel) -> Option<ReconciliationPlan> {
        let mut state = self.state.lock();
        let ledger = state.channel(channel);
        if !ledger.diverges() {
            return None;
        }

        Some(ReconciliationPlan {
            channel,
            live: ledger.live(),
            snapshots: std::mem::take(&mut ledger.snapshots),
            epoch: ledger.epoch,
        })
    }

    /// Record a plan as confirmed on the wire.
    ///
    /// A plan made before the last [`reset_baseline`](Self::reset_baseline)
    /// is ignored. Fires the listener if the ledger moved on mid-flight.
    pub fn commit(&self, plan: &ReconciliationPlan) {
        let notify = {
            let mut state = self.state.lock();
            let ledger = state.channel(plan.channel);
            if ledger.epoch == plan.epoch {
                ledger.reconciled.clone_from(&plan.live);
            }
            ledger.diverges()
        };

        if notify {
            self.notify(plan.channel);
        }
    }

    /// Put a failed plan's snapshots back in the queue.
    pub fn abandon(&self, plan: ReconciliationPlan) {
        let mut state = self.state.lock();
        let ledger = state.channel(plan.channel);
        for (kind, symbols) in plan.snapshots {
            ledger.snapshots.entry(kind).or_default().extend(symbols);
        }
    }

    /// Forget what was reconciled, e.g. after a new socket was opened.
    ///
    /// Returns true if the listener was notified.
    pub fn reset_baseline(&self, channel: LogicalChannel) -> bool {
        let notify = {
            let mut state = self.state.lock();
            let ledger = state.channel(channel);
            ledger.reconciled.clear();
            ledger.epoch = ledger.epoch.wrapping_add(1);
            ledger.diverges()
        };

        if notify {
            self.notify(channel);
        }
        notify
    }

    /// Existing/added/withdrawn symbols per kind, for diagnostics.
    #[must_use]
    pub fn classify(&self, channel: LogicalChannel) -> BTreeMap<DataKind, KindClassification> {
        let mut state = self.state.lock();
        let ledger = state.channel(channel);
        let live = ledger.live();
        let empty = BTreeSet::new();

        let kinds: BTreeSet<DataKind> = live
            .keys()
            .chain(ledger.reconciled.keys())
            .copied()
            .collect();
        kinds
            .into_iter()
            .map(|kind| {
                let now = live.get(&kind).unwrap_or(&empty);
                let before = ledger.reconciled.get(&kind).unwrap_or(&empty);
                let class = KindClassification {
                    existing: now.intersection(before).cloned().collect(),
                    added: now.difference(before).cloned().collect(),
                    withdrawn: before.difference(now).cloned().collect(),
                };
                (kind, class)
            })
            .collect()
    }

    /// Live subscriptions of a channel as realtime specs.
    #[must_use]
    pub fn live_specs(&self, channel: LogicalChannel) -> Vec<StreamSpec> {
        let mut state = self.state.lock();
        state
            .channel(channel)
            .live()
            .into_iter()
            .map(|(kind, symbols)| StreamSpec::realtime(kind, symbols))
            .collect()
    }

    /// Number of kinds with at least one owner on the channel.
    #[must_use]
    pub fn active_count(&self, channel: LogicalChannel) -> usize {
        self.state
            .lock()
            .channels
            .get(&channel)
            .map_or(0, |ledger| ledger.entries.len())
    }

    /// Live symbol union for a kind.
    #[must_use]
    pub fn symbols(&self, kind: DataKind) -> BTreeSet<Symbol> {
        self.state
            .lock()
            .channels
            .get(&kind.channel())
            .and_then(|ledger| ledger.entries.get(&kind))
            .map(|entry| entry.symbols.clone())
            .unwrap_or_default()
    }

    /// Components owning a kind.
    #[must_use]
    pub fn owners(&self, kind: DataKind) -> Vec<ComponentId> {
        let state = self.state.lock();
        let mut owners: Vec<ComponentId> = state
            .channels
            .get(&kind.channel())
            .and_then(|ledger| ledger.entries.get(&kind))
            .map(|entry| entry.owners.keys().cloned().collect())
            .unwrap_or_default();
        owners.sort();
        owners
    }

    /// Aggregate counts.
    #[must_use]
    pub fn stats(&self) -> LedgerStats {
        let state = self.state.lock();
        let mut stats = LedgerStats::default();
        let mut components = HashSet::new();

        for ledger in state.channels.values() {
            stats.entry_count += ledger.entries.len();
            stats.pending_snapshots += ledger.snapshots.len();
            for entry in ledger.entries.values() {
                stats.symbol_count += entry.symbols.len();
                components.extend(entry.owners.keys().cloned());
            }
        }
        stats.component_count = components.len();
        stats
    }

    fn notify(&self, channel: LogicalChannel) {
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener(channel);
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Aggregate ledger counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct LedgerStats {
    /// (channel, kind) entries with at least one owner.
    pub entry_count: usize,
    /// Sum of per-entry symbol unions.
    pub symbol_count: usize,
    /// Distinct owning components.
    pub component_count: usize,
    /// Kinds with queued one-shot requests.
    pub pending_snapshots: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::domain::streaming::CandleInterval;

    fn id(name: &str) -> ComponentId {
        ComponentId::new(name)
    }

    fn counting_ledger() -> (SubscriptionLedger, Arc<AtomicUsize>) {
        let ledger = SubscriptionLedger::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        ledger.set_listener(Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        }));
        (ledger, count)
    }

    fn set(symbols: &[&str]) -> BTreeSet<Symbol> {
        symbols.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn register_new_symbols_notifies() {
        let (ledger, count) = counting_ledger();

        assert!(ledger.register(&id("a"), DataKind::Ticker, ["KRW-BTC"]));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reregistration_is_idempotent() {
        let (ledger, count) = counting_ledger();

        ledger.register(&id("a"), DataKind::Ticker, ["KRW-BTC"]);
        assert!(!ledger.register(&id("a"), DataKind::Ticker, ["KRW-BTC"]));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn overlapping_owner_does_not_notify() {
        let (ledger, count) = counting_ledger();

        ledger.register(&id("a"), DataKind::Ticker, ["KRW-BTC", "KRW-ETH"]);
        assert!(!ledger.register(&id("b"), DataKind::Ticker, ["KRW-ETH"]));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(ledger.owners(DataKind::Ticker), vec![id("a"), id("b")]);
    }

    #[test]
    fn union_covers_all_owners() {
        let ledger = SubscriptionLedger::new();

        ledger.register(&id("a"), DataKind::Ticker, ["KRW-BTC", "KRW-ETH"]);
        ledger.register(&id("b"), DataKind::Ticker, ["KRW-ETH", "KRW-XRP"]);

        assert_eq!(
            ledger.symbols(DataKind::Ticker),
            set(&["KRW-BTC", "KRW-ETH", "KRW-XRP"])
        );
    }

    #[test]
    fn unregister_keeps_remaining_owner_symbols() {
        let ledger = SubscriptionLedger::new();

        ledger.register(&id("a"), DataKind::Ticker, ["KRW-BTC", "KRW-ETH"]);
        ledger.register(&id("b"), DataKind::Ticker, ["KRW-ETH"]);

        let notified = ledger.unregister(&id("a"));

        assert_eq!(notified, vec![LogicalChannel::Public]);
        assert_eq!(ledger.symbols(DataKind::Ticker), set(&["KRW-ETH"]));
    }

    #[test]
    fn emptied_entry_is_deleted() {
        let ledger = SubscriptionLedger::new();

        ledger.register(&id("a"), DataKind::Trade, ["KRW-BTC"]);
        ledger.unregister(&id("a"));

        assert_eq!(ledger.active_count(LogicalChannel::Public), 0);
        assert!(ledger.owners(DataKind::Trade).is_empty());
    }

    #[test]
    fn unknown_component_unregister_is_noop() {
        let (ledger, count) = counting_ledger();

        assert!(ledger.unregister(&id("ghost")).is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn deleted_entry_still_diverges_until_reconciled() {
        let ledger = SubscriptionLedger::new();

        ledger.register(&id("a"), DataKind::Ticker, ["KRW-BTC"]);
        let plan = ledger.plan(LogicalChannel::Public).unwrap();
        ledger.commit(&plan);

        ledger.unregister(&id("a"));
        let plan = ledger.plan(LogicalChannel::Public).unwrap();

        assert!(plan.is_empty());
        ledger.commit(&plan);
        assert!(ledger.plan(LogicalChannel::Public).is_none());
    }

    #[test]
    fn change_reverted_before_reconcile_does_not_notify() {
        let (ledger, count) = counting_ledger();

        ledger.register(&id("a"), DataKind::Ticker, ["KRW-BTC"]);
        let plan = ledger.plan(LogicalChannel::Public).unwrap();
        ledger.commit(&plan);
        let before = count.load(Ordering::SeqCst);

        ledger.register(&id("b"), DataKind::Trade, ["KRW-BTC"]);
        ledger.unregister(&id("b"));

        // One notification for the add; the removal restores the baseline.
        assert_eq!(count.load(Ordering::SeqCst), before + 1);
        assert!(ledger.plan(LogicalChannel::Public).is_none());
    }

    #[test]
    fn plan_is_none_when_settled() {
        let ledger = SubscriptionLedger::new();
        assert!(ledger.plan(LogicalChannel::Public).is_none());
        assert!(ledger.plan(LogicalChannel::Private).is_none());
    }

    #[test]
    fn snapshot_is_consumed_by_plan() {
        let ledger = SubscriptionLedger::new();

        ledger.request_snapshot(DataKind::Orderbook, ["KRW-BTC"]);
        let plan = ledger.plan(LogicalChannel::Public).unwrap();

        let streams = plan.streams();
        assert_eq!(streams.len(), 1);
        assert!(streams[0].snapshot_only);
        assert_eq!(streams[0].symbols, set(&["KRW-BTC"]));

        ledger.commit(&plan);
        assert!(ledger.plan(LogicalChannel::Public).is_none());
    }

    #[test]
    fn snapshot_merges_into_live_kind() {
        let ledger = SubscriptionLedger::new();

        ledger.register(&id("a"), DataKind::Ticker, ["KRW-BTC"]);
        ledger.request_snapshot(DataKind::Ticker, ["KRW-ETH"]);

        let streams = ledger.plan(LogicalChannel::Public).unwrap().streams();
        assert_eq!(streams.len(), 1);
        assert!(!streams[0].snapshot_only);
        assert_eq!(streams[0].symbols, set(&["KRW-BTC", "KRW-ETH"]));
        // One-shot symbols never become part of the live set.
        assert_eq!(ledger.symbols(DataKind::Ticker), set(&["KRW-BTC"]));
    }

    #[test]
    fn abandon_requeues_snapshots() {
        let ledger = SubscriptionLedger::new();

        ledger.request_snapshot(DataKind::Trade, ["KRW-BTC"]);
        let plan = ledger.plan(LogicalChannel::Public).unwrap();
        ledger.abandon(plan);

        let retry = ledger.plan(LogicalChannel::Public).unwrap();
        assert_eq!(retry.snapshots.get(&DataKind::Trade), Some(&set(&["KRW-BTC"])));
    }

    #[test]
    fn abandoned_plan_leaves_baseline_untouched() {
        let ledger = SubscriptionLedger::new();

        ledger.register(&id("a"), DataKind::Ticker, ["KRW-BTC"]);
        let plan = ledger.plan(LogicalChannel::Public).unwrap();
        ledger.abandon(plan);

        assert!(ledger.plan(LogicalChannel::Public).is_some());
    }

    #[test]
    fn commit_renotifies_when_ledger_moved_mid_flight() {
        let (ledger, count) = counting_ledger();

        ledger.register(&id("a"), DataKind::Ticker, ["KRW-BTC"]);
        let plan = ledger.plan(LogicalChannel::Public).unwrap();

        // Withdrawn while the frame is in flight; live matches the old baseline.
        ledger.unregister(&id("a"));
        let before = count.load(Ordering::SeqCst);

        ledger.commit(&plan);

        assert_eq!(count.load(Ordering::SeqCst), before + 1);
        assert!(ledger.plan(LogicalChannel::Public).unwrap().is_empty());
    }

    #[test]
    fn reset_baseline_forces_full_resend() {
        let ledger = SubscriptionLedger::new();

        ledger.register(&id("a"), DataKind::Ticker, ["KRW-BTC"]);
        let plan = ledger.plan(LogicalChannel::Public).unwrap();
        ledger.commit(&plan);

        assert!(ledger.reset_baseline(LogicalChannel::Public));
        let plan = ledger.plan(LogicalChannel::Public).unwrap();
        assert_eq!(plan.live.get(&DataKind::Ticker), Some(&set(&["KRW-BTC"])));
    }

    #[test]
    fn stale_plan_commit_is_ignored_after_reset() {
        let ledger = SubscriptionLedger::new();

        ledger.register(&id("a"), DataKind::Ticker, ["KRW-BTC"]);
        let stale = ledger.plan(LogicalChannel::Public).unwrap();

        ledger.reset_baseline(LogicalChannel::Public);
        ledger.commit(&stale);

        assert!(ledger.plan(LogicalChannel::Public).is_some());
    }

    #[test]
    fn reset_baseline_on_empty_channel_is_quiet() {
        let (ledger, count) = counting_ledger();

        assert!(!ledger.reset_baseline(LogicalChannel::Private));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn account_kind_may_be_unscoped() {
        let ledger = SubscriptionLedger::new();

        assert!(ledger.register(&id("a"), DataKind::MyOrder, Vec::<String>::new()));
        let plan = ledger.plan(LogicalChannel::Private).unwrap();

        assert_eq!(plan.live.get(&DataKind::MyOrder), Some(&BTreeSet::new()));
        assert!(ledger.plan(LogicalChannel::Public).is_none());
    }

    #[test]
    fn channels_are_independent() {
        let (ledger, _) = counting_ledger();

        ledger.register(&id("a"), DataKind::Ticker, ["KRW-BTC"]);
        ledger.register(&id("a"), DataKind::MyAsset, Vec::<String>::new());
        for channel in LogicalChannel::all() {
            let plan = ledger.plan(*channel).unwrap();
            ledger.commit(&plan);
        }

        let notified = ledger.unregister(&id("a"));
        assert_eq!(notified, vec![LogicalChannel::Public, LogicalChannel::Private]);
    }

    #[test]
    fn classify_reports_existing_added_and_withdrawn() {
        let ledger = SubscriptionLedger::new();

        ledger.register(&id("a"), DataKind::Ticker, ["KRW-BTC", "KRW-ETH"]);
        let plan = ledger.plan(LogicalChannel::Public).unwrap();
        ledger.commit(&plan);

        ledger.unregister(&id("a"));
        ledger.register(&id("b"), DataKind::Ticker, ["KRW-ETH", "KRW-XRP"]);

        let classes = ledger.classify(LogicalChannel::Public);
        let ticker = &classes[&DataKind::Ticker];
        assert_eq!(ticker.existing, set(&["KRW-ETH"]));
        assert_eq!(ticker.added, set(&["KRW-XRP"]));
        assert_eq!(ticker.withdrawn, set(&["KRW-BTC"]));
        assert!(!ticker.is_settled());
    }

    #[test]
    fn streams_are_ordered_by_kind() {
        let ledger = SubscriptionLedger::new();

        ledger.register(&id("a"), DataKind::Candle(CandleInterval::OneMinute), ["KRW-BTC"]);
        ledger.register(&id("a"), DataKind::Ticker, ["KRW-BTC"]);

        let kinds: Vec<DataKind> = ledger
            .plan(LogicalChannel::Public)
            .unwrap()
            .streams()
            .into_iter()
            .map(|s| s.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![DataKind::Ticker, DataKind::Candle(CandleInterval::OneMinute)]
        );
    }

    #[test]
    fn stats_count_entries_and_components() {
        let ledger = SubscriptionLedger::new();

        ledger.register(&id("a"), DataKind::Ticker, ["KRW-BTC", "KRW-ETH"]);
        ledger.register(&id("b"), DataKind::Trade, ["KRW-BTC"]);
        ledger.register(&id("b"), DataKind::MyOrder, Vec::<String>::new());
        ledger.request_snapshot(DataKind::Orderbook, ["KRW-BTC"]);

        let stats = ledger.stats();
        assert_eq!(stats.entry_count, 3);
        assert_eq!(stats.symbol_count, 3);
        assert_eq!(stats.component_count, 2);
        assert_eq!(stats.pending_snapshots, 1);
    }

    #[test]
    fn listener_may_reenter_ledger() {
        let ledger = Arc::new(SubscriptionLedger::new());
        let seen = Arc::new(AtomicUsize::new(0));

        let weak = Arc::downgrade(&ledger);
        let counter = Arc::clone(&seen);
        ledger.set_listener(Arc::new(move |channel| {
            if let Some(ledger) = weak.upgrade() {
                counter.fetch_add(ledger.active_count(channel), Ordering::SeqCst);
            }
        }));

        ledger.register(&id("a"), DataKind::Ticker, ["KRW-BTC"]);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_registration() {
        use std::thread;

        let ledger = Arc::new(SubscriptionLedger::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    let component = ComponentId::new(format!("c{i}"));
                    for j in 0..50 {
                        ledger.register(&component, DataKind::Ticker, [format!("KRW-{j}")]);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(ledger.symbols(DataKind::Ticker).len(), 50);
        assert_eq!(ledger.owners(DataKind::Ticker).len(), 8);
    }
}
