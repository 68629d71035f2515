//! Stream Orchestrator
//!
//! The host-facing entry point. Wires the subscription ledger, component
//! registry, rate gate, and one connection supervisor per logical channel,
//! and owns their tasks.
//!
//! ```text
//! subscribe() ──► registry (who gets events)
//!            └──► ledger ──change──► supervisor.reconciler ──► socket
//!
//! socket ──► supervisor.read_loop ──► codec ──► registry.dispatch ──► consumers
//! ```
//!
//! There is no global instance: the host builds one orchestrator and shares
//! the returned `Arc`.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::registry::{ComponentRegistry, RegistryError, StreamConsumer};
use crate::application::ports::{CredentialProvider, Transport};
use crate::domain::streaming::{
    ComponentId, DataKind, LogicalChannel, StreamMode, StreamSpec, Symbol,
};
use crate::domain::subscription::{LedgerStats, SubscriptionLedger};
use crate::infrastructure::config::MuxConfig;
use crate::infrastructure::exchange::codec::{AdminResponse, ProtocolCodec};
use crate::infrastructure::exchange::heartbeat::HealthMonitor;
use crate::infrastructure::exchange::rate_gate::{RateGate, RateGateStats};
use crate::infrastructure::exchange::supervisor::{
    ChannelStatus, ConnectionSupervisor, QueryError, SupervisorDeps, SupervisorSettings,
};

// =============================================================================
// Errors
// =============================================================================

/// Programmer errors on the subscription API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscribeError {
    /// The id is bound to a different, still-live consumer.
    #[error("component {0} is already bound to a different consumer")]
    DuplicateComponent(ComponentId),

    /// Market kinds need at least one symbol.
    #[error("{0} requires at least one symbol")]
    EmptySymbols(DataKind),
}

impl From<RegistryError> for SubscribeError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::DuplicateComponent(id) => Self::DuplicateComponent(id),
        }
    }
}

// =============================================================================
// Status
// =============================================================================

/// Operational snapshot of the whole multiplexer.
#[derive(Debug, Clone, Serialize)]
pub struct MuxStatus {
    /// Seconds since construction.
    pub uptime_secs: u64,
    /// Per-channel status.
    pub channels: Vec<ChannelStatus>,
    /// Registered components.
    pub components: usize,
    /// Ledger counts.
    pub ledger: LedgerStats,
    /// Rate gate counters.
    pub rate_gate: RateGateStats,
}

// =============================================================================
// Orchestrator
// =============================================================================

struct Tasks {
    background_cancel: CancellationToken,
    connection_cancel: CancellationToken,
    background: JoinSet<()>,
    connections: JoinSet<()>,
}

/// Multiplexes component subscriptions onto one socket per channel.
pub struct Orchestrator {
    config: MuxConfig,
    ledger: Arc<SubscriptionLedger>,
    registry: Arc<ComponentRegistry>,
    gate: RateGate,
    supervisors: HashMap<LogicalChannel, Arc<ConnectionSupervisor>>,
    tasks: Mutex<Option<Tasks>>,
    started_at: Instant,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("ledger", &self.ledger)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Build the orchestrator. Nothing connects until [`start`](Self::start).
    #[must_use]
    pub fn new(
        config: MuxConfig,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Arc<Self> {
        let ledger = Arc::new(SubscriptionLedger::new());
        let registry = Arc::new(ComponentRegistry::new());
        let gate = RateGate::new(config.rate_gate_config());

        let deps = SupervisorDeps {
            transport,
            credentials,
            gate: gate.clone(),
            ledger: Arc::clone(&ledger),
            registry: Arc::clone(&registry),
            codec: ProtocolCodec::new(config.format),
        };

        let supervisors: HashMap<LogicalChannel, Arc<ConnectionSupervisor>> = LogicalChannel::all()
            .iter()
            .map(|&channel| {
                let url = match channel {
                    LogicalChannel::Public => config.endpoints.public_url.clone(),
                    LogicalChannel::Private => config.endpoints.private_url.clone(),
                };
                let settings = SupervisorSettings {
                    url,
                    ticket_prefix: config.ticket_prefix.clone(),
                    reconnect: config.reconnect_config(),
                    heartbeat: config.heartbeat_config(),
                    reconcile_retry: config.websocket.reconcile_retry,
                };
                let supervisor = ConnectionSupervisor::new(channel, settings, deps.clone());
                (channel, Arc::new(supervisor))
            })
            .collect();

        let wake: HashMap<LogicalChannel, Weak<ConnectionSupervisor>> = supervisors
            .iter()
            .map(|(channel, supervisor)| (*channel, Arc::downgrade(supervisor)))
            .collect();
        ledger.set_listener(Arc::new(move |channel| {
            if let Some(supervisor) = wake.get(&channel).and_then(Weak::upgrade) {
                supervisor.notify_changed();
            }
        }));

        let expired_from = Arc::downgrade(&ledger);
        registry.set_expiry_listener(Arc::new(move |id: &ComponentId| {
            if let Some(ledger) = expired_from.upgrade() {
                tracing::debug!(component = %id, "Withdrawing expired component");
                ledger.unregister(id);
            }
        }));

        Arc::new(Self {
            config,
            ledger,
            registry,
            gate,
            supervisors,
            tasks: Mutex::new(None),
            started_at: Instant::now(),
        })
    }

    /// Spawn the connection, reconciliation, and health tasks.
    ///
    /// Must be called from within a tokio runtime. A second call is a no-op.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            tracing::warn!("Orchestrator already started");
            return;
        }

        let background_cancel = CancellationToken::new();
        let connection_cancel = CancellationToken::new();
        let mut background = JoinSet::new();
        let mut connections = JoinSet::new();

        for channel in LogicalChannel::all() {
            let supervisor = &self.supervisors[channel];
            background.spawn(Arc::clone(supervisor).run_reconciler(background_cancel.clone()));
            connections.spawn(Arc::clone(supervisor).run_connection(connection_cancel.clone()));
        }

        let monitor = HealthMonitor::new(
            self.config.websocket.heartbeat_interval,
            self.supervisors.values().cloned().collect(),
            background_cancel.clone(),
        );
        background.spawn(monitor.run());

        tracing::info!(
            public_url = %self.config.endpoints.public_url,
            private_url = %self.config.endpoints.private_url,
            "Orchestrator started"
        );

        *tasks = Some(Tasks {
            background_cancel,
            connection_cancel,
            background,
            connections,
        });
    }

    /// Stop every task and close the sockets.
    ///
    /// Background tasks stop first, then connections; each group gets
    /// `shutdown_timeout` before it is aborted.
    pub async fn shutdown(&self) {
        let Some(mut tasks) = self.tasks.lock().take() else {
            return;
        };
        let timeout = self.config.shutdown_timeout;
        tracing::info!(timeout_ms = timeout.as_millis(), "Orchestrator shutting down");

        tasks.background_cancel.cancel();
        drain(&mut tasks.background, timeout, "background").await;

        self.gate.close();
        tasks.connection_cancel.cancel();
        drain(&mut tasks.connections, timeout, "connection").await;

        tracing::info!("Orchestrator stopped");
    }

    // =========================================================================
    // Subscription API
    // =========================================================================

    /// Subscribe a component to live `kind` updates for `symbols`.
    ///
    /// The orchestrator holds the consumer weakly: dropping the last `Arc`
    /// withdraws the subscription on the next dispatch.
    ///
    /// # Errors
    ///
    /// See [`subscribe_spec`](Self::subscribe_spec).
    pub fn subscribe<I, S>(
        &self,
        component: impl Into<ComponentId>,
        kind: DataKind,
        symbols: I,
        consumer: &Arc<dyn StreamConsumer>,
    ) -> Result<(), SubscribeError>
    where
        I: IntoIterator<Item = S>,
        S: Into<Symbol>,
    {
        self.subscribe_spec(component, StreamSpec::realtime(kind, symbols), consumer)
    }

    /// Subscribe a component to a stream spec.
    ///
    /// Symbols are trimmed and uppercased. A snapshot spec requests one-shot
    /// state and does not keep the stream subscribed.
    ///
    /// # Errors
    ///
    /// Returns `EmptySymbols` for a market kind with no symbols, and
    /// `DuplicateComponent` if the id is bound to another live consumer.
    pub fn subscribe_spec(
        &self,
        component: impl Into<ComponentId>,
        spec: StreamSpec,
        consumer: &Arc<dyn StreamConsumer>,
    ) -> Result<(), SubscribeError> {
        let component = component.into();
        let spec = StreamSpec {
            symbols: normalize(spec.symbols),
            ..spec
        };
        if spec.kind.requires_symbols() && spec.symbols.is_empty() {
            return Err(SubscribeError::EmptySymbols(spec.kind));
        }

        self.registry
            .register(&component, spec.clone(), Arc::downgrade(consumer))?;

        match spec.mode {
            StreamMode::Realtime => {
                self.ledger.register(&component, spec.kind, spec.symbols);
            }
            StreamMode::Snapshot => self.ledger.request_snapshot(spec.kind, spec.symbols),
        }

        tracing::debug!(component = %component, "Component subscribed");
        Ok(())
    }

    /// Remove a component everywhere. Returns true if it was registered.
    pub fn unsubscribe(&self, component: &ComponentId) -> bool {
        let removed = self.registry.unregister(component);
        let changed = self.ledger.unregister(component);
        tracing::debug!(
            component = %component,
            removed,
            channels_changed = changed.len(),
            "Component unsubscribed"
        );
        removed
    }

    /// Request one-shot state for `symbols`, delivered as SNAPSHOT events to
    /// components already subscribed to them.
    ///
    /// # Errors
    ///
    /// Returns `EmptySymbols` for a market kind with no symbols.
    pub fn request_snapshot<I, S>(&self, kind: DataKind, symbols: I) -> Result<(), SubscribeError>
    where
        I: IntoIterator<Item = S>,
        S: Into<Symbol>,
    {
        let symbols = normalize(symbols.into_iter().map(Into::into));
        if kind.requires_symbols() && symbols.is_empty() {
            return Err(SubscribeError::EmptySymbols(kind));
        }
        self.ledger.request_snapshot(kind, symbols);
        Ok(())
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Status of every channel plus aggregate counters.
    #[must_use]
    pub fn status(&self) -> MuxStatus {
        MuxStatus {
            uptime_secs: self.started_at.elapsed().as_secs(),
            channels: LogicalChannel::all()
                .iter()
                .map(|channel| self.supervisors[channel].status())
                .collect(),
            components: self.registry.len(),
            ledger: self.ledger.stats(),
            rate_gate: self.gate.stats(),
        }
    }

    /// Status of one channel.
    #[must_use]
    pub fn channel_status(&self, channel: LogicalChannel) -> ChannelStatus {
        self.supervisors[&channel].status()
    }

    /// Ask the exchange which subscriptions a channel's socket holds.
    ///
    /// # Errors
    ///
    /// Returns `QueryError` if the channel is down or does not answer within
    /// the configured query timeout.
    pub async fn list_subscriptions(
        &self,
        channel: LogicalChannel,
    ) -> Result<AdminResponse, QueryError> {
        self.supervisors[&channel]
            .list_subscriptions(self.config.query_timeout)
            .await
    }

    /// Leave ERROR with a fresh retry budget, or cycle the socket.
    pub fn restart_channel(&self, channel: LogicalChannel) {
        self.supervisors[&channel].restart();
    }

    /// The subscription ledger.
    #[must_use]
    pub fn ledger(&self) -> &SubscriptionLedger {
        &self.ledger
    }

    /// The component registry.
    #[must_use]
    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }
}

fn normalize<I>(symbols: I) -> std::collections::BTreeSet<Symbol>
where
    I: IntoIterator<Item = Symbol>,
{
    symbols
        .into_iter()
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

async fn drain(set: &mut JoinSet<()>, timeout: Duration, group: &'static str) {
    let joined = tokio::time::timeout(timeout, async {
        while let Some(result) = set.join_next().await {
            if let Err(e) = result
                && e.is_panic()
            {
                tracing::error!(group, error = %e, "Task panicked");
            }
        }
    })
    .await;

    if joined.is_err() {
        tracing::warn!(group, remaining = set.len(), "Aborting tasks after shutdown timeout");
        set.abort_all();
        while set.join_next().await.is_some() {}
    }
}

// =============================================================================
// Tests
// =============================================================================
