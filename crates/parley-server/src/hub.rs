//! Subscription registry and fanout.
//!
//! One task owns the conversation → sessions map and applies every request in
//! arrival order. Callers hold a cheap [`Hub`] handle and only enqueue, so
//! nothing ever waits on a slow connection: a session whose mailbox is full at
//! broadcast time is evicted on the spot.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use parley_core::envelope::BroadcastEnvelope;
use parley_core::{ConnectionId, ConversationId, UserId};
use parley_telemetry::{names, MetricsRecorder};

use crate::mailbox::{Mailbox, PushError};
use crate::session::{SessionState, StateCell};

/// What the hub knows about a connected session.
#[derive(Debug)]
pub struct SessionHandle {
    pub id: ConnectionId,
    pub user_id: UserId,
    subscriptions: BTreeSet<ConversationId>,
    mailbox: Mailbox,
    state: StateCell,
}

impl SessionHandle {
    pub fn new(
        id: ConnectionId,
        user_id: UserId,
        subscriptions: BTreeSet<ConversationId>,
        mailbox: Mailbox,
    ) -> Self {
        Self {
            id,
            user_id,
            subscriptions,
            mailbox,
            state: StateCell::new(),
        }
    }

    /// Lifecycle state; the hub moves evicted sessions to `Closing`.
    pub fn state(&self) -> &StateCell {
        &self.state
    }

    /// Fixed at connect time.
    pub fn subscriptions(&self) -> &BTreeSet<ConversationId> {
        &self.subscriptions
    }

    pub fn is_subscribed(&self, conversation_id: ConversationId) -> bool {
        self.subscriptions.contains(&conversation_id)
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }
}

/// Registry contents at one instant.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HubSnapshot {
    pub sessions: usize,
    pub interest: BTreeMap<ConversationId, BTreeSet<ConnectionId>>,
}

impl HubSnapshot {
    pub fn conversations(&self) -> usize {
        self.interest.len()
    }

    pub fn subscriptions(&self) -> usize {
        self.interest.values().map(BTreeSet::len).sum()
    }

    pub fn subscribers(&self, conversation_id: ConversationId) -> BTreeSet<ConnectionId> {
        self.interest.get(&conversation_id).cloned().unwrap_or_default()
    }
}

enum HubCommand {
    Register(Arc<SessionHandle>),
    Unregister(ConnectionId),
    Broadcast(BroadcastEnvelope),
    Snapshot(oneshot::Sender<HubSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the registry task.
#[derive(Clone)]
pub struct Hub {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl Hub {
    /// Start the registry task.
    pub fn spawn(metrics: Arc<MetricsRecorder>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Registry::new(metrics);
        let task = tokio::spawn(registry.run(rx));
        (Self { tx }, task)
    }

    fn send(&self, command: HubCommand) {
        if self.tx.send(command).is_err() {
            debug!("hub stopped, dropping request");
        }
    }

    pub fn register(&self, session: Arc<SessionHandle>) {
        self.send(HubCommand::Register(session));
    }

    pub fn unregister(&self, id: ConnectionId) {
        self.send(HubCommand::Unregister(id));
    }

    pub fn broadcast(&self, envelope: BroadcastEnvelope) {
        self.send(HubCommand::Broadcast(envelope));
    }

    /// Current registry contents; empty once the hub has stopped.
    pub async fn snapshot(&self) -> HubSnapshot {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Snapshot(reply));
        rx.await.unwrap_or_default()
    }

    /// Close every mailbox and stop the registry task.
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Shutdown(reply));
        let _ = rx.await;
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

struct Registry {
    sessions: HashMap<ConnectionId, Arc<SessionHandle>>,
    interest: HashMap<ConversationId, HashMap<ConnectionId, Arc<SessionHandle>>>,
    metrics: Arc<MetricsRecorder>,
}

impl Registry {
    fn new(metrics: Arc<MetricsRecorder>) -> Self {
        Self {
            sessions: HashMap::new(),
            interest: HashMap::new(),
            metrics,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<HubCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                HubCommand::Register(session) => self.register(session),
                HubCommand::Unregister(id) => self.unregister(&id),
                HubCommand::Broadcast(envelope) => self.broadcast(&envelope),
                HubCommand::Snapshot(reply) => {
                    let _ = reply.send(self.snapshot());
                }
                HubCommand::Shutdown(reply) => {
                    self.close_all();
                    let _ = reply.send(());
                    break;
                }
            }
        }
        info!("hub stopped");
    }

    fn register(&mut self, session: Arc<SessionHandle>) {
        if self.sessions.contains_key(&session.id) {
            self.detach(&session.id);
        }
        for conversation_id in session.subscriptions() {
            self.interest
                .entry(*conversation_id)
                .or_default()
                .insert(session.id.clone(), Arc::clone(&session));
        }
        debug!(
            connection_id = %session.id,
            user_id = %session.user_id,
            conversations = session.subscriptions().len(),
            "session registered"
        );
        self.sessions.insert(session.id.clone(), session);
        self.record_active();
    }

    fn unregister(&mut self, id: &ConnectionId) {
        match self.detach(id) {
            Some(session) => {
                session.mailbox().close();
                debug!(connection_id = %id, "session unregistered");
                self.record_active();
            }
            None => debug!(connection_id = %id, "unregister for unknown session"),
        }
    }

    fn broadcast(&mut self, envelope: &BroadcastEnvelope) {
        self.metrics.counter_inc(names::HUB_BROADCASTS_TOTAL, &[], 1);

        let Some(subscribers) = self.interest.get(&envelope.conversation_id) else {
            debug!(conversation_id = %envelope.conversation_id, "broadcast to idle conversation");
            return;
        };

        let mut delivered = 0u64;
        let mut overflowed = Vec::new();
        let mut departed = Vec::new();
        for (id, session) in subscribers {
            match session.mailbox().try_push(Arc::clone(&envelope.payload)) {
                Ok(()) => delivered += 1,
                Err(PushError::Full) => overflowed.push(id.clone()),
                Err(PushError::Closed) => departed.push(id.clone()),
            }
        }

        self.metrics.counter_inc(names::HUB_DELIVERIES_TOTAL, &[], delivered);
        self.metrics
            .histogram_observe(names::HUB_FANOUT_SIZE, &[], subscribers.len() as f64);

        for id in overflowed {
            if let Some(session) = self.detach(&id) {
                session.state().transition(SessionState::Closing);
                session.mailbox().close();
                self.metrics.counter_inc(names::HUB_EVICTIONS_TOTAL, &[], 1);
                warn!(
                    connection_id = %id,
                    user_id = %session.user_id,
                    conversation_id = %envelope.conversation_id,
                    "mailbox full, evicting slow session"
                );
            }
        }
        // Mailbox already closed: the session is on its way out.
        for id in departed {
            self.detach(&id);
        }
        self.record_active();
    }

    /// Remove a session from every interest set; drops emptied sets.
    fn detach(&mut self, id: &ConnectionId) -> Option<Arc<SessionHandle>> {
        let session = self.sessions.remove(id)?;
        for conversation_id in session.subscriptions() {
            if let Some(set) = self.interest.get_mut(conversation_id) {
                set.remove(id);
                if set.is_empty() {
                    self.interest.remove(conversation_id);
                }
            }
        }
        Some(session)
    }

    fn close_all(&mut self) {
        let count = self.sessions.len();
        for session in self.sessions.values() {
            session.mailbox().close();
        }
        self.sessions.clear();
        self.interest.clear();
        self.record_active();
        info!(sessions = count, "hub closed all sessions");
    }

    fn snapshot(&self) -> HubSnapshot {
        HubSnapshot {
            sessions: self.sessions.len(),
            interest: self
                .interest
                .iter()
                .map(|(conversation_id, set)| (*conversation_id, set.keys().cloned().collect()))
                .collect(),
        }
    }

    fn record_active(&self) {
        self.metrics
            .gauge_set(names::HUB_SESSIONS_ACTIVE, &[], self.sessions.len() as f64);
    }
}
