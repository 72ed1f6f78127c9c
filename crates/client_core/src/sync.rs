//! Channel subscription and transport selection.
//!
//! [`ChannelSyncCoordinator`] keeps exactly one channel joined and feeds it
//! from whichever transport is usable: push frames while the websocket is up,
//! the poll engine otherwise. Both paths end in [`InboundRouter`], which drops
//! events for other channels and duplicate messages before anything reaches
//! the [`EventRegistry`].

use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, RwLock},
};

use async_trait::async_trait;
use shared::{
    domain::{ChannelId, ChatMessage, MessageId},
    protocol::{PushCommand, PushEvent},
};
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    config::ClientSettings,
    error::{RequestError, TransportError},
    events::{EventRegistry, SyncEvent, TransportMode},
    gateway::RequestGateway,
    poll::{PollFallbackEngine, TypingIndicator},
    transport::PushTransport,
};

const SEEN_MESSAGE_CAPACITY: usize = 512;

#[derive(Default)]
struct SeenMessages {
    order: VecDeque<MessageId>,
    ids: HashSet<MessageId>,
    newest: Option<MessageId>,
}

impl SeenMessages {
    /// Returns false if the id was already recorded.
    fn record(&mut self, id: MessageId) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > SEEN_MESSAGE_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        self.newest = self.newest.max(Some(id));
        true
    }
}

pub struct InboundRouter {
    registry: Arc<EventRegistry>,
    active: RwLock<Option<ChannelId>>,
    seen: Mutex<SeenMessages>,
}

impl InboundRouter {
    pub fn new(registry: Arc<EventRegistry>) -> Self {
        Self {
            registry,
            active: RwLock::new(None),
            seen: Mutex::new(SeenMessages::default()),
        }
    }

    pub fn active(&self) -> Option<ChannelId> {
        *self
            .active
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Switching to a different channel forgets the seen ids of the old one.
    pub fn set_active(&self, channel: Option<ChannelId>) {
        let mut active = self
            .active
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *active != channel {
            *active = channel;
            *self.seen() = SeenMessages::default();
        }
    }

    /// Highest message id seen on the active channel, from either transport.
    pub fn newest_seen(&self) -> Option<MessageId> {
        self.seen().newest
    }

    /// Normalizes one inbound event and emits it. Returns whether it was
    /// delivered.
    pub fn ingest(&self, event: PushEvent) -> bool {
        let channel_id = event.channel_id();
        if self.active() != Some(channel_id) {
            debug!(channel_id = %channel_id, "sync: dropping event for inactive channel");
            return false;
        }

        let sync_event = match event {
            PushEvent::NewMessage(message) => {
                if !self.seen().record(message.id) {
                    debug!(message_id = %message.id, "sync: dropping duplicate message");
                    return false;
                }
                SyncEvent::MessageAdded(message)
            }
            PushEvent::MessageEdited(message) => SyncEvent::MessageEdited(message),
            PushEvent::MessageDeleted {
                channel_id,
                message_id,
            } => SyncEvent::MessageDeleted {
                channel_id,
                message_id,
            },
            PushEvent::UserTyping {
                channel_id,
                user_id,
                username,
            } => SyncEvent::TypingStart {
                channel_id,
                user_id,
                username,
            },
            PushEvent::UserStopTyping {
                channel_id,
                user_id,
            } => SyncEvent::TypingStop {
                channel_id,
                user_id,
            },
            PushEvent::UserOnline {
                channel_id,
                user_id,
            } => SyncEvent::PresenceChanged {
                channel_id,
                user_id,
                online: true,
            },
            PushEvent::UserOffline {
                channel_id,
                user_id,
            } => SyncEvent::PresenceChanged {
                channel_id,
                user_id,
                online: false,
            },
        };

        self.registry.emit(&sync_event);
        true
    }

    fn seen(&self) -> MutexGuard<'_, SeenMessages> {
        self.seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// How a channel subscription is carried.
#[async_trait]
pub trait SyncStrategy: Send + Sync {
    fn mode(&self) -> TransportMode;
    async fn join(&self, channel: ChannelId) -> Result<(), TransportError>;
    async fn leave(&self, channel: ChannelId) -> Result<(), TransportError>;
}

pub struct PushStrategy {
    transport: Arc<dyn PushTransport>,
}

impl PushStrategy {
    pub fn new(transport: Arc<dyn PushTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl SyncStrategy for PushStrategy {
    fn mode(&self) -> TransportMode {
        TransportMode::Push
    }

    async fn join(&self, channel: ChannelId) -> Result<(), TransportError> {
        self.transport
            .send(PushCommand::JoinChannel {
                channel_id: channel,
            })
            .await
    }

    async fn leave(&self, channel: ChannelId) -> Result<(), TransportError> {
        self.transport
            .send(PushCommand::LeaveChannel {
                channel_id: channel,
            })
            .await
    }
}

pub struct PollStrategy {
    engine: Arc<PollFallbackEngine>,
    router: Arc<InboundRouter>,
}

impl PollStrategy {
    pub fn new(engine: Arc<PollFallbackEngine>, router: Arc<InboundRouter>) -> Self {
        Self { engine, router }
    }
}

#[async_trait]
impl SyncStrategy for PollStrategy {
    fn mode(&self) -> TransportMode {
        TransportMode::Poll
    }

    async fn join(&self, channel: ChannelId) -> Result<(), TransportError> {
        self.engine.start(channel, self.router.newest_seen());
        Ok(())
    }

    async fn leave(&self, channel: ChannelId) -> Result<(), TransportError> {
        self.engine.stop_for(channel);
        Ok(())
    }
}

#[derive(Debug)]
pub enum SendOutcome {
    /// Handed to the push transport; the echo arrives as a push event.
    Pushed,
    /// Stored through the request gateway.
    Stored(ChatMessage),
    Failed(RequestError),
}

impl SendOutcome {
    pub fn is_delivered(&self) -> bool {
        !matches!(self, SendOutcome::Failed(_))
    }
}

#[derive(Debug, Clone, Copy)]
struct Subscription {
    channel: ChannelId,
    carrier: TransportMode,
}

struct SwitchState {
    subscription: Option<Subscription>,
    mode: TransportMode,
}

pub struct ChannelSyncCoordinator {
    gateway: Arc<RequestGateway>,
    transport: Option<Arc<dyn PushTransport>>,
    registry: Arc<EventRegistry>,
    router: Arc<InboundRouter>,
    poll_engine: Arc<PollFallbackEngine>,
    typing: Arc<TypingIndicator>,
    push: Option<PushStrategy>,
    poll: PollStrategy,
    // FIFO: queued joins and leaves apply in call order.
    switch: tokio::sync::Mutex<SwitchState>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelSyncCoordinator {
    pub fn new(
        gateway: Arc<RequestGateway>,
        transport: Option<Arc<dyn PushTransport>>,
        registry: Arc<EventRegistry>,
        settings: &ClientSettings,
    ) -> Arc<Self> {
        let router = Arc::new(InboundRouter::new(Arc::clone(&registry)));
        let poll_engine = PollFallbackEngine::new(
            Arc::clone(&gateway),
            Arc::clone(&router),
            Arc::clone(&registry),
            &settings.poll,
        );
        let typing = TypingIndicator::new(Arc::clone(&gateway), transport.clone(), &settings.typing);
        let push = transport.clone().map(PushStrategy::new);
        let poll = PollStrategy::new(Arc::clone(&poll_engine), Arc::clone(&router));
        let mode = if transport.as_ref().is_some_and(|t| t.is_connected()) {
            TransportMode::Push
        } else {
            TransportMode::Poll
        };

        Arc::new(Self {
            gateway,
            transport,
            registry,
            router,
            poll_engine,
            typing,
            push,
            poll,
            switch: tokio::sync::Mutex::new(SwitchState {
                subscription: None,
                mode,
            }),
            listener: Mutex::new(None),
        })
    }

    pub fn registry(&self) -> &Arc<EventRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<InboundRouter> {
        &self.router
    }

    pub fn poll_engine(&self) -> &Arc<PollFallbackEngine> {
        &self.poll_engine
    }

    pub fn typing_indicator(&self) -> &Arc<TypingIndicator> {
        &self.typing
    }

    pub fn active_channel(&self) -> Option<ChannelId> {
        self.router.active()
    }

    /// Transport that new subscriptions would use right now.
    pub fn current_mode(&self) -> TransportMode {
        if self.connected_transport().is_some() {
            TransportMode::Push
        } else {
            TransportMode::Poll
        }
    }

    pub async fn join(&self, channel: ChannelId) -> TransportMode {
        let mut switch = self.switch.lock().await;
        if let Some(current) = switch.subscription.filter(|s| s.channel == channel) {
            debug!(channel_id = %channel, "sync: already joined");
            return current.carrier;
        }

        if let Some(previous) = switch.subscription.take() {
            self.typing.stop(previous.channel).await;
            if let Err(err) = self.strategy(previous.carrier).leave(previous.channel).await {
                debug!(channel_id = %previous.channel, error = %err, "sync: leave failed");
            }
        }

        self.router.set_active(Some(channel));
        let strategy = self.strategy(self.current_mode());
        let mode = strategy.mode();
        if let Err(err) = strategy.join(channel).await {
            warn!(channel_id = %channel, ?mode, error = %err, "sync: join over transport failed");
        }
        switch.subscription = Some(Subscription {
            channel,
            carrier: mode,
        });
        switch.mode = mode;
        drop(switch);

        info!(channel_id = %channel, ?mode, "sync: joined channel");
        self.registry.emit(&SyncEvent::ChannelJoined {
            channel_id: channel,
            mode,
        });
        mode
    }

    /// Leaves `channel`, or the active channel when `None`. Only the latter
    /// forgets the active channel.
    pub async fn leave(&self, channel: Option<ChannelId>) {
        let mut switch = self.switch.lock().await;
        let Some(target) = channel.or(switch.subscription.map(|s| s.channel)) else {
            return;
        };
        let carrier = switch
            .subscription
            .filter(|s| s.channel == target)
            .map(|s| s.carrier)
            .unwrap_or_else(|| self.current_mode());

        self.typing.stop(target).await;
        if let Err(err) = self.strategy(carrier).leave(target).await {
            debug!(channel_id = %target, error = %err, "sync: leave failed");
        }
        if channel.is_none() {
            switch.subscription = None;
            self.router.set_active(None);
        }
        info!(channel_id = %target, "sync: left channel");
    }

    /// Push when connected, the request gateway otherwise or when the push
    /// send fails. Failures are reported as an event, never raised.
    pub async fn send_message(&self, channel: ChannelId, content: &str) -> SendOutcome {
        if let Some(transport) = self.connected_transport() {
            let command = PushCommand::SendMessage {
                channel_id: channel,
                content: content.to_string(),
            };
            match transport.send(command).await {
                Ok(()) => {
                    self.typing.stop(channel).await;
                    return SendOutcome::Pushed;
                }
                Err(err) => {
                    warn!(channel_id = %channel, error = %err, "sync: push send failed, using request gateway")
                }
            }
        }

        match self.gateway.post_message(channel, content).await {
            Ok(message) => {
                self.typing.stop(channel).await;
                self.router.ingest(PushEvent::NewMessage(message.clone()));
                SendOutcome::Stored(message)
            }
            Err(err) => {
                warn!(channel_id = %channel, error = %err, "sync: message send failed");
                self.registry.emit(&SyncEvent::MessageSendError {
                    channel_id: channel,
                    content: content.to_string(),
                    error: err.to_string(),
                });
                SendOutcome::Failed(err)
            }
        }
    }

    pub async fn typing(&self, channel: ChannelId) {
        self.typing.keystroke(channel).await;
    }

    pub async fn stop_typing(&self, channel: ChannelId) {
        self.typing.stop(channel).await;
    }

    /// Spawns the listener that routes push frames and follows connectivity
    /// changes. Without a push transport there is nothing to listen to.
    pub fn start(self: &Arc<Self>) {
        let Some(transport) = self.transport.clone() else {
            return;
        };
        let mut inbound = transport.inbound();
        let mut connectivity = transport.connectivity();
        // Reconcile with whatever happened before the listener existed.
        connectivity.mark_changed();
        let weak = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = inbound.recv() => match received {
                        Ok(event) => {
                            let Some(coordinator) = weak.upgrade() else { break };
                            coordinator.router.ingest(event);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "sync: push listener lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    changed = connectivity.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let connected = *connectivity.borrow_and_update();
                        let Some(coordinator) = weak.upgrade() else { break };
                        coordinator.on_connectivity_changed(connected).await;
                    }
                }
            }
            debug!("sync: push listener exiting");
        });

        if let Some(previous) = self.lock_listener().replace(task) {
            previous.abort();
        }
    }

    /// Moves the active subscription onto the transport that is now usable
    /// and tells consumers about the switch.
    pub async fn on_connectivity_changed(&self, connected: bool) {
        let mode = if connected && self.push.is_some() {
            TransportMode::Push
        } else {
            TransportMode::Poll
        };

        let mut switch = self.switch.lock().await;
        // The subscription's carrier, not `mode`, decides whether to move.
        let mut moved = false;
        if let Some(subscription) = switch.subscription.as_mut() {
            if subscription.carrier != mode {
                let channel = subscription.channel;
                if let Err(err) = self.strategy(subscription.carrier).leave(channel).await {
                    debug!(channel_id = %channel, error = %err, "sync: leave on old transport failed");
                }
                if let Err(err) = self.strategy(mode).join(channel).await {
                    warn!(channel_id = %channel, ?mode, error = %err, "sync: rejoin failed");
                }
                subscription.carrier = mode;
                moved = true;
            }
        }
        if switch.mode == mode && !moved {
            return;
        }
        switch.mode = mode;
        drop(switch);

        info!(?mode, "sync: transport changed");
        self.registry
            .emit(&SyncEvent::TransportChanged { mode });
    }

    pub fn shutdown(&self) {
        if let Some(listener) = self.lock_listener().take() {
            listener.abort();
        }
        self.poll_engine.stop();
        self.typing.shutdown();
    }

    fn connected_transport(&self) -> Option<&Arc<dyn PushTransport>> {
        self.transport.as_ref().filter(|t| t.is_connected())
    }

    fn strategy(&self, mode: TransportMode) -> &dyn SyncStrategy {
        match (mode, &self.push) {
            (TransportMode::Push, Some(push)) => push,
            _ => &self.poll,
        }
    }

    fn lock_listener(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
