//! Typed publish/subscribe for sync events.

use std::{
    collections::BTreeMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use shared::domain::{ChannelId, ChatMessage, MessageId, UserId};
use tokio::sync::mpsc;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventKind {
    ChannelJoined,
    MessageAdded,
    MessageEdited,
    MessageDeleted,
    TypingStart,
    TypingStop,
    PresenceChanged,
    MessageSendError,
    SyncDegraded,
    SyncRestored,
    TransportChanged,
}

impl EventKind {
    pub const ALL: [EventKind; 11] = [
        EventKind::ChannelJoined,
        EventKind::MessageAdded,
        EventKind::MessageEdited,
        EventKind::MessageDeleted,
        EventKind::TypingStart,
        EventKind::TypingStop,
        EventKind::PresenceChanged,
        EventKind::MessageSendError,
        EventKind::SyncDegraded,
        EventKind::SyncRestored,
        EventKind::TransportChanged,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::ChannelJoined => "channel-joined",
            EventKind::MessageAdded => "message-added",
            EventKind::MessageEdited => "message-edited",
            EventKind::MessageDeleted => "message-deleted",
            EventKind::TypingStart => "typing-start",
            EventKind::TypingStop => "typing-stop",
            EventKind::PresenceChanged => "presence-changed",
            EventKind::MessageSendError => "message-send-error",
            EventKind::SyncDegraded => "sync-degraded",
            EventKind::SyncRestored => "sync-restored",
            EventKind::TransportChanged => "transport-changed",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Push,
    Poll,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    ChannelJoined {
        channel_id: ChannelId,
        mode: TransportMode,
    },
    MessageAdded(ChatMessage),
    MessageEdited(ChatMessage),
    MessageDeleted {
        channel_id: ChannelId,
        message_id: MessageId,
    },
    TypingStart {
        channel_id: ChannelId,
        user_id: UserId,
        username: Option<String>,
    },
    TypingStop {
        channel_id: ChannelId,
        user_id: UserId,
    },
    PresenceChanged {
        channel_id: ChannelId,
        user_id: UserId,
        online: bool,
    },
    MessageSendError {
        channel_id: ChannelId,
        content: String,
        error: String,
    },
    SyncDegraded {
        channel_id: ChannelId,
        consecutive_failures: u32,
    },
    SyncRestored {
        channel_id: ChannelId,
    },
    TransportChanged {
        mode: TransportMode,
    },
}

impl SyncEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SyncEvent::ChannelJoined { .. } => EventKind::ChannelJoined,
            SyncEvent::MessageAdded(_) => EventKind::MessageAdded,
            SyncEvent::MessageEdited(_) => EventKind::MessageEdited,
            SyncEvent::MessageDeleted { .. } => EventKind::MessageDeleted,
            SyncEvent::TypingStart { .. } => EventKind::TypingStart,
            SyncEvent::TypingStop { .. } => EventKind::TypingStop,
            SyncEvent::PresenceChanged { .. } => EventKind::PresenceChanged,
            SyncEvent::MessageSendError { .. } => EventKind::MessageSendError,
            SyncEvent::SyncDegraded { .. } => EventKind::SyncDegraded,
            SyncEvent::SyncRestored { .. } => EventKind::SyncRestored,
            SyncEvent::TransportChanged { .. } => EventKind::TransportChanged,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&SyncEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub struct EventRegistry {
    next_id: AtomicU64,
    handlers: RwLock<BTreeMap<SubscriptionId, (EventKind, EventHandler)>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&SyncEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id, (kind, Arc::new(handler)));
        id
    }

    /// Forwards every event of the given kinds into an unbounded channel.
    /// The subscriptions go away on their own once the receiver is dropped
    /// and the next matching event fails to send.
    pub fn channel(self: &Arc<Self>, kinds: &[EventKind]) -> mpsc::UnboundedReceiver<SyncEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        for kind in kinds {
            let tx = tx.clone();
            let registry = Arc::downgrade(self);
            let id_cell: Arc<std::sync::OnceLock<SubscriptionId>> = Arc::default();
            let id_for_handler = Arc::clone(&id_cell);
            let id = self.subscribe(*kind, move |event| {
                if tx.send(event.clone()).is_err() {
                    if let (Some(registry), Some(id)) = (registry.upgrade(), id_for_handler.get())
                    {
                        registry.unsubscribe(*id);
                    }
                }
                Ok(())
            });
            let _ = id_cell.set(id);
        }
        rx
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&id)
            .is_some()
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .filter(|(handler_kind, _)| *handler_kind == kind)
            .count()
    }

    /// Delivers the event to every handler registered for its kind, in
    /// subscription order. A handler that errors or panics is logged and
    /// skipped. Returns the number of handlers that completed cleanly.
    pub fn emit(&self, event: &SyncEvent) -> usize {
        let kind = event.kind();
        let handlers: Vec<(SubscriptionId, EventHandler)> = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|(_, (handler_kind, _))| *handler_kind == kind)
            .map(|(id, (_, handler))| (*id, Arc::clone(handler)))
            .collect();

        let mut delivered = 0;
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(err)) => {
                    warn!(event = %kind, subscription = id.0, error = %err, "events: handler failed")
                }
                Err(_) => error!(event = %kind, subscription = id.0, "events: handler panicked"),
            }
        }
        delivered
    }
}
