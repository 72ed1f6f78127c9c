//! Pull-side fallbacks used while the push transport is down: the periodic
//! message poller and the self-expiring typing flag.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use shared::{
    domain::{ChannelId, MessageId},
    protocol::{PushCommand, PushEvent},
};
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    config::{PollSettings, TypingSettings},
    events::{EventRegistry, SyncEvent},
    gateway::RequestGateway,
    sync::InboundRouter,
    transport::PushTransport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStep {
    Continue,
    /// Too many consecutive failures; the timer pauses for the cooldown.
    Backoff,
}

#[derive(Default)]
struct PollState {
    channel: Option<ChannelId>,
    watermark: Option<MessageId>,
    consecutive_failures: u32,
    degraded: bool,
    timer: Option<JoinHandle<()>>,
}

pub struct PollFallbackEngine {
    gateway: Arc<RequestGateway>,
    router: Arc<InboundRouter>,
    registry: Arc<EventRegistry>,
    settings: PollSettings,
    state: Mutex<PollState>,
}

impl PollFallbackEngine {
    pub fn new(
        gateway: Arc<RequestGateway>,
        router: Arc<InboundRouter>,
        registry: Arc<EventRegistry>,
        settings: &PollSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            router,
            registry,
            settings: settings.clone(),
            state: Mutex::new(PollState::default()),
        })
    }

    /// Starts polling `channel`, replacing whatever was running. The first
    /// tick fires immediately. Without a watermark the first poll replays the
    /// latest batch.
    pub fn start(self: &Arc<Self>, channel: ChannelId, watermark: Option<MessageId>) {
        let mut state = self.lock();
        if let Some(previous) = state.timer.take() {
            previous.abort();
        }
        state.channel = Some(channel);
        state.watermark = watermark;
        state.consecutive_failures = 0;
        state.degraded = false;
        state.timer = Some(self.spawn_timer());
        info!(channel_id = %channel, ?watermark, "poll: started");
    }

    pub fn stop(&self) {
        let mut state = self.lock();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        if let Some(channel) = state.channel.take() {
            info!(channel_id = %channel, "poll: stopped");
        }
        state.consecutive_failures = 0;
        state.degraded = false;
    }

    /// Stops only if `channel` is the one being polled.
    pub fn stop_for(&self, channel: ChannelId) {
        if self.lock().channel == Some(channel) {
            self.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock()
            .timer
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    pub fn channel(&self) -> Option<ChannelId> {
        self.lock().channel
    }

    pub fn watermark(&self) -> Option<MessageId> {
        self.lock().watermark
    }

    pub async fn poll_once(&self) -> PollStep {
        let (channel, since) = {
            let state = self.lock();
            match state.channel {
                Some(channel) => (channel, state.watermark),
                None => return PollStep::Continue,
            }
        };

        match self
            .gateway
            .poll_messages(channel, since, self.settings.batch_limit)
            .await
        {
            Ok(mut messages) => {
                messages.sort_by_key(|message| message.id);
                messages.retain(|message| since.map_or(true, |watermark| message.id > watermark));

                let restored = {
                    let mut state = self.lock();
                    if state.channel != Some(channel) {
                        return PollStep::Continue;
                    }
                    state.consecutive_failures = 0;
                    if let Some(newest) = messages.last() {
                        state.watermark = state.watermark.max(Some(newest.id));
                    }
                    std::mem::take(&mut state.degraded)
                };

                if restored {
                    info!(channel_id = %channel, "poll: recovered");
                    self.registry.emit(&SyncEvent::SyncRestored {
                        channel_id: channel,
                    });
                }
                if !messages.is_empty() {
                    debug!(channel_id = %channel, count = messages.len(), "poll: new messages");
                }
                for message in messages {
                    self.router.ingest(PushEvent::NewMessage(message));
                }
                PollStep::Continue
            }
            Err(err) => {
                let mut state = self.lock();
                if state.channel != Some(channel) {
                    return PollStep::Continue;
                }
                state.consecutive_failures += 1;
                let failures = state.consecutive_failures;
                if failures < self.settings.failure_threshold {
                    debug!(channel_id = %channel, failures, error = %err, "poll: request failed");
                    return PollStep::Continue;
                }

                state.consecutive_failures = 0;
                let first_degradation = !state.degraded;
                state.degraded = true;
                drop(state);

                warn!(
                    channel_id = %channel,
                    failures,
                    cooldown_ms = self.settings.cooldown.as_millis() as u64,
                    error = %err,
                    "poll: too many consecutive failures, backing off"
                );
                if first_degradation {
                    self.registry.emit(&SyncEvent::SyncDegraded {
                        channel_id: channel,
                        consecutive_failures: failures,
                    });
                }
                PollStep::Backoff
            }
        }
    }

    fn spawn_timer(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.settings.interval;
        let cooldown = self.settings.cooldown;
        tokio::spawn(async move {
            let mut ticker = poll_ticker(period);
            loop {
                ticker.tick().await;
                let Some(engine) = weak.upgrade() else {
                    break;
                };
                if engine.poll_once().await == PollStep::Backoff {
                    drop(engine);
                    tokio::time::sleep(cooldown).await;
                    ticker = poll_ticker(period);
                }
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, PollState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn poll_ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

impl Drop for PollFallbackEngine {
    fn drop(&mut self) {
        if let Some(timer) = self.lock().timer.take() {
            timer.abort();
        }
    }
}

struct TypingFlag {
    deadline: Instant,
    timer: JoinHandle<()>,
}

/// Local "I am typing" flag per channel. The first keystroke announces the
/// start, later keystrokes only push the deadline out, and the stop goes out
/// once when the flag expires or is cleared.
pub struct TypingIndicator {
    gateway: Arc<RequestGateway>,
    transport: Option<Arc<dyn PushTransport>>,
    expiry: Duration,
    active: Mutex<HashMap<ChannelId, TypingFlag>>,
}

impl TypingIndicator {
    pub fn new(
        gateway: Arc<RequestGateway>,
        transport: Option<Arc<dyn PushTransport>>,
        settings: &TypingSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            transport,
            expiry: settings.expiry,
            active: Mutex::new(HashMap::new()),
        })
    }

    pub async fn keystroke(self: &Arc<Self>, channel: ChannelId) {
        let rising_edge = {
            let mut active = self.lock();
            let deadline = Instant::now() + self.expiry;
            match active.get_mut(&channel) {
                Some(flag) => {
                    flag.deadline = deadline;
                    false
                }
                None => {
                    let timer = self.spawn_expiry(channel);
                    active.insert(channel, TypingFlag { deadline, timer });
                    true
                }
            }
        };
        if rising_edge {
            self.announce(channel, true).await;
        }
    }

    pub async fn stop(&self, channel: ChannelId) {
        let flag = self.lock().remove(&channel);
        if let Some(flag) = flag {
            flag.timer.abort();
            self.announce(channel, false).await;
        }
    }

    pub fn is_typing(&self, channel: ChannelId) -> bool {
        self.lock().contains_key(&channel)
    }

    /// Drops every flag without announcing anything.
    pub fn shutdown(&self) {
        for (_, flag) in self.lock().drain() {
            flag.timer.abort();
        }
    }

    // Must be called with `active` locked so the task cannot look for its
    // flag before it is inserted.
    fn spawn_expiry(self: &Arc<Self>, channel: ChannelId) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let deadline = {
                    let Some(indicator) = weak.upgrade() else {
                        return;
                    };
                    let active = indicator.lock();
                    match active.get(&channel) {
                        Some(flag) => flag.deadline,
                        None => return,
                    }
                };
                tokio::time::sleep_until(deadline).await;

                let Some(indicator) = weak.upgrade() else {
                    return;
                };
                let expired = {
                    let mut active = indicator.lock();
                    match active.get(&channel) {
                        Some(flag) if flag.deadline <= Instant::now() => {
                            active.remove(&channel);
                            true
                        }
                        Some(_) => false,
                        None => return,
                    }
                };
                if expired {
                    debug!(channel_id = %channel, "typing: flag expired");
                    indicator.announce(channel, false).await;
                    return;
                }
            }
        })
    }

    async fn announce(&self, channel: ChannelId, typing: bool) {
        if let Some(transport) = self.transport.as_ref().filter(|t| t.is_connected()) {
            let command = if typing {
                PushCommand::TypingStart {
                    channel_id: channel,
                }
            } else {
                PushCommand::TypingStop {
                    channel_id: channel,
                }
            };
            match transport.send(command).await {
                Ok(()) => return,
                Err(err) => debug!(channel_id = %channel, error = %err, "typing: push send failed"),
            }
        }
        if let Err(err) = self.gateway.announce_typing(channel, typing).await {
            debug!(channel_id = %channel, typing, error = %err, "typing: announcement failed");
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ChannelId, TypingFlag>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
#[path = "tests/poll_tests.rs"]
mod tests;
