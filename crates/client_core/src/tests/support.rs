//! Scripted collaborators shared by the unit tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use shared::{
    domain::{ChannelId, ChatMessage, MessageId, UserId, UserProfile},
    protocol::{PushCommand, PushEvent},
};
use tokio::{
    sync::{broadcast, mpsc, watch},
    time::Instant,
};

use crate::{
    config::GatewaySettings,
    error::{RequestError, TransportError},
    events::SyncEvent,
    gateway::{CredentialProvider, RequestGateway},
    http::{HttpCall, HttpDispatcher, HttpReply, Method},
    store::SessionStore,
    transport::PushTransport,
};

#[derive(Debug, Clone)]
pub enum Scripted {
    Reply(HttpReply),
    Offline,
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub call: HttpCall,
    pub started: Instant,
    pub finished: Instant,
}

/// Answers per endpoint from a queue of one-shot replies, then from a sticky
/// default, then with `200 {"success": true}`.
#[derive(Default)]
pub struct ScriptedDispatcher {
    queued: Mutex<HashMap<String, VecDeque<Scripted>>>,
    defaults: Mutex<HashMap<String, Scripted>>,
    calls: Mutex<Vec<RecordedCall>>,
    latency: Mutex<Duration>,
}

impl ScriptedDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reply(&self, endpoint: &str, status: u16, body: Value) {
        self.enqueue(endpoint, Scripted::Reply(reply(status, body.to_string())));
    }

    pub fn reply_raw(&self, endpoint: &str, status: u16, body: &str) {
        self.enqueue(endpoint, Scripted::Reply(reply(status, body.to_string())));
    }

    pub fn offline_once(&self, endpoint: &str) {
        self.enqueue(endpoint, Scripted::Offline);
    }

    pub fn always(&self, endpoint: &str, status: u16, body: Value) {
        self.defaults.lock().expect("defaults").insert(
            endpoint.to_string(),
            Scripted::Reply(reply(status, body.to_string())),
        );
    }

    pub fn always_offline(&self, endpoint: &str) {
        self.defaults
            .lock()
            .expect("defaults")
            .insert(endpoint.to_string(), Scripted::Offline);
    }

    /// Like [`Self::always`] but only for one method, for endpoints that
    /// serve both reads and writes.
    pub fn always_for(&self, method: Method, endpoint: &str, status: u16, body: Value) {
        self.defaults.lock().expect("defaults").insert(
            method_key(method, endpoint),
            Scripted::Reply(reply(status, body.to_string())),
        );
    }

    pub fn always_offline_for(&self, method: Method, endpoint: &str) {
        self.defaults
            .lock()
            .expect("defaults")
            .insert(method_key(method, endpoint), Scripted::Offline);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().expect("latency") = latency;
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("calls").clone()
    }

    pub fn calls_to(&self, endpoint: &str) -> Vec<HttpCall> {
        self.calls()
            .into_iter()
            .filter(|recorded| recorded.call.endpoint == endpoint)
            .map(|recorded| recorded.call)
            .collect()
    }

    pub fn count(&self, endpoint: &str) -> usize {
        self.calls_to(endpoint).len()
    }

    fn enqueue(&self, endpoint: &str, scripted: Scripted) {
        self.queued
            .lock()
            .expect("queued")
            .entry(endpoint.to_string())
            .or_default()
            .push_back(scripted);
    }

    fn next_for(&self, call: &HttpCall) -> Scripted {
        if let Some(scripted) = self
            .queued
            .lock()
            .expect("queued")
            .get_mut(&call.endpoint)
            .and_then(VecDeque::pop_front)
        {
            return scripted;
        }
        let defaults = self.defaults.lock().expect("defaults");
        let scripted = defaults
            .get(&method_key(call.method, &call.endpoint))
            .or_else(|| defaults.get(&call.endpoint))
            .cloned();
        scripted.unwrap_or_else(|| Scripted::Reply(reply(200, json!({ "success": true }).to_string())))
    }
}

fn method_key(method: Method, endpoint: &str) -> String {
    format!("{} {endpoint}", method.as_str())
}

fn reply(status: u16, body: String) -> HttpReply {
    HttpReply { status, body }
}

#[async_trait]
impl HttpDispatcher for ScriptedDispatcher {
    async fn dispatch(&self, call: HttpCall) -> Result<HttpReply, RequestError> {
        let started = Instant::now();
        let latency = *self.latency.lock().expect("latency");
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        let scripted = self.next_for(&call);
        self.calls.lock().expect("calls").push(RecordedCall {
            call,
            started,
            finished: Instant::now(),
        });
        match scripted {
            Scripted::Reply(reply) => Ok(reply),
            Scripted::Offline => Err(RequestError::network("connection refused")),
        }
    }
}

pub struct StaticCredential(pub Option<String>);

impl CredentialProvider for StaticCredential {
    fn bearer_token(&self) -> Option<String> {
        self.0.clone()
    }
}

pub fn gateway(
    dispatcher: Arc<ScriptedDispatcher>,
    credentials: Arc<dyn CredentialProvider>,
) -> Arc<RequestGateway> {
    RequestGateway::new(dispatcher, credentials, &GatewaySettings::default())
}

/// Push transport whose connectivity and inbound frames the test drives.
pub struct FakeTransport {
    connected: watch::Sender<bool>,
    inbound: broadcast::Sender<PushEvent>,
    sent: Mutex<Vec<PushCommand>>,
    fail_sends: AtomicBool,
}

impl FakeTransport {
    pub fn new(connected: bool) -> Arc<Self> {
        let (connected, _) = watch::channel(connected);
        let (inbound, _) = broadcast::channel(64);
        Arc::new(Self {
            connected,
            inbound,
            sent: Mutex::new(Vec::new()),
            fail_sends: AtomicBool::new(false),
        })
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.send_replace(connected);
    }

    pub fn deliver(&self, event: PushEvent) {
        let _ = self.inbound.send(event);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<PushCommand> {
        self.sent.lock().expect("sent").clone()
    }
}

#[async_trait]
impl PushTransport for FakeTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        self.set_connected(true);
        Ok(())
    }

    async fn disconnect(&self) {
        self.set_connected(false);
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    async fn send(&self, command: PushCommand) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Send("socket reset".into()));
        }
        self.sent.lock().expect("sent").push(command);
        Ok(())
    }

    fn inbound(&self) -> broadcast::Receiver<PushEvent> {
        self.inbound.subscribe()
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }
}

pub struct FailingStore;

impl SessionStore for FailingStore {
    fn get(&self, _key: &str) -> anyhow::Result<Option<String>> {
        anyhow::bail!("disk unavailable")
    }

    fn set(&self, _key: &str, _value: &str) -> anyhow::Result<()> {
        anyhow::bail!("disk unavailable")
    }

    fn remove(&self, _key: &str) -> anyhow::Result<()> {
        anyhow::bail!("disk unavailable")
    }
}

pub fn message(id: i64, channel: i64, content: &str) -> ChatMessage {
    ChatMessage {
        id: MessageId(id),
        channel_id: ChannelId(channel),
        author_id: Some(UserId(1)),
        author_username: Some("ada".into()),
        content: content.into(),
        sent_at: None,
        edited_at: None,
    }
}

pub fn profile(id: i64, username: &str) -> UserProfile {
    UserProfile {
        id: UserId(id),
        username: username.into(),
        display_name: None,
        avatar_url: None,
    }
}

pub fn drain(rx: &mut mpsc::UnboundedReceiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Lets spawned tasks run until they block again.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
