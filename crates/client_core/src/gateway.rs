//! Outbound request pipeline.
//!
//! Every call to the server goes through [`RequestGateway`]: idempotent reads
//! are answered from a TTL cache when fresh, everything else is appended to a
//! single FIFO queue drained by one task with a fixed pause between calls.
//! Failures come back classified as [`RequestError`]; nothing is retried here.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use serde::de::DeserializeOwned;
use serde_json::Value;
use shared::error::ResponseEnvelope;
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    time::Instant,
};
use tracing::{debug, warn};

use crate::{
    config::GatewaySettings,
    error::RequestError,
    http::{HttpCall, HttpDispatcher, HttpReply, Method},
};

pub mod api;

const MAX_ERROR_BODY_CHARS: usize = 500;
const AUTH_FAILURE_CHANNEL_CAPACITY: usize = 16;

/// Read-only view of the current credential. The gateway borrows the token
/// for each dispatch and never stores or mutates it.
pub trait CredentialProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

/// A 401-class failure together with the endpoint that produced it.
#[derive(Debug, Clone)]
pub struct AuthFailure {
    pub endpoint: String,
    pub error: RequestError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestOptions {
    pub method: Method,
    pub query: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub bypass_cache: bool,
}

impl RequestOptions {
    pub fn get() -> Self {
        Self::default()
    }

    pub fn post(body: Value) -> Self {
        Self {
            method: Method::Post,
            body: Some(body),
            ..Self::default()
        }
    }

    pub fn put(body: Value) -> Self {
        Self {
            method: Method::Put,
            body: Some(body),
            ..Self::default()
        }
    }

    pub fn delete() -> Self {
        Self {
            method: Method::Delete,
            ..Self::default()
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.insert(key.into(), value.to_string());
        self
    }

    pub fn bypass_cache(mut self) -> Self {
        self.bypass_cache = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    method: Method,
    endpoint: String,
    normalized_options: String,
}

impl CacheKey {
    /// Query pairs are kept sorted by `BTreeMap`; the body is rendered as
    /// compact JSON, whose object keys serde_json also keeps sorted.
    pub fn new(endpoint: &str, options: &RequestOptions) -> Self {
        let query = options
            .query
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let body = options
            .body
            .as_ref()
            .map(Value::to_string)
            .unwrap_or_default();
        Self {
            method: options.method,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            normalized_options: format!("{query}|{body}"),
        }
    }
}

struct CachedResponse {
    payload: Value,
    stored_at: Instant,
}

pub struct ResponseCache {
    ttl: Duration,
    entries: Mutex<HashMap<CacheKey, CachedResponse>>,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the cached payload unless it is older than the TTL; expired
    /// entries are dropped on the way out.
    pub fn lookup(&self, key: &CacheKey) -> Option<Value> {
        let mut entries = self.lock();
        let fresh = entries
            .get(key)
            .map(|cached| cached.stored_at.elapsed() <= self.ttl)?;
        if fresh {
            entries.get(key).map(|cached| cached.payload.clone())
        } else {
            entries.remove(key);
            None
        }
    }

    pub fn store(&self, key: CacheKey, payload: Value) {
        self.lock().insert(
            key,
            CachedResponse {
                payload,
                stored_at: Instant::now(),
            },
        );
    }

    pub fn purge_expired(&self) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, cached| cached.stored_at.elapsed() <= self.ttl);
        before - entries.len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, CachedResponse>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct QueuedCall {
    call_id: u64,
    endpoint: String,
    options: RequestOptions,
    cache_key: Option<CacheKey>,
    reply: oneshot::Sender<Result<Value, RequestError>>,
}

pub struct RequestGateway {
    queue: mpsc::UnboundedSender<QueuedCall>,
    cache: Arc<ResponseCache>,
    auth_failures: broadcast::Sender<AuthFailure>,
    next_call_id: AtomicU64,
}

impl RequestGateway {
    /// Spawns the drain task, so this has to run inside a tokio runtime.
    pub fn new(
        dispatcher: Arc<dyn HttpDispatcher>,
        credentials: Arc<dyn CredentialProvider>,
        settings: &GatewaySettings,
    ) -> Arc<Self> {
        let (queue, rx) = mpsc::unbounded_channel();
        let cache = Arc::new(ResponseCache::new(settings.cache_ttl));
        let (auth_failures, _) = broadcast::channel(AUTH_FAILURE_CHANNEL_CAPACITY);

        tokio::spawn(drain_queue(
            rx,
            QueueWorker {
                dispatcher,
                credentials,
                cache: Arc::clone(&cache),
                auth_failures: auth_failures.clone(),
                inter_call_delay: settings.inter_call_delay,
            },
        ));

        Arc::new(Self {
            queue,
            cache,
            auth_failures,
            next_call_id: AtomicU64::new(1),
        })
    }

    pub async fn call(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<Value, RequestError> {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let cache_key = options
            .method
            .is_idempotent_read()
            .then(|| CacheKey::new(endpoint, &options));

        if let Some(key) = &cache_key {
            if !options.bypass_cache {
                if let Some(payload) = self.cache.lookup(key) {
                    debug!(call_id, endpoint, "gateway: served from cache");
                    return Ok(payload);
                }
            }
        }

        let (reply, settled) = oneshot::channel();
        debug!(call_id, endpoint, method = options.method.as_str(), "gateway: queued call");
        self.queue
            .send(QueuedCall {
                call_id,
                endpoint: endpoint.to_string(),
                options,
                cache_key,
                reply,
            })
            .map_err(|_| RequestError::Closed)?;

        settled.await.map_err(|_| RequestError::Closed)?
    }

    pub async fn call_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<T, RequestError> {
        let payload = self.call(endpoint, options).await?;
        serde_json::from_value(payload).map_err(|err| RequestError::Parse {
            status: 200,
            message: format!("unexpected payload shape from {endpoint}: {err}"),
        })
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Every 401-class failure seen by any caller is republished here.
    pub fn subscribe_auth_failures(&self) -> broadcast::Receiver<AuthFailure> {
        self.auth_failures.subscribe()
    }
}

struct QueueWorker {
    dispatcher: Arc<dyn HttpDispatcher>,
    credentials: Arc<dyn CredentialProvider>,
    cache: Arc<ResponseCache>,
    auth_failures: broadcast::Sender<AuthFailure>,
    inter_call_delay: Duration,
}

async fn drain_queue(mut rx: mpsc::UnboundedReceiver<QueuedCall>, worker: QueueWorker) {
    let mut last_settled: Option<Instant> = None;

    while let Some(queued) = rx.recv().await {
        if let Some(settled_at) = last_settled {
            tokio::time::sleep_until(settled_at + worker.inter_call_delay).await;
        }

        let result = worker.dispatch(&queued).await;
        match &result {
            Ok(payload) => {
                if let Some(key) = &queued.cache_key {
                    worker.cache.store(key.clone(), payload.clone());
                }
            }
            Err(err) => {
                if err.is_auth_error() {
                    let _ = worker.auth_failures.send(AuthFailure {
                        endpoint: queued.endpoint.clone(),
                        error: err.clone(),
                    });
                }
                debug!(call_id = queued.call_id, endpoint = %queued.endpoint, error = %err, "gateway: call failed");
            }
        }

        last_settled = Some(Instant::now());
        if queued.reply.send(result).is_err() {
            debug!(call_id = queued.call_id, "gateway: caller went away before completion");
        }
    }

    debug!("gateway: queue closed, drain task exiting");
}

impl QueueWorker {
    async fn dispatch(&self, queued: &QueuedCall) -> Result<Value, RequestError> {
        let bearer = self.credentials.bearer_token();
        if bearer.is_none() {
            debug!(call_id = queued.call_id, endpoint = %queued.endpoint, "gateway: no credential attached");
        }

        let call = HttpCall {
            method: queued.options.method,
            endpoint: queued.endpoint.clone(),
            query: queued
                .options
                .query
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            body: queued.options.body.clone(),
            bearer,
        };

        let reply = self.dispatcher.dispatch(call).await?;
        classify_reply(reply)
    }
}

fn classify_reply(reply: HttpReply) -> Result<Value, RequestError> {
    let status = reply.status;
    let is_success = (200..300).contains(&status);

    let payload = if reply.body.trim().is_empty() {
        Value::Null
    } else {
        match serde_json::from_str::<Value>(&reply.body) {
            Ok(payload) => payload,
            Err(err) if is_success => {
                warn!(status, error = %err, "gateway: response body is not json");
                return Err(RequestError::Parse {
                    status,
                    message: truncate_body(&reply.body),
                });
            }
            Err(_) => return Err(RequestError::from_status(status, Value::Null)),
        }
    };

    if !is_success {
        return Err(RequestError::from_status(status, payload));
    }
    if !ResponseEnvelope::from_value(&payload).success {
        return Err(RequestError::from_rejected_envelope(status, payload));
    }
    Ok(payload)
}

fn truncate_body(body: &str) -> String {
    if body.chars().count() <= MAX_ERROR_BODY_CHARS {
        body.to_string()
    } else {
        let head: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
        format!("{head}... (truncated, {} total bytes)", body.len())
    }
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;
