use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use tokio::task::JoinHandle;
use tracing::info;

use crate::{
    auth::{AuthSessionGuard, SessionCell},
    config::ClientSettings,
    events::EventRegistry,
    gateway::{CredentialProvider, RequestGateway},
    http::{HttpDispatcher, ReqwestDispatcher},
    store::SessionStore,
    sync::ChannelSyncCoordinator,
    transport::{PushTransport, WebSocketTransport},
};

/// Everything the client needs, built once and handed around explicitly.
/// Separate contexts share nothing, so tests can run several side by side.
pub struct SyncContext {
    settings: ClientSettings,
    gateway: Arc<RequestGateway>,
    auth: Arc<AuthSessionGuard>,
    registry: Arc<EventRegistry>,
    coordinator: Arc<ChannelSyncCoordinator>,
    transport: Option<Arc<dyn PushTransport>>,
    auth_watch: Mutex<Option<JoinHandle<()>>>,
}

impl SyncContext {
    /// Wires the components around the given collaborators. Must run inside
    /// a tokio runtime.
    pub fn new(
        settings: ClientSettings,
        session: Arc<SessionCell>,
        dispatcher: Arc<dyn HttpDispatcher>,
        store: Arc<dyn SessionStore>,
        transport: Option<Arc<dyn PushTransport>>,
    ) -> Self {
        let credentials: Arc<dyn CredentialProvider> = session.clone();
        let gateway = RequestGateway::new(dispatcher, credentials, &settings.gateway);
        let auth = AuthSessionGuard::new(Arc::clone(&gateway), session, store, &settings.auth);
        let registry = Arc::new(EventRegistry::new());
        let coordinator = ChannelSyncCoordinator::new(
            Arc::clone(&gateway),
            transport.clone(),
            Arc::clone(&registry),
            &settings,
        );

        Self {
            settings,
            gateway,
            auth,
            registry,
            coordinator,
            transport,
            auth_watch: Mutex::new(None),
        }
    }

    /// Production wiring: reqwest for requests and a websocket for push.
    pub fn connect(settings: ClientSettings, store: Arc<dyn SessionStore>) -> anyhow::Result<Self> {
        let session = Arc::new(SessionCell::new());
        let dispatcher = ReqwestDispatcher::new(&settings.server_url, settings.gateway.request_timeout)
            .with_context(|| format!("invalid server url {}", settings.server_url))?;
        let push_url = settings.resolved_push_url()?;
        let credentials: Arc<dyn CredentialProvider> = session.clone();
        let transport: Arc<dyn PushTransport> = Arc::new(WebSocketTransport::new(push_url, credentials));

        Ok(Self::new(
            settings,
            session,
            Arc::new(dispatcher),
            store,
            Some(transport),
        ))
    }

    /// Starts the background listeners. Connecting the push transport is left
    /// to the caller; until then everything runs over polling.
    pub fn start(&self) {
        let watcher = self.auth.watch_auth_failures();
        if let Some(previous) = self
            .auth_watch
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(watcher)
        {
            previous.abort();
        }
        self.coordinator.start();
        info!(server_url = %self.settings.server_url, "context: started");
    }

    pub async fn shutdown(&self) {
        self.coordinator.shutdown();
        if let Some(watcher) = self
            .auth_watch
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            watcher.abort();
        }
        if let Some(transport) = &self.transport {
            transport.disconnect().await;
        }
        info!("context: shut down");
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn gateway(&self) -> &Arc<RequestGateway> {
        &self.gateway
    }

    pub fn auth(&self) -> &Arc<AuthSessionGuard> {
        &self.auth
    }

    pub fn events(&self) -> &Arc<EventRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<ChannelSyncCoordinator> {
        &self.coordinator
    }

    pub fn transport(&self) -> Option<&Arc<dyn PushTransport>> {
        self.transport.as_ref()
    }
}
