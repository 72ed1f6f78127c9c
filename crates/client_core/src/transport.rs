//! Push transport collaborator: a persistent connection the server can send
//! unsolicited events over. The coordinator only relies on the
//! connect/disconnect/send/subscribe surface of [`PushTransport`].

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use shared::protocol::{PushCommand, PushEvent};
use tokio::{
    net::TcpStream,
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::{error::TransportError, gateway::CredentialProvider};

const INBOUND_CHANNEL_CAPACITY: usize = 1024;

#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;
    async fn disconnect(&self);
    fn is_connected(&self) -> bool;
    async fn send(&self, command: PushCommand) -> Result<(), TransportError>;
    /// Every inbound event, in arrival order.
    fn inbound(&self) -> broadcast::Receiver<PushEvent>;
    /// Flips whenever the connection comes up or goes away.
    fn connectivity(&self) -> watch::Receiver<bool>;
}

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

pub struct WebSocketTransport {
    url: String,
    credentials: Arc<dyn CredentialProvider>,
    writer: tokio::sync::Mutex<Option<WsWriter>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    inbound: broadcast::Sender<PushEvent>,
    connected: Arc<watch::Sender<bool>>,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>, credentials: Arc<dyn CredentialProvider>) -> Self {
        let (inbound, _) = broadcast::channel(INBOUND_CHANNEL_CAPACITY);
        let (connected, _) = watch::channel(false);
        Self {
            url: url.into(),
            credentials,
            writer: tokio::sync::Mutex::new(None),
            reader_task: Mutex::new(None),
            inbound,
            connected: Arc::new(connected),
        }
    }

    fn connect_url(&self) -> Result<Url, TransportError> {
        let mut url = Url::parse(&self.url)
            .map_err(|err| TransportError::Connect(format!("invalid push url {}: {err}", self.url)))?;
        if let Some(token) = self.credentials.bearer_token() {
            url.query_pairs_mut().append_pair("token", &token);
        }
        Ok(url)
    }

    fn replace_reader(&self, task: Option<JoinHandle<()>>) {
        let mut slot = self
            .reader_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = std::mem::replace(&mut *slot, task) {
            previous.abort();
        }
    }
}

#[async_trait]
impl PushTransport for WebSocketTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        if writer.is_some() && *self.connected.borrow() {
            return Ok(());
        }

        let url = self.connect_url()?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        let (ws_writer, mut ws_reader) = ws_stream.split();
        *writer = Some(ws_writer);

        let inbound = self.inbound.clone();
        let connected = Arc::clone(&self.connected);
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<PushEvent>(&text) {
                        Ok(event) => {
                            let _ = inbound.send(event);
                        }
                        Err(err) => warn!(error = %err, "push: ignoring unrecognised frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "push: websocket receive failed");
                        break;
                    }
                }
            }
            connected.send_replace(false);
            info!("push: connection closed");
        });
        self.replace_reader(Some(reader));

        self.connected.send_replace(true);
        info!(url = %self.url, "push: connected");
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(err) = writer.close().await {
                debug!(error = %err, "push: close handshake failed");
            }
        }
        self.replace_reader(None);
        self.connected.send_replace(false);
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    async fn send(&self, command: PushCommand) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            return Err(TransportError::NotConnected);
        };
        if !*self.connected.borrow() {
            return Err(TransportError::NotConnected);
        }

        let frame =
            serde_json::to_string(&command).map_err(|err| TransportError::Encode(err.to_string()))?;
        if let Err(err) = sink.send(Message::Text(frame)).await {
            *writer = None;
            self.connected.send_replace(false);
            return Err(TransportError::Send(err.to_string()));
        }
        debug!(command = command.name(), "push: sent command");
        Ok(())
    }

    fn inbound(&self) -> broadcast::Receiver<PushEvent> {
        self.inbound.subscribe()
    }

    fn connectivity(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }
}
