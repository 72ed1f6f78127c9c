//! Client-side synchronization layer: one outbound request pipeline, a
//! session guard, and a coordinator that keeps the joined channel fed from
//! push events or from polling, whichever is available.

pub mod auth;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod gateway;
pub mod http;
pub mod poll;
pub mod single_flight;
pub mod store;
pub mod sync;
pub mod transport;

pub use auth::{
    AuthSessionGuard, Credential, InvalidationReason, SessionCell, SessionEvent, SessionPhase,
    VerifyOutcome,
};
pub use config::{load_settings, load_settings_from, ClientSettings};
pub use context::SyncContext;
pub use error::{RequestError, TransportError};
pub use events::{EventKind, EventRegistry, SubscriptionId, SyncEvent, TransportMode};
pub use gateway::{
    api::MessageWindow, AuthFailure, CredentialProvider, RequestGateway, RequestOptions,
};
pub use http::{HttpDispatcher, Method, ReqwestDispatcher};
pub use poll::{PollFallbackEngine, PollStep, TypingIndicator};
pub use store::{FileSessionStore, MemorySessionStore, SessionStore};
pub use sync::{ChannelSyncCoordinator, InboundRouter, SendOutcome};
pub use transport::{PushTransport, WebSocketTransport};

#[cfg(test)]
#[path = "tests/support.rs"]
mod support;
