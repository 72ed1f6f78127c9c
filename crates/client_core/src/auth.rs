//! Session ownership and credential verification.
//!
//! [`SessionCell`] holds the credential and profile; the gateway and the push
//! transport only ever see it through [`CredentialProvider`]. All mutation
//! goes through [`AuthSessionGuard`], which re-verifies restored sessions in
//! the background and clears the session exactly once when the server says the
//! credential is no good. Failures that merely mean "could not confirm" leave
//! the session alone.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::domain::UserProfile;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    config::AuthSettings,
    error::RequestError,
    gateway::{
        api::{LOGIN_ENDPOINT, LOGOUT_ENDPOINT, VERIFY_ENDPOINT},
        CredentialProvider, RequestGateway,
    },
    single_flight::SingleFlight,
    store::SessionStore,
};

pub const TOKEN_KEY: &str = "auth_token";
pub const ISSUED_AT_KEY: &str = "auth_issued_at";
pub const PROFILE_KEY: &str = "user_profile";

const SESSION_EVENT_CAPACITY: usize = 64;

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub token: String,
    pub issued_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            issued_at: Utc::now(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Anonymous,
    /// Loaded from the store, not yet confirmed by the server.
    Restored,
    Verified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationReason {
    Rejected,
    Logout,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    PhaseChanged(SessionPhase),
    LoginRequired(InvalidationReason),
}

#[derive(Debug, Clone, PartialEq)]
pub enum VerifyOutcome {
    Verified(UserProfile),
    Invalidated,
    /// The server could not be asked or gave no verdict on the credential.
    Inconclusive(String),
    Throttled,
    Anonymous,
}

#[derive(Default)]
struct SessionState {
    credential: Option<Credential>,
    profile: Option<UserProfile>,
    phase: SessionPhase,
}

#[derive(Default)]
pub struct SessionCell {
    state: RwLock<SessionState>,
}

impl SessionCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> SessionPhase {
        self.read().phase
    }

    pub fn is_authenticated(&self) -> bool {
        self.phase() != SessionPhase::Anonymous
    }

    pub fn credential(&self) -> Option<Credential> {
        self.read().credential.clone()
    }

    pub fn profile(&self) -> Option<UserProfile> {
        self.read().profile.clone()
    }

    fn install(&self, credential: Credential, profile: Option<UserProfile>, phase: SessionPhase) {
        let mut state = self.write();
        state.credential = Some(credential);
        state.profile = profile;
        state.phase = phase;
    }

    /// Promotes the session to `Verified` only if `token` is still the one in
    /// place. Returns the previous phase on success.
    fn mark_verified(&self, token: &str, profile: UserProfile) -> Option<SessionPhase> {
        let mut state = self.write();
        if state.credential.as_ref().map(|c| c.token.as_str()) != Some(token) {
            return None;
        }
        state.profile = Some(profile);
        Some(std::mem::replace(&mut state.phase, SessionPhase::Verified))
    }

    /// Returns whether there was anything to clear.
    fn clear(&self) -> bool {
        let mut state = self.write();
        let had_session = state.credential.is_some();
        *state = SessionState::default();
        had_session
    }

    fn holds_token(&self, token: &str) -> bool {
        self.read().credential.as_ref().map(|c| c.token.as_str()) == Some(token)
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CredentialProvider for SessionCell {
    fn bearer_token(&self) -> Option<String> {
        self.read().credential.as_ref().map(|c| c.token.clone())
    }
}

pub struct AuthSessionGuard {
    gateway: Arc<RequestGateway>,
    session: Arc<SessionCell>,
    store: Arc<dyn SessionStore>,
    verify_flight: SingleFlight<VerifyOutcome>,
    last_verify: Mutex<Option<Instant>>,
    min_interval: Duration,
    invalidating: AtomicBool,
    events: broadcast::Sender<SessionEvent>,
}

impl AuthSessionGuard {
    pub fn new(
        gateway: Arc<RequestGateway>,
        session: Arc<SessionCell>,
        store: Arc<dyn SessionStore>,
        settings: &AuthSettings,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        Arc::new(Self {
            gateway,
            session,
            store,
            verify_flight: SingleFlight::new(),
            last_verify: Mutex::new(None),
            min_interval: settings.verify_min_interval,
            invalidating: AtomicBool::new(false),
            events,
        })
    }

    pub fn session(&self) -> &Arc<SessionCell> {
        &self.session
    }

    pub fn gateway(&self) -> &Arc<RequestGateway> {
        &self.gateway
    }

    pub fn phase(&self) -> SessionPhase {
        self.session.phase()
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_authenticated()
    }

    pub fn profile(&self) -> Option<UserProfile> {
        self.session.profile()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn is_verifying(&self) -> bool {
        self.verify_flight.is_in_flight()
    }

    /// Re-checks the current credential with the server. Callers arriving
    /// while a check runs share its outcome; a new check is refused until the
    /// minimum interval since the last one has passed.
    pub async fn verify_in_background(self: &Arc<Self>) -> VerifyOutcome {
        let Some(credential) = self.session.credential() else {
            return VerifyOutcome::Anonymous;
        };

        let guard = Arc::clone(self);
        self.verify_flight
            .run_if(
                || self.admit_verification(),
                move || async move { guard.run_verification(credential).await },
            )
            .await
            .unwrap_or(VerifyOutcome::Throttled)
    }

    pub fn schedule_verification(self: &Arc<Self>) -> JoinHandle<VerifyOutcome> {
        let guard = Arc::clone(self);
        tokio::spawn(async move { guard.verify_in_background().await })
    }

    /// Loads a persisted session optimistically and schedules a background
    /// check. Returns whether a session was restored.
    pub fn restore_from_store(self: &Arc<Self>) -> bool {
        let token = match self.store.get(TOKEN_KEY) {
            Ok(Some(token)) if !token.is_empty() => token,
            Ok(_) => return false,
            Err(err) => {
                warn!(error = %err, "auth: failed to read stored credential");
                return false;
            }
        };

        let issued_at = self
            .store
            .get(ISSUED_AT_KEY)
            .ok()
            .flatten()
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|at| at.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let profile = match self.store.get(PROFILE_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<UserProfile>(&raw) {
                Ok(profile) => Some(profile),
                Err(err) => {
                    warn!(error = %err, "auth: dropping corrupt stored profile");
                    self.forget(PROFILE_KEY);
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(error = %err, "auth: failed to read stored profile");
                None
            }
        };

        info!(
            user = profile.as_ref().map(|p| p.username.as_str()).unwrap_or("<unknown>"),
            "auth: restored session from store"
        );
        self.session
            .install(Credential { token, issued_at }, profile, SessionPhase::Restored);
        self.publish(SessionEvent::PhaseChanged(SessionPhase::Restored));
        self.schedule_verification();
        true
    }

    pub async fn sign_in(
        &self,
        username: &str,
        password: &str,
    ) -> Result<UserProfile, RequestError> {
        let response = self.gateway.sign_in(username, password).await?;
        self.establish(Credential::new(response.token), response.user.clone());
        info!(user = %response.user.username, "auth: signed in");
        Ok(response.user)
    }

    /// Installs a session obtained elsewhere as verified and persists it.
    pub fn establish(&self, credential: Credential, profile: UserProfile) {
        self.persist(TOKEN_KEY, &credential.token);
        self.persist(ISSUED_AT_KEY, &credential.issued_at.to_rfc3339());
        self.persist_profile(&profile);
        self.session
            .install(credential, Some(profile), SessionPhase::Verified);
        self.publish(SessionEvent::PhaseChanged(SessionPhase::Verified));
    }

    /// Tells the server (best effort) and then clears the session.
    pub async fn logout(&self) -> bool {
        if self.session.credential().is_some() {
            if let Err(err) = self.gateway.sign_out().await {
                debug!(error = %err, "auth: logout call failed, clearing locally");
            }
        }
        self.invalidate(InvalidationReason::Logout)
    }

    /// Clears the in-memory and stored session. Concurrent triggers collapse
    /// into one transition; returns true only for the caller that performed
    /// it.
    pub fn invalidate(&self, reason: InvalidationReason) -> bool {
        if self
            .invalidating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(?reason, "auth: invalidation already in progress");
            return false;
        }

        let had_session = self.session.clear();
        if had_session {
            for key in [TOKEN_KEY, ISSUED_AT_KEY, PROFILE_KEY] {
                self.forget(key);
            }
            self.gateway.cache().clear();
            info!(?reason, "auth: session invalidated");
            self.publish(SessionEvent::PhaseChanged(SessionPhase::Anonymous));
            self.publish(SessionEvent::LoginRequired(reason));
        }

        self.invalidating.store(false, Ordering::Release);
        had_session
    }

    /// Invalidates on every credential rejection the gateway reports. Sign-in,
    /// sign-out and verification handle their own rejections.
    pub fn watch_auth_failures(self: &Arc<Self>) -> JoinHandle<()> {
        let mut failures = self.gateway.subscribe_auth_failures();
        let guard = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match failures.recv().await {
                    Ok(failure) => {
                        if [LOGIN_ENDPOINT, LOGOUT_ENDPOINT, VERIFY_ENDPOINT]
                            .contains(&failure.endpoint.as_str())
                        {
                            continue;
                        }
                        let Some(guard) = guard.upgrade() else {
                            break;
                        };
                        warn!(
                            endpoint = %failure.endpoint,
                            error = %failure.error,
                            "auth: credential rejected by server"
                        );
                        guard.invalidate(InvalidationReason::Rejected);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "auth: auth failure watcher lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("auth: auth failure watcher exiting");
        })
    }

    fn admit_verification(&self) -> bool {
        let mut last = self
            .last_verify
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        if let Some(previous) = *last {
            if now.duration_since(previous) < self.min_interval {
                debug!("auth: verification throttled");
                return false;
            }
        }
        *last = Some(now);
        true
    }

    async fn run_verification(&self, credential: Credential) -> VerifyOutcome {
        debug!("auth: verifying credential");
        match self.gateway.verify_credential().await {
            Ok(profile) => {
                let Some(previous) = self
                    .session
                    .mark_verified(&credential.token, profile.clone())
                else {
                    debug!("auth: credential replaced during verification");
                    return VerifyOutcome::Inconclusive(
                        "credential replaced during verification".into(),
                    );
                };
                self.persist_profile(&profile);
                if previous != SessionPhase::Verified {
                    self.publish(SessionEvent::PhaseChanged(SessionPhase::Verified));
                }
                info!(user = %profile.username, "auth: credential verified");
                VerifyOutcome::Verified(profile)
            }
            Err(err) if err.invalidates_session() => {
                warn!(error = %err, "auth: credential rejected during verification");
                if self.session.holds_token(&credential.token) {
                    self.invalidate(InvalidationReason::Rejected);
                }
                VerifyOutcome::Invalidated
            }
            Err(err) => {
                warn!(error = %err, "auth: verification inconclusive, keeping session");
                VerifyOutcome::Inconclusive(err.to_string())
            }
        }
    }

    fn persist_profile(&self, profile: &UserProfile) {
        match serde_json::to_string(profile) {
            Ok(raw) => self.persist(PROFILE_KEY, &raw),
            Err(err) => warn!(error = %err, "auth: failed to encode profile"),
        }
    }

    fn persist(&self, key: &str, value: &str) {
        if let Err(err) = self.store.set(key, value) {
            warn!(key, error = %err, "auth: failed to persist session key");
        }
    }

    fn forget(&self, key: &str) {
        if let Err(err) = self.store.remove(key) {
            warn!(key, error = %err, "auth: failed to remove stored session key");
        }
    }

    fn publish(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
