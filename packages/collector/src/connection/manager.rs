//! Protocol session lifecycle.
//!
//! [`ConnectionManager`] owns the authorized client handle and a small status
//! state machine:
//!
//! ```text
//! INITIALIZING --no session / rejected session--> UNAUTHORIZED
//! INITIALIZING --session accepted---------------> READY
//! INITIALIZING --session store unreadable-------> ERROR
//! UNAUTHORIZED --QR login saved + re-init-------> READY
//! ```
//!
//! Startup failures never escape [`ConnectionManager::init`]; they come back
//! as an [`InitOutcome`] so the process keeps running and waits for a login.

use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{CollectorError, ProtocolError, Result};
use crate::traits::protocol::{ClientFactory, LoginClientFactory, ProtocolClient};
use crate::traits::store::SessionStore;
use crate::types::Session;

/// Connection status visible to the rest of the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Initializing,
    Ready,
    Unauthorized,
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Initializing => "INITIALIZING",
            Self::Ready => "READY",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Error => "ERROR",
        })
    }
}

/// Why startup ended without an authorized client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnauthorizedReason {
    /// Nobody has logged in yet
    NoSession,
    /// A session was stored but could not be used
    SessionRejected(String),
}

/// Result of [`ConnectionManager::init`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    Ready,
    Unauthorized(UnauthorizedReason),
    /// The session store could not be read
    Error(String),
}

impl InitOutcome {
    pub fn status(&self) -> ConnectionStatus {
        match self {
            Self::Ready => ConnectionStatus::Ready,
            Self::Unauthorized(_) => ConnectionStatus::Unauthorized,
            Self::Error(_) => ConnectionStatus::Error,
        }
    }
}

/// Progress of a streamed QR login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginEvent {
    /// A fresh login URL to render as a QR code
    Token(String),
    /// Login finished and the connection is ready
    Ready,
    Cancelled,
    Failed(String),
}

impl LoginEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Token(_))
    }
}

struct ConnectionState {
    status: ConnectionStatus,
    client: Option<Arc<dyn ProtocolClient>>,
}

/// Owns the authorized protocol client and the QR login flow.
pub struct ConnectionManager {
    sessions: Arc<dyn SessionStore>,
    factory: Arc<dyn ClientFactory>,
    login_factory: Arc<dyn LoginClientFactory>,
    state: RwLock<ConnectionState>,
    /// Cancellation handle of the in-flight QR attempt, if any
    qr: Mutex<Option<CancellationToken>>,
}

fn lock_qr(qr: &Mutex<Option<CancellationToken>>) -> MutexGuard<'_, Option<CancellationToken>> {
    qr.lock().unwrap_or_else(|e| e.into_inner())
}

/// Clears the QR slot however the attempt ends.
struct QrGuard<'a> {
    qr: &'a Mutex<Option<CancellationToken>>,
}

impl Drop for QrGuard<'_> {
    fn drop(&mut self) {
        lock_qr(self.qr).take();
    }
}

impl ConnectionManager {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        factory: Arc<dyn ClientFactory>,
        login_factory: Arc<dyn LoginClientFactory>,
    ) -> Self {
        Self {
            sessions,
            factory,
            login_factory,
            state: RwLock::new(ConnectionState {
                status: ConnectionStatus::Initializing,
                client: None,
            }),
            qr: Mutex::new(None),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .status
    }

    /// The current authorized client.
    ///
    /// A handle obtained before a re-initialization keeps working or fails
    /// on its own; callers fetch a fresh one per call.
    pub fn client(&self) -> Option<Arc<dyn ProtocolClient>> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .client
            .clone()
    }

    fn set_status(&self, status: ConnectionStatus) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if state.status != status {
            debug!(from = %state.status, to = %status, "Connection status changed");
        }
        state.status = status;
    }

    /// Load the stored session and build an authorized client from it.
    pub async fn init(&self) -> InitOutcome {
        self.set_status(ConnectionStatus::Initializing);

        let session = match self.sessions.load_session().await {
            Ok(Some(session)) => session,
            Ok(None) => {
                info!("No stored session, waiting for QR login");
                self.set_status(ConnectionStatus::Unauthorized);
                return InitOutcome::Unauthorized(UnauthorizedReason::NoSession);
            }
            Err(e) => {
                error!(error = %e, "Failed to read stored session");
                self.set_status(ConnectionStatus::Error);
                return InitOutcome::Error(e.to_string());
            }
        };

        let rejected = |reason: String| {
            warn!(reason = %reason, "Stored session rejected, waiting for QR login");
            self.set_status(ConnectionStatus::Unauthorized);
            InitOutcome::Unauthorized(UnauthorizedReason::SessionRejected(reason))
        };

        let data = match session.decode() {
            Ok(data) => data,
            Err(e) => return rejected(e.to_string()),
        };

        match self.factory.connect(&data).await {
            Ok(client) => {
                let previous = {
                    let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
                    state.status = ConnectionStatus::Ready;
                    state.client.replace(client)
                };
                if let Some(previous) = previous {
                    previous.stop().await;
                }
                info!(dc_id = data.dc_id, "Connection ready");
                InitOutcome::Ready
            }
            Err(e) => rejected(e.to_string()),
        }
    }

    pub fn is_qr_in_progress(&self) -> bool {
        lock_qr(&self.qr).is_some()
    }

    /// Run a QR login.
    ///
    /// `on_token` receives each login URL as it is issued. On success the
    /// session is persisted and [`init`](Self::init) re-runs; the call fails
    /// if that does not reach READY. Cancellation through `cancel` or
    /// [`cancel_qr`](Self::cancel_qr) yields [`CollectorError::LoginCancelled`].
    pub async fn start_qr<F>(&self, cancel: &CancellationToken, on_token: F) -> Result<()>
    where
        F: Fn(&str) + Send + Sync,
    {
        if self.status() == ConnectionStatus::Ready {
            return Err(CollectorError::AlreadyLoggedIn);
        }

        let qr_cancel = {
            let mut slot = lock_qr(&self.qr);
            if slot.is_some() {
                return Err(CollectorError::LoginInProgress);
            }
            let token = cancel.child_token();
            *slot = Some(token.clone());
            token
        };
        let _guard = QrGuard { qr: &self.qr };

        info!("Starting QR login");

        let data = tokio::select! {
            biased;
            _ = qr_cancel.cancelled() => None,
            outcome = self.authorize(&qr_cancel, &on_token) => Some(outcome),
        };
        let data = match data {
            None | Some(Err(ProtocolError::Cancelled)) => {
                info!("QR login cancelled");
                return Err(CollectorError::LoginCancelled);
            }
            Some(Err(_)) if qr_cancel.is_cancelled() => {
                info!("QR login cancelled");
                return Err(CollectorError::LoginCancelled);
            }
            Some(Err(e)) => {
                warn!(error = %e, "QR login failed");
                return Err(e.into());
            }
            Some(Ok(data)) => data,
        };

        let session = Session::from_data(&data)?;
        self.sessions.save_session(&session).await?;
        info!(dc_id = data.dc_id, "QR login succeeded, session saved");

        match self.init().await {
            InitOutcome::Ready => Ok(()),
            InitOutcome::Unauthorized(reason) => Err(CollectorError::Protocol(
                ProtocolError::Unauthorized(format!("session not accepted after login: {reason:?}")),
            )),
            InitOutcome::Error(cause) => Err(CollectorError::Storage(cause.into())),
        }
    }

    async fn authorize(
        &self,
        cancel: &CancellationToken,
        on_token: &(dyn Fn(&str) + Send + Sync),
    ) -> std::result::Result<crate::types::SessionData, ProtocolError> {
        let client = self.login_factory.create().await?;
        client
            .authorize(cancel, &|url: &str| {
                info!(url = %url, "QR login token issued");
                on_token(url);
            })
            .await
    }

    /// Cancel the in-flight QR attempt. Returns whether one was running.
    pub fn cancel_qr(&self) -> bool {
        match lock_qr(&self.qr).as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Run a QR login in the background and stream its progress.
    ///
    /// Yields [`LoginEvent::Token`] for each URL, then exactly one terminal
    /// event.
    pub fn login_events(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> impl Stream<Item = LoginEvent> + Send + 'static {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Arc::clone(self);

        tokio::spawn(async move {
            let token_tx = tx.clone();
            let outcome = manager
                .start_qr(&cancel, move |url| {
                    let _ = token_tx.send(LoginEvent::Token(url.to_string()));
                })
                .await;

            let terminal = match outcome {
                Ok(()) => LoginEvent::Ready,
                Err(CollectorError::LoginCancelled) => LoginEvent::Cancelled,
                Err(e) => LoginEvent::Failed(e.to_string()),
            };
            let _ = tx.send(terminal);
        });

        UnboundedReceiverStream::new(rx)
    }

    /// Disconnect the current client. Status is left unchanged.
    pub async fn stop(&self) {
        let client = self
            .state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .client
            .take();
        if let Some(client) = client {
            client.stop().await;
            info!("Connection stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::MemoryStore;
    use crate::testing::{sample_session_data, MockClientFactory, MockLoginFactory, MockProtocolClient};
    use crate::traits::store::MockSessionStore;
    use futures::StreamExt;
    use std::time::Duration;

    fn stored_session() -> Session {
        Session::from_data(&sample_session_data()).unwrap()
    }

    fn manager(
        store: Arc<dyn SessionStore>,
        factory: MockClientFactory,
        login: MockLoginFactory,
    ) -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager::new(store, Arc::new(factory), Arc::new(login)))
    }

    async fn wait_for_qr(manager: &ConnectionManager) {
        for _ in 0..100 {
            if manager.is_qr_in_progress() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("QR login never started");
    }

    #[tokio::test]
    async fn starts_initializing() {
        let m = manager(
            Arc::new(MemoryStore::new()),
            MockClientFactory::connecting(Arc::new(MockProtocolClient::new())),
            MockLoginFactory::pending(vec![]),
        );
        assert_eq!(m.status(), ConnectionStatus::Initializing);
        assert!(m.client().is_none());
    }

    #[tokio::test]
    async fn init_without_session_is_unauthorized() {
        let m = manager(
            Arc::new(MemoryStore::new()),
            MockClientFactory::connecting(Arc::new(MockProtocolClient::new())),
            MockLoginFactory::pending(vec![]),
        );
        assert_eq!(
            m.init().await,
            InitOutcome::Unauthorized(UnauthorizedReason::NoSession)
        );
        assert_eq!(m.status(), ConnectionStatus::Unauthorized);
    }

    #[tokio::test]
    async fn init_with_rejected_session_is_unauthorized() {
        let factory = MockClientFactory::failing(ProtocolError::Unauthorized("AUTH_KEY_UNREGISTERED".into()));
        let m = manager(
            Arc::new(MemoryStore::with_session(stored_session())),
            factory,
            MockLoginFactory::pending(vec![]),
        );
        let outcome = m.init().await;
        assert!(matches!(
            outcome,
            InitOutcome::Unauthorized(UnauthorizedReason::SessionRejected(_))
        ));
        assert_eq!(m.status(), ConnectionStatus::Unauthorized);
        assert!(m.client().is_none());
    }

    #[tokio::test]
    async fn init_with_corrupt_session_is_unauthorized() {
        let store = MemoryStore::with_session(Session {
            version: 1,
            data: b"garbage".to_vec(),
        });
        let m = manager(
            Arc::new(store),
            MockClientFactory::connecting(Arc::new(MockProtocolClient::new())),
            MockLoginFactory::pending(vec![]),
        );
        assert_eq!(m.init().await.status(), ConnectionStatus::Unauthorized);
    }

    #[tokio::test]
    async fn init_with_valid_session_is_ready() {
        let client = Arc::new(MockProtocolClient::new());
        let factory = MockClientFactory::connecting(client);
        let m = manager(
            Arc::new(MemoryStore::with_session(stored_session())),
            factory.clone(),
            MockLoginFactory::pending(vec![]),
        );
        assert_eq!(m.init().await, InitOutcome::Ready);
        assert_eq!(m.status(), ConnectionStatus::Ready);
        assert!(m.client().is_some());
        assert_eq!(factory.connect_count(), 1);
    }

    #[tokio::test]
    async fn unreadable_store_moves_to_error() {
        let mut store = MockSessionStore::new();
        store
            .expect_load_session()
            .returning(|| Err(CollectorError::Storage("connection refused".into())));
        let m = manager(
            Arc::new(store),
            MockClientFactory::connecting(Arc::new(MockProtocolClient::new())),
            MockLoginFactory::pending(vec![]),
        );
        assert!(matches!(m.init().await, InitOutcome::Error(_)));
        assert_eq!(m.status(), ConnectionStatus::Error);
    }

    #[tokio::test]
    async fn qr_login_saves_session_and_becomes_ready() {
        let store = Arc::new(MemoryStore::new());
        let m = manager(
            store.clone(),
            MockClientFactory::connecting(Arc::new(MockProtocolClient::new())),
            MockLoginFactory::succeeding(
                vec!["tg://login?token=a".into(), "tg://login?token=b".into()],
                sample_session_data(),
            ),
        );
        m.init().await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        m.start_qr(&CancellationToken::new(), move |url| {
            sink.lock().unwrap().push(url.to_string());
        })
        .await
        .unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["tg://login?token=a", "tg://login?token=b"]
        );
        assert_eq!(m.status(), ConnectionStatus::Ready);
        assert!(!m.is_qr_in_progress());
        let saved = store.load_session().await.unwrap().unwrap();
        assert_eq!(saved.decode().unwrap(), sample_session_data());
    }

    #[tokio::test]
    async fn qr_rejected_when_ready() {
        let m = manager(
            Arc::new(MemoryStore::with_session(stored_session())),
            MockClientFactory::connecting(Arc::new(MockProtocolClient::new())),
            MockLoginFactory::succeeding(vec![], sample_session_data()),
        );
        m.init().await;
        assert!(matches!(
            m.start_qr(&CancellationToken::new(), |_| {}).await,
            Err(CollectorError::AlreadyLoggedIn)
        ));
    }

    #[tokio::test]
    async fn concurrent_qr_is_rejected_and_cancel_clears_state() {
        let m = manager(
            Arc::new(MemoryStore::new()),
            MockClientFactory::connecting(Arc::new(MockProtocolClient::new())),
            MockLoginFactory::pending(vec!["tg://login?token=x".into()]),
        );
        m.init().await;

        let first = {
            let m = m.clone();
            tokio::spawn(async move { m.start_qr(&CancellationToken::new(), |_| {}).await })
        };
        wait_for_qr(&m).await;

        assert!(matches!(
            m.start_qr(&CancellationToken::new(), |_| {}).await,
            Err(CollectorError::LoginInProgress)
        ));

        assert!(m.cancel_qr());
        let outcome = first.await.unwrap();
        assert!(matches!(outcome, Err(CollectorError::LoginCancelled)));
        assert!(!m.is_qr_in_progress());
        assert!(!m.cancel_qr());
        assert_eq!(m.status(), ConnectionStatus::Unauthorized);
    }

    #[tokio::test]
    async fn caller_token_cancels_qr() {
        let m = manager(
            Arc::new(MemoryStore::new()),
            MockClientFactory::connecting(Arc::new(MockProtocolClient::new())),
            MockLoginFactory::pending(vec![]),
        );
        let cancel = CancellationToken::new();
        let task = {
            let m = m.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { m.start_qr(&cancel, |_| {}).await })
        };
        wait_for_qr(&m).await;
        cancel.cancel();
        assert!(matches!(
            task.await.unwrap(),
            Err(CollectorError::LoginCancelled)
        ));
        assert!(!m.is_qr_in_progress());
    }

    #[tokio::test]
    async fn failed_qr_surfaces_error_and_clears_state() {
        let m = manager(
            Arc::new(MemoryStore::new()),
            MockClientFactory::connecting(Arc::new(MockProtocolClient::new())),
            MockLoginFactory::failing(ProtocolError::Rpc("PASSWORD_REQUIRED".into())),
        );
        let err = m
            .start_qr(&CancellationToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, CollectorError::Protocol(ProtocolError::Rpc(_))));
        assert!(!m.is_qr_in_progress());
    }

    #[tokio::test]
    async fn qr_fails_when_new_session_is_not_accepted() {
        let m = manager(
            Arc::new(MemoryStore::new()),
            MockClientFactory::failing(ProtocolError::Unauthorized("AUTH_KEY_INVALID".into())),
            MockLoginFactory::succeeding(vec![], sample_session_data()),
        );
        assert!(m.start_qr(&CancellationToken::new(), |_| {}).await.is_err());
        assert_eq!(m.status(), ConnectionStatus::Unauthorized);
    }

    #[tokio::test]
    async fn login_events_stream_tokens_then_terminal() {
        let m = manager(
            Arc::new(MemoryStore::new()),
            MockClientFactory::connecting(Arc::new(MockProtocolClient::new())),
            MockLoginFactory::succeeding(vec!["tg://login?token=1".into()], sample_session_data()),
        );
        let events: Vec<LoginEvent> = m.login_events(CancellationToken::new()).collect().await;
        assert_eq!(
            events,
            vec![LoginEvent::Token("tg://login?token=1".into()), LoginEvent::Ready]
        );
    }

    #[tokio::test]
    async fn login_events_report_cancellation() {
        let m = manager(
            Arc::new(MemoryStore::new()),
            MockClientFactory::connecting(Arc::new(MockProtocolClient::new())),
            MockLoginFactory::pending(vec![]),
        );
        let cancel = CancellationToken::new();
        let stream = m.login_events(cancel.clone());
        wait_for_qr(&m).await;
        cancel.cancel();
        let events: Vec<LoginEvent> = stream.collect().await;
        assert_eq!(events, vec![LoginEvent::Cancelled]);
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_keeps_status() {
        let client = Arc::new(MockProtocolClient::new());
        let m = manager(
            Arc::new(MemoryStore::with_session(stored_session())),
            MockClientFactory::connecting(client.clone()),
            MockLoginFactory::pending(vec![]),
        );
        m.stop().await;
        m.init().await;
        m.stop().await;
        m.stop().await;
        assert!(client.is_stopped());
        assert!(m.client().is_none());
        assert_eq!(m.status(), ConnectionStatus::Ready);
    }
}
