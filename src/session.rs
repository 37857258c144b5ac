//! Session lifecycle
//!
//! Opens and closes authenticated sessions and keeps them alive with a
//! supervised heartbeat task. The client holds at most one active
//! session and its token rides in every RPC header, so open and close
//! are serialized through a typed state machine: illegal transitions
//! fail with [`Error::AlreadyOpen`] / [`Error::NotOpen`] instead of
//! corrupting authorization.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::transport::{map_rpc_error, CallContext, LedgerRpc};

/// An authenticated session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Server-assigned session id
    pub id: String,

    /// Opaque auth token sent on every RPC
    pub token: String,

    /// UUID of the server deployment that issued the session
    pub server_uuid: String,
}

/// Session lifecycle states.
///
/// `Opening` and `Closing` are held only across the login/logout RPC;
/// any call arriving meanwhile sees an illegal transition.
enum SessionState {
    Closed,
    Opening,
    Open(OpenSession),
    Closing,
}

struct OpenSession {
    session: Session,
    keepalive_shutdown: watch::Sender<bool>,
    keepalive_task: JoinHandle<()>,
}

/// Opens, keeps alive, and closes the client's session.
pub struct SessionManager {
    state: Mutex<SessionState>,
    heartbeat_interval: Duration,
    rpc_timeout: Duration,
}

impl SessionManager {
    /// Create a manager in the closed state.
    pub fn new(heartbeat_interval: Duration, rpc_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(SessionState::Closed),
            heartbeat_interval,
            rpc_timeout,
        }
    }

    /// Whether a session is currently open.
    pub async fn is_open(&self) -> bool {
        matches!(*self.state.lock().await, SessionState::Open(_))
    }

    /// Snapshot of the active session.
    pub async fn current(&self) -> Result<Session> {
        match &*self.state.lock().await {
            SessionState::Open(open) => Ok(open.session.clone()),
            _ => Err(Error::NotOpen),
        }
    }

    /// Issue the login RPC and transition `Closed → Open`.
    ///
    /// Spawns the keepalive loop on success. Fails with `AlreadyOpen`
    /// when a session exists or another open/close is in flight.
    pub async fn open(
        &self,
        rpc: &Arc<dyn LedgerRpc>,
        user: &[u8],
        password: &[u8],
        db: &str,
    ) -> Result<Session> {
        {
            let mut state = self.state.lock().await;
            match *state {
                SessionState::Closed => *state = SessionState::Opening,
                SessionState::Opening | SessionState::Open(_) | SessionState::Closing => {
                    return Err(Error::AlreadyOpen)
                }
            }
        }
        let guard = ResetGuard { manager: self };

        let ctx = CallContext::default().deadline_in(self.rpc_timeout);
        let result = rpc.open_session(&ctx, user, password, db).await;

        let mut state = self.state.lock().await;
        guard.disarm();
        match result {
            Ok(resp) => {
                let session = Session {
                    id: resp.session_id,
                    token: resp.token,
                    server_uuid: resp.server_uuid,
                };
                let (shutdown, task) = spawn_keepalive(
                    Arc::clone(rpc),
                    session.token.clone(),
                    self.heartbeat_interval,
                    self.rpc_timeout,
                );
                debug!(session_id = %session.id, db, "session opened");
                *state = SessionState::Open(OpenSession {
                    session: session.clone(),
                    keepalive_shutdown: shutdown,
                    keepalive_task: task,
                });
                Ok(session)
            }
            Err(e) => {
                *state = SessionState::Closed;
                Err(map_rpc_error(e))
            }
        }
    }

    /// Stop the keepalive loop, invalidate the token, and transition to
    /// `Closed`.
    ///
    /// The keepalive task is awaited before the logout RPC so no
    /// heartbeat races the token invalidation.
    pub async fn close(&self, rpc: &Arc<dyn LedgerRpc>) -> Result<()> {
        let open = {
            let mut state = self.state.lock().await;
            match std::mem::replace(&mut *state, SessionState::Closing) {
                SessionState::Open(open) => open,
                other => {
                    *state = other;
                    return Err(Error::NotOpen);
                }
            }
        };
        let guard = ResetGuard { manager: self };

        let _ = open.keepalive_shutdown.send(true);
        if let Err(e) = open.keepalive_task.await {
            warn!(error = %e, "keepalive task did not shut down cleanly");
        }

        let ctx =
            CallContext::with_token(open.session.token.clone()).deadline_in(self.rpc_timeout);
        let result = rpc.close_session(&ctx).await;

        *self.state.lock().await = SessionState::Closed;
        guard.disarm();
        debug!(session_id = %open.session.id, "session closed");
        result.map_err(map_rpc_error)
    }
}

/// Resets an interrupted `Opening`/`Closing` transition back to `Closed`.
struct ResetGuard<'a> {
    manager: &'a SessionManager,
}

impl ResetGuard<'_> {
    fn disarm(self) {
        std::mem::forget(self);
    }
}

impl Drop for ResetGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.manager.state.try_lock() {
            if matches!(*state, SessionState::Opening | SessionState::Closing) {
                *state = SessionState::Closed;
            }
        }
    }
}

fn spawn_keepalive(
    rpc: Arc<dyn LedgerRpc>,
    token: String,
    interval: Duration,
    rpc_timeout: Duration,
) -> (watch::Sender<bool>, JoinHandle<()>) {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let ctx = CallContext::with_token(token.clone()).deadline_in(rpc_timeout);
                    // heartbeat failures are logged and retried next tick;
                    // the next user RPC surfaces the real error
                    if let Err(e) = rpc.keep_alive(&ctx).await {
                        warn!(error = %e, "session keepalive failed");
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("keepalive loop terminated");
    });

    (shutdown_tx, task)
}
