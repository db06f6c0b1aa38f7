//! SessionGuard: broker authentication with single-flight re-login
//!
//! When a classified auth error surfaces, exactly one caller re-logs in
//! while everyone else waits for the completion event (bounded at 30s),
//! then each caller retries its operation exactly once. Retry depth is 1:
//! a post-relogin failure propagates.

use crate::api::{BrokerApi, SessionToken};
use neodip_core::config::Credentials;
use neodip_core::errors::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

/// How long a non-leader waits for someone else's re-login to finish
const REAUTH_WAIT: Duration = Duration::from_secs(30);

pub struct SessionGuard {
    broker: Arc<dyn BrokerApi>,
    credentials: Credentials,
    /// Shared with the HTTP client, which reads it per request
    token: Arc<RwLock<Option<SessionToken>>>,
    /// Leader election for re-login: whoever gets the try-lock logs in
    reauth_mu: Mutex<()>,
    /// Completion event; the payload is a generation counter so waiters can
    /// tell a re-login that finished after their failure from one that
    /// finished before it
    reauth_done: watch::Sender<u64>,
}

impl SessionGuard {
    pub fn new(
        broker: Arc<dyn BrokerApi>,
        credentials: Credentials,
        token: Arc<RwLock<Option<SessionToken>>>,
    ) -> Self {
        let (reauth_done, _) = watch::channel(0);
        Self {
            broker,
            credentials,
            token,
            reauth_mu: Mutex::new(()),
            reauth_done,
        }
    }

    /// Current session id, if logged in (cache keys, logging)
    pub async fn session_id(&self) -> Option<String> {
        self.token.read().await.as_ref().map(|t| t.session_id.clone())
    }

    /// Initial login at startup
    pub async fn login(&self) -> Result<()> {
        let session = self.broker.login(&self.credentials).await?;
        info!("Broker session established ({})", session.session_id);
        *self.token.write().await = Some(session);
        Ok(())
    }

    /// Run `op` under the current session. On a classified auth error,
    /// coordinate a single re-login across concurrent callers and retry
    /// `op` exactly once.
    pub async fn with_auth<T, F, Fut>(&self, op: &F) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
    {
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_auth() => e,
            Err(e) => return Err(e),
        };
        warn!("Auth error observed, coordinating re-login: {}", err);

        // generation read before the try-lock: if a re-login completes
        // between here and the wait, the counter moves and the waiter
        // proceeds immediately
        let observed_gen = *self.reauth_done.borrow();

        match self.reauth_mu.try_lock() {
            Ok(_leader) => {
                debug!("Re-login leader elected");
                match self.relogin().await {
                    Ok(()) => {
                        self.reauth_done.send_modify(|g| *g += 1);
                    }
                    Err(login_err) => {
                        warn!("Re-login failed: {}", login_err);
                        return Err(login_err);
                    }
                }
            }
            Err(_) => {
                debug!("Re-login in progress elsewhere, waiting");
                if !self.wait_for_relogin(observed_gen).await {
                    return Err(err);
                }
            }
        }

        op().await
    }

    async fn relogin(&self) -> Result<()> {
        let session = self.broker.login(&self.credentials).await?;
        info!("Re-login succeeded ({})", session.session_id);
        *self.token.write().await = Some(session);
        Ok(())
    }

    /// Wait for the completion event, bounded. Returns false on timeout.
    async fn wait_for_relogin(&self, observed_gen: u64) -> bool {
        let mut rx = self.reauth_done.subscribe();
        let deadline = tokio::time::Instant::now() + REAUTH_WAIT;
        loop {
            if *rx.borrow_and_update() > observed_gen {
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                // sender dropped or deadline hit
                _ => return *rx.borrow() > observed_gen,
            }
        }
    }
}
