use std::{sync::Arc, time::Duration};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use shared::domain::UserId;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{
    api::KeyIssuer, crypto::PrivateKeyPem, error::RefreshError, key_store::KeyStore, ClientEvent,
};

pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshOptions {
    /// Ask the issuer for a brand new key pair instead of the current one.
    pub force_regenerate: bool,
    /// Suppress user-facing notifications for this caller.
    pub silent: bool,
}

impl RefreshOptions {
    pub fn silent() -> Self {
        Self {
            force_regenerate: false,
            silent: true,
        }
    }

    pub fn regenerate() -> Self {
        Self {
            force_regenerate: true,
            silent: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshCycle {
    NotStarted,
    InFlight { notified: bool },
    Succeeded,
    Failed { reason: String },
}

type SharedRefresh = Shared<BoxFuture<'static, Result<PrivateKeyPem, RefreshError>>>;

struct CoordinatorState {
    cycle: RefreshCycle,
    in_flight: Option<SharedRefresh>,
    completed_cycles: u64,
}

struct CoordinatorInner {
    issuer: Arc<dyn KeyIssuer>,
    key_store: KeyStore,
    events: broadcast::Sender<ClientEvent>,
    timeout: Duration,
    state: Mutex<CoordinatorState>,
}

/// Ensures at most one key refresh runs at a time. Every caller that arrives
/// while a refresh is running awaits the same outcome.
#[derive(Clone)]
pub struct KeyRefreshCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl KeyRefreshCoordinator {
    pub fn new(
        issuer: Arc<dyn KeyIssuer>,
        key_store: KeyStore,
        events: broadcast::Sender<ClientEvent>,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                issuer,
                key_store,
                events,
                timeout,
                state: Mutex::new(CoordinatorState {
                    cycle: RefreshCycle::NotStarted,
                    in_flight: None,
                    completed_cycles: 0,
                }),
            }),
        }
    }

    /// Returns the refreshed key, or `None` when no usable key could be
    /// obtained. On failure the previously stored key (if any) is left in
    /// place.
    pub async fn refresh(&self, user_id: &UserId, options: RefreshOptions) -> Option<PrivateKeyPem> {
        let flight = {
            let mut state = self.inner.state.lock().await;
            match state.in_flight.clone() {
                Some(flight) => {
                    debug!(user_id = %user_id, "keys: joining in-flight refresh");
                    if !options.silent {
                        if let RefreshCycle::InFlight { notified } = &mut state.cycle {
                            if !*notified {
                                *notified = true;
                                let _ = self.inner.events.send(ClientEvent::KeyRefreshStarted);
                            }
                        }
                    }
                    flight
                }
                None => {
                    info!(
                        user_id = %user_id,
                        force_regenerate = options.force_regenerate,
                        "keys: starting key refresh"
                    );
                    state.cycle = RefreshCycle::InFlight {
                        notified: !options.silent,
                    };
                    if !options.silent {
                        let _ = self.inner.events.send(ClientEvent::KeyRefreshStarted);
                    }
                    // Spawned so the cycle completes and clears its slot
                    // even if every waiting caller is cancelled.
                    let task = tokio::spawn(
                        Arc::clone(&self.inner)
                            .run_cycle(user_id.clone(), options.force_regenerate),
                    );
                    let flight = async move {
                        task.await.unwrap_or_else(|err| {
                            Err(RefreshError::Issuer(format!("refresh task aborted: {err}")))
                        })
                    }
                    .boxed()
                    .shared();
                    state.in_flight = Some(flight.clone());
                    flight
                }
            }
        };

        flight.await.ok()
    }

    pub async fn cycle(&self) -> RefreshCycle {
        self.inner.state.lock().await.cycle.clone()
    }

    pub async fn completed_cycles(&self) -> u64 {
        self.inner.state.lock().await.completed_cycles
    }
}

impl CoordinatorInner {
    async fn run_cycle(
        self: Arc<Self>,
        user_id: UserId,
        force_regenerate: bool,
    ) -> Result<PrivateKeyPem, RefreshError> {
        let previous = match self.key_store.get(&user_id).await {
            Ok(previous) => previous,
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "keys: could not read current key before refresh");
                None
            }
        };
        if force_regenerate && previous.is_some() {
            if let Err(err) = self.key_store.clear(&user_id).await {
                warn!(user_id = %user_id, error = %err, "keys: could not clear key before regeneration");
            }
        }

        let outcome = self.obtain_key(force_regenerate).await;
        let outcome = match outcome {
            Ok(key) => {
                if let Err(err) = self.key_store.store(&user_id, &key).await {
                    warn!(user_id = %user_id, error = %err, "keys: refreshed key could not be persisted");
                }
                Ok(key)
            }
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "keys: key refresh failed");
                if let Some(previous) = &previous {
                    match self.key_store.store(&user_id, previous).await {
                        Ok(()) => info!(user_id = %user_id, "keys: previous key restored"),
                        Err(restore_err) => warn!(
                            user_id = %user_id,
                            error = %restore_err,
                            "keys: failed to restore previous key"
                        ),
                    }
                }
                Err(err)
            }
        };

        let mut state = self.state.lock().await;
        let notified = matches!(state.cycle, RefreshCycle::InFlight { notified: true });
        state.in_flight = None;
        state.completed_cycles += 1;
        state.cycle = match &outcome {
            Ok(_) => RefreshCycle::Succeeded,
            Err(err) => RefreshCycle::Failed {
                reason: err.to_string(),
            },
        };
        if notified {
            let event = match &outcome {
                Ok(_) => ClientEvent::KeyRefreshed,
                Err(err) => ClientEvent::KeyUnavailable {
                    reason: err.to_string(),
                },
            };
            let _ = self.events.send(event);
        }
        outcome
    }

    async fn obtain_key(&self, force_regenerate: bool) -> Result<PrivateKeyPem, RefreshError> {
        let issued =
            tokio::time::timeout(self.timeout, self.issuer.fetch_private_key(force_regenerate))
                .await
                .map_err(|_| RefreshError::TimedOut(self.timeout))?
                .map_err(|err| RefreshError::Issuer(format!("{err:#}")))?;

        let key = issued
            .filter(|text| !text.trim().is_empty())
            .map(PrivateKeyPem::new)
            .ok_or(RefreshError::Unavailable)?;
        self.key_store.parse(&key)?;
        Ok(key)
    }
}

#[cfg(test)]
#[path = "tests/key_refresh_tests.rs"]
mod tests;
