//! Leader elector: acquires, renews and releases the lease, and gates the
//! engine on holding it.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use wpo_store::{ObjectRef, ResourceStore};

use crate::error::LeaderResult;
use crate::lease::{LeaseConfig, LeaseRecord, lease_kind};

/// Where this process stands in the election.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    Candidate,
    Leader,
    /// Lost or gave up the lease. Terminal.
    NotLeader,
}

/// Why [`LeaderElector::gate`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderExit {
    /// Cancelled before leadership was acquired; the engine never ran.
    Cancelled,
    /// The engine returned on its own and the lease was released.
    EngineStopped,
    /// Renewal failed for longer than the renew deadline. The engine was
    /// cancelled but may still be unwinding.
    LostLease,
}

pub struct LeaderElector {
    store: Arc<dyn ResourceStore>,
    lease: ObjectRef,
    config: LeaseConfig,
    identity: String,
    state: watch::Sender<LeaderState>,
}

impl LeaderElector {
    /// Elector for the lease in `config.namespace`, or in `namespace` when
    /// the config names none. The identity is a fresh UUID.
    pub fn new(store: Arc<dyn ResourceStore>, namespace: &str, config: LeaseConfig) -> LeaderResult<Self> {
        config.validate()?;
        let lease_namespace = config.namespace.as_deref().unwrap_or(namespace);
        let lease = ObjectRef::namespaced(lease_kind(), lease_namespace, &config.lock_name);
        let (state, _) = watch::channel(LeaderState::Candidate);
        Ok(Self {
            store,
            lease,
            config,
            identity: Uuid::new_v4().to_string(),
            state,
        })
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn lease_ref(&self) -> &ObjectRef {
        &self.lease
    }

    pub fn state(&self) -> LeaderState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LeaderState> {
        self.state.subscribe()
    }

    pub async fn try_acquire_or_renew(&self) -> LeaderResult<bool> {
        self.try_acquire_or_renew_at(Utc::now()).await
    }

    /// One election round at wall-clock time `now`. Returns whether this
    /// process holds the lease afterwards. Losing a write race is not an
    /// error.
    pub async fn try_acquire_or_renew_at(&self, now: DateTime<Utc>) -> LeaderResult<bool> {
        let duration = i64::try_from(self.config.lease_duration_secs).unwrap_or(i64::MAX);
        let current = match self.store.get(&self.lease).await {
            Ok(current) => current,
            Err(e) if e.is_not_found() => {
                let record = LeaseRecord {
                    holder: Some(self.identity.clone()),
                    lease_duration_secs: duration,
                    acquire_time: Some(now),
                    renew_time: Some(now),
                    transitions: 0,
                };
                return match self.store.create(&record.to_object(&self.lease)?).await {
                    Ok(_) => {
                        info!(lease = %self.lease, identity = %self.identity, "lease created");
                        Ok(true)
                    }
                    Err(e) if e.is_conflict() => {
                        debug!(lease = %self.lease, "lost lease creation race");
                        Ok(false)
                    }
                    Err(e) => Err(e.into()),
                };
            }
            Err(e) => return Err(e.into()),
        };

        let existing = LeaseRecord::from_object(&current)?;
        let renewing = existing.is_held_by(&self.identity);
        if !renewing && !existing.is_free_at(now) {
            debug!(lease = %self.lease, holder = ?existing.holder, "lease held elsewhere");
            return Ok(false);
        }

        let record = if renewing {
            LeaseRecord {
                lease_duration_secs: duration,
                renew_time: Some(now),
                ..existing.clone()
            }
        } else {
            LeaseRecord {
                holder: Some(self.identity.clone()),
                lease_duration_secs: duration,
                acquire_time: Some(now),
                renew_time: Some(now),
                transitions: existing.transitions + 1,
            }
        };
        match self.store.replace(&record.apply_to(&current)?).await {
            Ok(_) => {
                if renewing {
                    debug!(lease = %self.lease, "lease renewed");
                } else {
                    info!(
                        lease = %self.lease,
                        identity = %self.identity,
                        previous = ?existing.holder,
                        transitions = record.transitions,
                        "lease taken over"
                    );
                }
                Ok(true)
            }
            Err(e) if e.is_conflict() => {
                debug!(lease = %self.lease, "lease changed underneath");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Give the lease up so another candidate can take it at once.
    pub async fn release(&self) -> LeaderResult<()> {
        let current = match self.store.get(&self.lease).await {
            Ok(current) => current,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let existing = LeaseRecord::from_object(&current)?;
        if !existing.is_held_by(&self.identity) {
            return Ok(());
        }
        let now = Utc::now();
        let record = LeaseRecord {
            holder: None,
            lease_duration_secs: 1,
            acquire_time: Some(now),
            renew_time: Some(now),
            transitions: existing.transitions,
        };
        match self.store.replace(&record.apply_to(&current)?).await {
            Ok(_) => {
                info!(lease = %self.lease, "lease released");
                Ok(())
            }
            Err(e) if e.is_conflict() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// One round bounded by the renew deadline. Errors count as a failed
    /// round.
    async fn attempt(&self) -> bool {
        match tokio::time::timeout(self.config.renew_deadline(), self.try_acquire_or_renew()).await {
            Ok(Ok(held)) => held,
            Ok(Err(e)) => {
                warn!(lease = %self.lease, error = %e, "leader election round failed");
                false
            }
            Err(_) => {
                warn!(lease = %self.lease, "leader election round timed out");
                false
            }
        }
    }

    /// Retry until the lease is held. Returns false if cancelled first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> bool {
        info!(lease = %self.lease, identity = %self.identity, "waiting for leadership");
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            if self.attempt().await {
                self.state.send_replace(LeaderState::Leader);
                info!(lease = %self.lease, identity = %self.identity, "became leader");
                return true;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.config.retry_period()) => {}
            }
        }
    }

    /// Renew every retry period. Returns true when no renewal succeeded
    /// within the renew deadline, false if cancelled first.
    pub async fn hold(&self, cancel: &CancellationToken) -> bool {
        let mut last_renewal = Instant::now();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.config.retry_period()) => {}
            }
            if self.attempt().await {
                last_renewal = Instant::now();
            } else if last_renewal.elapsed() >= self.config.renew_deadline() {
                self.state.send_replace(LeaderState::NotLeader);
                error!(
                    lease = %self.lease,
                    identity = %self.identity,
                    since_renewal = ?last_renewal.elapsed(),
                    "lost leadership"
                );
                return true;
            }
        }
    }

    /// Run `engine` only while holding the lease.
    ///
    /// The engine receives a token that is cancelled when `cancel` is, or
    /// when the lease is lost. On [`LeaderExit::LostLease`] the caller
    /// should terminate the process.
    pub async fn gate<F, Fut>(&self, cancel: &CancellationToken, engine: F) -> LeaderExit
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()>,
    {
        if !self.acquire(cancel).await {
            info!(lease = %self.lease, "cancelled before leadership");
            return LeaderExit::Cancelled;
        }

        let engine_cancel = cancel.child_token();
        let engine = engine(engine_cancel.clone());
        tokio::pin!(engine);

        let lost = tokio::select! {
            () = &mut engine => None,
            lost = self.hold(&engine_cancel) => Some(lost),
        };
        match lost {
            Some(true) => {
                engine_cancel.cancel();
                return LeaderExit::LostLease;
            }
            Some(false) => engine.await,
            None => {}
        }

        if let Err(e) = self.release().await {
            warn!(lease = %self.lease, error = %e, "cannot release lease");
        }
        self.state.send_replace(LeaderState::NotLeader);
        LeaderExit::EngineStopped
    }
}
