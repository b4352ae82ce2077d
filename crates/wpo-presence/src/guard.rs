//! Existence guard: keeps one declared object present in the store.
//!
//! The `ExistenceGuard` creates its object at start and runs a background
//! watch task for the object's identity. When the object is marked for
//! deletion the task polls until it is really gone, then recreates it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use wpo_store::{EventType, ManagedObject, ResourceStore};

use crate::error::{GuardError, GuardResult};

/// How long to wait for a marked object to disappear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecreatePolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for RecreatePolicy {
    fn default() -> Self {
        Self {
            attempts: 30,
            interval: Duration::from_secs(1),
        }
    }
}

/// Outcome of an existence check that may have written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ensured {
    /// The object was already there.
    Present,
    /// The object was missing and has been created.
    Created,
    /// The guard is stopped; nothing was done.
    Stopped,
}

/// Observable lifecycle of a guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    Idle,
    Creating,
    Watching,
    Draining,
    Stopped,
}

/// Guarantees that one object exists for as long as the guard runs.
pub struct ExistenceGuard {
    store: Arc<dyn ResourceStore>,
    object: ManagedObject,
    policy: RecreatePolicy,
    /// Held for the whole duration of an `ensure_exists()` call.
    busy: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl ExistenceGuard {
    pub fn new(store: Arc<dyn ResourceStore>, object: ManagedObject) -> Self {
        Self {
            store,
            object,
            policy: RecreatePolicy::default(),
            busy: tokio::sync::Mutex::new(()),
            cancel: CancellationToken::new(),
            watch_task: Mutex::new(None),
        }
    }

    /// Override the recreation polling budget.
    pub fn with_policy(mut self, policy: RecreatePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn object(&self) -> &ManagedObject {
        &self.object
    }

    pub fn state(&self) -> GuardState {
        let busy = self.busy.try_lock().is_err();
        let stopped = self.cancel.is_cancelled();
        let watching = self
            .watch_task
            .lock()
            .expect("watch task lock")
            .as_ref()
            .is_some_and(|h| !h.is_finished());
        match (stopped, busy) {
            (true, true) => GuardState::Draining,
            (true, false) => GuardState::Stopped,
            (false, true) => GuardState::Creating,
            (false, false) if watching => GuardState::Watching,
            (false, false) => GuardState::Idle,
        }
    }

    /// Whether the object is currently in the store.
    pub async fn exists(&self) -> GuardResult<bool> {
        Ok(self.store.exists(self.object.object_ref()).await?)
    }

    /// Create the object unless it already exists. Refuses to write once
    /// the guard has been stopped.
    pub async fn ensure_exists(&self) -> GuardResult<Ensured> {
        let _busy = self.busy.lock().await;
        if self.cancel.is_cancelled() {
            return Ok(Ensured::Stopped);
        }
        if self.exists().await? {
            return Ok(Ensured::Present);
        }
        match self.store.create(&self.object).await {
            Ok(_) => {
                info!(object = %self.object, "created");
                Ok(Ensured::Created)
            }
            Err(e) if e.is_conflict() => Ok(Ensured::Present),
            Err(e) => Err(e.into()),
        }
    }

    /// Ensure the object now, then keep watching it in the background.
    pub fn start(self: &Arc<Self>) {
        let guard = Arc::clone(self);
        let handle = tokio::spawn(async move { guard.run().await });
        let previous = self
            .watch_task
            .lock()
            .expect("watch task lock")
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        debug!(object = %self.object, "existence guard started");
    }

    /// Stop watching. Returns once any in-flight `ensure_exists()` has
    /// finished, so the caller may delete the object without racing a
    /// recreation.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.watch_task.lock().expect("watch task lock").take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(object = %self.object, error = %e, "guard task ended abnormally");
            }
        }
        let _idle = self.busy.lock().await;
        info!(object = %self.object, "existence guard stopped");
    }

    /// Poll until the incarnation identified by `doomed_uid` is gone, then
    /// make sure the object exists again.
    ///
    /// Another incarnation (different uid) showing up counts as gone.
    pub async fn recreate_when_gone(&self, doomed_uid: Option<&str>) -> GuardResult<Ensured> {
        let target = self.object.object_ref();
        for attempt in 1..=self.policy.attempts {
            if self.cancel.is_cancelled() {
                return Ok(Ensured::Stopped);
            }
            match self.store.get(target).await {
                Err(e) if e.is_not_found() => return self.ensure_exists().await,
                Err(e) => return Err(e.into()),
                Ok(current) if doomed_uid.is_some() && current.uid() != doomed_uid => {
                    return Ok(Ensured::Present);
                }
                Ok(_) => debug!(object = %self.object, attempt, "still waiting for removal"),
            }
            if attempt < self.policy.attempts {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(Ensured::Stopped),
                    _ = tokio::time::sleep(self.policy.interval) => {}
                }
            }
        }
        Err(GuardError::Zombie {
            object: self.object.moniker(),
            attempts: self.policy.attempts,
        })
    }

    async fn run(&self) {
        if let Err(e) = self.ensure_exists().await {
            error!(object = %self.object, error = %e, "initial ensure failed");
        }

        let mut events = self
            .store
            .watch(self.object.kind(), self.object.namespace());

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = events.next() => next,
            };
            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    warn!(object = %self.object, error = %e, "watch error");
                    continue;
                }
                None => {
                    warn!(object = %self.object, "watch stream ended");
                    break;
                }
            };
            if event.object != self.object {
                continue;
            }

            let outcome = match event.event_type {
                EventType::Deleted => self.ensure_exists().await,
                _ if event.object.is_being_deleted() => {
                    info!(object = %self.object, "deletion marker observed");
                    self.recreate_when_gone(event.object.uid()).await
                }
                _ => continue,
            };
            match outcome {
                Ok(Ensured::Stopped) => break,
                Ok(ensured) => debug!(object = %self.object, ?ensured, "recreation pass done"),
                Err(e) if e.is_fatal() => error!(object = %self.object, error = %e, "fatal"),
                Err(e) => warn!(object = %self.object, error = %e, "recreation failed"),
            }
        }
        debug!(object = %self.object, "guard watch loop exiting");
    }
}
