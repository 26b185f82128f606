//! Per-environment exclusive locks.
//!
//! At most one mutating operation (rollout or rollback) runs per
//! environment. Acquisition never waits: a held lock is reported as
//! `RolloutError::InProgress`. Each held lock carries a cancellation
//! channel that `cancel` flips.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{debug, info};

use berth_core::EnvironmentName;

use crate::error::RolloutError;

#[derive(Clone, Default)]
pub struct EnvironmentLocks {
    held: Arc<Mutex<HashMap<EnvironmentName, watch::Sender<bool>>>>,
}

impl EnvironmentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `env`, failing immediately if it is held.
    pub fn try_acquire(&self, env: EnvironmentName) -> Result<EnvironmentGuard, RolloutError> {
        let mut held = self.held.lock().expect("environment locks");
        if held.contains_key(&env) {
            return Err(RolloutError::InProgress(env));
        }
        let (tx, rx) = watch::channel(false);
        held.insert(env, tx);
        debug!(environment = %env, "environment lock acquired");
        Ok(EnvironmentGuard {
            env,
            cancel: rx,
            held: Arc::clone(&self.held),
        })
    }

    pub fn is_held(&self, env: EnvironmentName) -> bool {
        self.held.lock().expect("environment locks").contains_key(&env)
    }

    /// Signal the operation holding `env` to stop. Returns false when
    /// nothing is running.
    pub fn cancel(&self, env: EnvironmentName) -> bool {
        let held = self.held.lock().expect("environment locks");
        match held.get(&env) {
            Some(tx) => {
                tx.send_replace(true);
                info!(environment = %env, "cancellation requested");
                true
            }
            None => false,
        }
    }
}

/// Proof of holding an environment lock. Released on drop.
pub struct EnvironmentGuard {
    env: EnvironmentName,
    cancel: watch::Receiver<bool>,
    held: Arc<Mutex<HashMap<EnvironmentName, watch::Sender<bool>>>>,
}

impl EnvironmentGuard {
    pub fn environment(&self) -> EnvironmentName {
        self.env
    }

    /// A receiver that observes cancellation of this operation.
    pub fn cancellation(&self) -> watch::Receiver<bool> {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}

impl Drop for EnvironmentGuard {
    fn drop(&mut self) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(&self.env);
        }
        debug!(environment = %self.env, "environment lock released");
    }
}
