//! Per-app mutual exclusion.
//!
//! Deploy, rollback, scale and destroy hold the app's lock for their whole
//! duration. Waiting is bounded: a caller that cannot get the lock within
//! the timeout gets [`CoreError::LockContention`] and should retry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use stevedore_id::AppId;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::error::CoreError;

/// Default wait for an app lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Lock table keyed by app.
pub struct AppLocks {
    locks: Mutex<HashMap<AppId, Arc<tokio::sync::Mutex<()>>>>,
    timeout: Duration,
}

/// Held for as long as the operation runs; dropping it releases the app.
#[must_use = "the app is unlocked as soon as the guard is dropped"]
pub struct AppGuard {
    app: AppId,
    _guard: OwnedMutexGuard<()>,
}

impl AppGuard {
    pub fn app(&self) -> &AppId {
        &self.app
    }
}

impl std::fmt::Debug for AppGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppGuard").field("app", &self.app).finish()
    }
}

impl AppLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn entry(&self, app: &AppId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(app.clone()).or_default().clone()
    }

    /// Waits up to the configured timeout for the app's lock.
    pub async fn acquire(&self, app: &AppId) -> Result<AppGuard, CoreError> {
        let lock = self.entry(app);
        match tokio::time::timeout(self.timeout, lock.lock_owned()).await {
            Ok(guard) => {
                debug!(app = %app, "App lock acquired");
                Ok(AppGuard {
                    app: app.clone(),
                    _guard: guard,
                })
            }
            Err(_) => {
                warn!(
                    app = %app,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Timed out waiting for app lock"
                );
                Err(CoreError::LockContention { app: app.clone() })
            }
        }
    }

    /// Drops the table entry for an app that no longer exists. The entry
    /// stays while any caller still holds or waits on its mutex, so later
    /// callers queue behind them. Returns whether the entry was removed.
    pub fn forget(&self, app: &AppId) -> bool {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        match locks.get(app) {
            Some(lock) if Arc::strong_count(lock) == 1 => {
                locks.remove(app);
                true
            }
            Some(_) => {
                debug!(app = %app, "App lock still in use, keeping entry");
                false
            }
            None => false,
        }
    }
}

impl Default for AppLocks {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}
