//! Browser driver interface and session pool.
//!
//! The engine never depends on a concrete browser engine, only on this
//! capability set. Sessions are a bounded shared resource: the pool enforces
//! at-most-one-active-task-per-session and reclaims sessions from canceled
//! or crashed tasks via drop-released leases.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::task::actions::{Action, ActionResult};

/// An open browser session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub id: String,
}

/// A resolved element reference within a page.
#[derive(Debug, Clone)]
pub struct ElementHandle {
    pub id: String,
}

/// Session configuration handed to the driver on open.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Navigation timeout in seconds.
    #[serde(default)]
    pub navigation_timeout_seconds: Option<u64>,
}

/// Snapshot of the current page, handed to the planner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub url: String,
    #[serde(default)]
    pub title: String,
    /// Interactive element tree in driver-defined shape.
    #[serde(default)]
    pub elements: Value,
}

/// Capability set the engine requires from a browser driver.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn open_session(&self, config: &SessionConfig) -> Result<SessionHandle>;

    async fn close_session(&self, session: &SessionHandle) -> Result<()>;

    async fn capture_page(&self, session: &SessionHandle) -> Result<PageSnapshot>;

    async fn resolve_element(
        &self,
        session: &SessionHandle,
        reference: &str,
    ) -> Result<ElementHandle>;

    /// Perform one atomic action. Element is pre-resolved when the action
    /// declares a target.
    async fn perform_action(
        &self,
        session: &SessionHandle,
        element: Option<&ElementHandle>,
        action: &Action,
    ) -> Result<ActionResult>;
}

/// Bounded pool of browser sessions.
///
/// A [`SessionLease`] grants exclusive use of one session for its lifetime.
pub struct SessionPool {
    driver: Arc<dyn BrowserDriver>,
    permits: Arc<Semaphore>,
    config: SessionConfig,
}

impl SessionPool {
    pub fn new(driver: Arc<dyn BrowserDriver>, max_sessions: usize, config: SessionConfig) -> Self {
        Self {
            driver,
            permits: Arc::new(Semaphore::new(max_sessions.max(1))),
            config,
        }
    }

    /// Number of sessions currently available.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Reserve a session, waiting for a slot if the pool is exhausted.
    pub async fn reserve(&self) -> Result<SessionLease> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Browser("Session pool is closed".into()))?;

        let handle = self.driver.open_session(&self.config).await?;
        debug!(session = %handle.id, "Reserved browser session");

        Ok(SessionLease {
            handle: Some(handle),
            driver: self.driver.clone(),
            _permit: permit,
        })
    }
}

/// Exclusive reservation of one browser session.
///
/// Dropping the lease returns the slot to the pool and closes the session in
/// the background, so canceled or panicking tasks cannot leak sessions.
pub struct SessionLease {
    handle: Option<SessionHandle>,
    driver: Arc<dyn BrowserDriver>,
    _permit: OwnedSemaphorePermit,
}

impl SessionLease {
    pub fn handle(&self) -> &SessionHandle {
        self.handle.as_ref().expect("lease already closed")
    }

    /// Close the session explicitly, surfacing driver errors.
    pub async fn close(mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            self.driver.close_session(&handle).await?;
        }
        Ok(())
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let driver = self.driver.clone();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    if let Err(e) = driver.close_session(&handle).await {
                        warn!(session = %handle.id, "Failed to close reclaimed session: {}", e);
                    }
                });
            } else {
                warn!(session = %handle.id, "Session dropped outside a runtime; driver must reap it");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Driver that tracks open sessions.
    struct CountingDriver {
        open: AtomicUsize,
        opened_total: AtomicUsize,
    }

    impl CountingDriver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                open: AtomicUsize::new(0),
                opened_total: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl BrowserDriver for CountingDriver {
        async fn open_session(&self, _config: &SessionConfig) -> Result<SessionHandle> {
            self.open.fetch_add(1, Ordering::SeqCst);
            let n = self.opened_total.fetch_add(1, Ordering::SeqCst);
            Ok(SessionHandle {
                id: format!("session-{}", n),
            })
        }

        async fn close_session(&self, _session: &SessionHandle) -> Result<()> {
            self.open.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        async fn capture_page(&self, _session: &SessionHandle) -> Result<PageSnapshot> {
            Ok(PageSnapshot::default())
        }

        async fn resolve_element(
            &self,
            _session: &SessionHandle,
            reference: &str,
        ) -> Result<ElementHandle> {
            Ok(ElementHandle {
                id: reference.to_string(),
            })
        }

        async fn perform_action(
            &self,
            _session: &SessionHandle,
            _element: Option<&ElementHandle>,
            _action: &Action,
        ) -> Result<ActionResult> {
            Ok(ActionResult::success(Value::Null))
        }
    }

    #[tokio::test]
    async fn lease_is_exclusive_and_reclaimed_on_drop() {
        let driver = CountingDriver::new();
        let pool = SessionPool::new(driver.clone(), 1, SessionConfig::default());

        let lease = pool.reserve().await.unwrap();
        assert_eq!(pool.available(), 0);
        assert_eq!(driver.open.load(Ordering::SeqCst), 1);

        drop(lease);
        // Close happens in a background task.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.available(), 1);
        assert_eq!(driver.open.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pool_bounds_concurrent_reservations() {
        let driver = CountingDriver::new();
        let pool = Arc::new(SessionPool::new(driver.clone(), 2, SessionConfig::default()));

        let a = pool.reserve().await.unwrap();
        let _b = pool.reserve().await.unwrap();
        assert_eq!(pool.available(), 0);

        // Third reservation waits until a lease is released.
        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.reserve().await.map(|l| l.handle().id.clone()) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        a.close().await.unwrap();
        let id = waiter.await.unwrap().unwrap();
        assert!(id.starts_with("session-"));
    }

    #[tokio::test]
    async fn explicit_close_surfaces_driver_errors() {
        struct FailingClose;

        #[async_trait]
        impl BrowserDriver for FailingClose {
            async fn open_session(&self, _config: &SessionConfig) -> Result<SessionHandle> {
                Ok(SessionHandle { id: "s".into() })
            }
            async fn close_session(&self, _session: &SessionHandle) -> Result<()> {
                Err(Error::Browser("already gone".into()))
            }
            async fn capture_page(&self, _session: &SessionHandle) -> Result<PageSnapshot> {
                Ok(PageSnapshot::default())
            }
            async fn resolve_element(
                &self,
                _session: &SessionHandle,
                _reference: &str,
            ) -> Result<ElementHandle> {
                Err(Error::Browser("no elements".into()))
            }
            async fn perform_action(
                &self,
                _session: &SessionHandle,
                _element: Option<&ElementHandle>,
                _action: &Action,
            ) -> Result<ActionResult> {
                Err(Error::Browser("no actions".into()))
            }
        }

        let pool = SessionPool::new(Arc::new(FailingClose), 1, SessionConfig::default());
        let lease = pool.reserve().await.unwrap();
        assert!(lease.close().await.is_err());
    }
}
