//! Admission gate serializing generations onto the active session.
//!
//! Waiters poll the active session's busy flag at a fixed interval rather
//! than queueing, so there is no ordering among waiters. Worst-case
//! admission latency after a release is one poll interval.

use super::registry::ModelRegistry;
use super::session::Session;
use crate::error::{Error, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Grants exclusive use of the active [`Session`].
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    poll_interval: Duration,
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl AdmissionGate {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Wait until the active session is free, then mark it busy.
    ///
    /// Returns the permit together with the time spent waiting. If
    /// `cancel` fires first, returns [`Error::AdmissionCancelled`] and no
    /// session is touched.
    pub async fn acquire(
        &self,
        registry: &ModelRegistry,
        cancel: &CancellationToken,
    ) -> Result<(AdmissionPermit, Duration)> {
        let start = Instant::now();
        loop {
            if cancel.is_cancelled() {
                return Err(Error::AdmissionCancelled);
            }

            // Re-read every epoch: a swap may have replaced the session.
            let session = registry.active();
            if session.try_reserve() {
                return Ok((AdmissionPermit::new(session), start.elapsed()));
            }

            trace!("Session {} busy, waiting {:?}", session.model_name(), self.poll_interval);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::AdmissionCancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

/// Exclusive right to run one generation.
///
/// Releases the session on drop, so every exit path (completion, error,
/// cancellation, or the stream simply being dropped) frees the gate.
#[derive(Debug)]
pub struct AdmissionPermit {
    session: Arc<Session>,
    released: bool,
}

impl AdmissionPermit {
    fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            released: false,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Point the permit at a freshly swapped-in session. The new session
    /// is created busy; the retired one stays busy so nobody is admitted
    /// to it again.
    pub(crate) fn rebind(&mut self, session: Arc<Session>) {
        debug_assert!(session.is_busy(), "swapped-in session must be created busy");
        self.session = session;
    }

    /// Free the session. Idempotent.
    pub fn release(&mut self) {
        if !self.released {
            self.session.release();
            self.released = true;
        }
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::EchoLoader;
    use crate::runtime::RuntimeConfig;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn registry() -> (TempDir, Arc<ModelRegistry>) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("echo.bin"), b"weights").unwrap();
        let registry = ModelRegistry::new(
            Arc::new(EchoLoader),
            dir.path(),
            "echo.bin",
            RuntimeConfig::default(),
        )
        .await
        .unwrap();
        (dir, Arc::new(registry))
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let (_dir, registry) = registry().await;
        let gate = AdmissionGate::new(Duration::from_millis(10));

        let (mut permit, waited) = gate.acquire(&registry, &CancellationToken::new()).await.unwrap();
        assert!(waited < Duration::from_secs(1));
        assert!(registry.active().is_busy());

        permit.release();
        assert!(!registry.active().is_busy());
        permit.release();
        assert!(!registry.active().is_busy());
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let (_dir, registry) = registry().await;
        let gate = AdmissionGate::new(Duration::from_millis(10));
        {
            let _permit = gate.acquire(&registry, &CancellationToken::new()).await.unwrap();
            assert!(registry.active().is_busy());
        }
        assert!(!registry.active().is_busy());
    }

    #[tokio::test]
    async fn test_second_waiter_admitted_after_release() {
        let (_dir, registry) = registry().await;
        let gate = AdmissionGate::new(Duration::from_millis(10));
        let (permit, _) = gate.acquire(&registry, &CancellationToken::new()).await.unwrap();

        let waiter = {
            let registry = Arc::clone(&registry);
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire(&registry, &CancellationToken::new()).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(permit);
        let (_second, waited) = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(waited >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_leaves_state_untouched() {
        let (_dir, registry) = registry().await;
        let gate = AdmissionGate::new(Duration::from_millis(10));
        let (permit, _) = gate.acquire(&registry, &CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        let waiter = {
            let registry = Arc::clone(&registry);
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.acquire(&registry, &cancel).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::AdmissionCancelled)));
        // The holder still owns the session.
        assert!(registry.active().is_busy());
        drop(permit);
        assert!(!registry.active().is_busy());
    }

    #[tokio::test]
    async fn test_already_cancelled_never_reserves() {
        let (_dir, registry) = registry().await;
        let gate = AdmissionGate::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = gate.acquire(&registry, &cancel).await;
        assert!(matches!(result, Err(Error::AdmissionCancelled)));
        assert!(!registry.active().is_busy());
    }
}
