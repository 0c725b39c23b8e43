use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Cluster barrier lock.
///
/// Commit dispatch holds it shared; a cluster-wide barrier takes it
/// exclusively so it never observes a half-dispatched commit.
#[derive(Debug, Default)]
pub struct BarrierLock {
    inner: RwLock<()>,
}

impl BarrierLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, ()> {
        self.inner.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, ()> {
        self.inner.write().await
    }

    /// Exclusive acquisition without waiting; `None` while any commit is
    /// being dispatched.
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, ()>> {
        self.inner.try_write().ok()
    }
}
