//! Instance-lock release for reentrant endpoints.
//!
//! A reentrant call gives up its instance lock while it waits on an outbound
//! request, so nested inbound calls for the same instance can run. The lock
//! is taken back, in FIFO order, before the call continues.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tokio::task::futures::TaskLocalFuture;

tokio::task_local! {
    static HELD: Arc<HeldLock>;
}

pub(crate) struct HeldLock {
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Mutex<Option<OwnedMutexGuard<()>>>,
}

impl HeldLock {
    pub(crate) fn new(guard: OwnedMutexGuard<()>) -> Arc<Self> {
        Arc::new(Self {
            lock: OwnedMutexGuard::mutex(&guard).clone(),
            guard: Mutex::new(Some(guard)),
        })
    }

    /// Run `future` with this lock releasable by [`while_unlocked`].
    pub(crate) fn scope<F: Future>(self: &Arc<Self>, future: F) -> TaskLocalFuture<Arc<HeldLock>, F> {
        HELD.scope(self.clone(), future)
    }

    pub(crate) fn take_guard(&self) -> Option<OwnedMutexGuard<()>> {
        self.guard.lock().take()
    }
}

/// Await `future` without the current reentrant call's instance lock.
///
/// Outside a reentrant invocation this is a plain await.
pub(crate) async fn while_unlocked<F: Future>(future: F) -> F::Output {
    let Ok(held) = HELD.try_with(Arc::clone) else {
        return future.await;
    };
    let released = held.guard.lock().take();
    if released.is_none() {
        return future.await;
    }
    drop(released);

    let output = future.await;
    let guard = held.lock.clone().lock_owned().await;
    *held.guard.lock() = Some(guard);
    output
}
