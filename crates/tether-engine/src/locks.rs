use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use tether_core::ids::SessionId;

/// One async mutex per session. Every read-modify-write of a session's
/// persisted state happens under its lock, so transitions of one session
/// apply strictly one at a time while different sessions proceed in
/// parallel.
#[derive(Default)]
pub(crate) struct SessionLocks {
    locks: DashMap<SessionId, Arc<Mutex<()>>>,
}

impl SessionLocks {
    fn entry(&self, id: &SessionId) -> Arc<Mutex<()>> {
        self.locks.entry(id.clone()).or_default().value().clone()
    }

    pub(crate) async fn lock(&self, id: &SessionId) -> OwnedMutexGuard<()> {
        self.entry(id).lock_owned().await
    }

    /// Like [`lock`](Self::lock), but gives up once `cancel` fires.
    pub(crate) async fn lock_or_cancel(
        &self,
        id: &SessionId,
        cancel: &CancellationToken,
    ) -> Option<OwnedMutexGuard<()>> {
        let mutex = self.entry(id);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            guard = mutex.lock_owned() => Some(guard),
        }
    }

    pub(crate) fn forget(&self, id: &SessionId) {
        self.locks.remove(id);
    }
}
