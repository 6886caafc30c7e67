//! In-memory index of live session handles.
//!
//! A handle owns the protocol client of one session plus the tasks that
//! consume its events. The registry makes sure at most one handle exists
//! per session: concurrent [`SessionRegistry::get_or_restore`] calls for
//! the same id serialize on a per-id restore lock and re-check before
//! building anything.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use tether_core::ids::{OwnerId, SessionId};
use tether_core::protocol::ProtocolClient;

use crate::error::RestoreError;

/// Live, in-memory side of one session.
pub struct SessionHandle {
    session_id: SessionId,
    owner_id: OwnerId,
    client: Arc<dyn ProtocolClient>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    reconnecting: AtomicBool,
}

impl SessionHandle {
    pub fn new(session_id: SessionId, owner_id: OwnerId, client: Arc<dyn ProtocolClient>) -> Self {
        Self {
            session_id,
            owner_id,
            client,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            reconnecting: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn owner_id(&self) -> &OwnerId {
        &self.owner_id
    }

    pub fn client(&self) -> &Arc<dyn ProtocolClient> {
        &self.client
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    /// Fires once the handle is being torn down.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting.load(Ordering::SeqCst)
    }

    /// Claim the reconnect loop. Returns `false` if one is already running.
    pub(crate) fn begin_reconnect(&self) -> bool {
        self.reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn end_reconnect(&self) {
        self.reconnecting.store(false, Ordering::SeqCst);
    }

    /// Run `task` as part of this handle; [`shutdown`](Self::shutdown)
    /// waits for it.
    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    /// Signal every task of the handle to stop, without waiting.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.tasks.close();
    }

    /// Stop from inside one of the handle's own tasks: cancel and drop the
    /// link, but do not wait on the tracker.
    pub(crate) async fn stop_from_task(&self) {
        self.cancel();
        self.client.disconnect().await;
    }

    /// Cancel, disconnect the client and wait for every task to finish.
    /// Must not be called from one of the handle's own tasks.
    pub async fn shutdown(&self) {
        self.cancel();
        self.client.disconnect().await;
        self.tasks.wait().await;
        debug!(session_id = %self.session_id, "session handle stopped");
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("owner_id", &self.owner_id)
            .field("connected", &self.is_connected())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    handles: DashMap<SessionId, Arc<SessionHandle>>,
    restore_locks: DashMap<SessionId, Arc<Mutex<()>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<SessionHandle>> {
        self.handles.get(id).map(|h| h.value().clone())
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.handles.contains_key(id)
    }

    /// Registered and not cancelled.
    pub fn is_live(&self, id: &SessionId) -> bool {
        self.get(id).is_some_and(|h| !h.is_stopped())
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Snapshot of every live handle.
    pub fn handles(&self) -> Vec<Arc<SessionHandle>> {
        self.handles.iter().map(|h| h.value().clone()).collect()
    }

    pub fn handles_for_owner(&self, owner: &OwnerId) -> Vec<Arc<SessionHandle>> {
        self.handles
            .iter()
            .filter(|h| h.owner_id() == owner)
            .map(|h| h.value().clone())
            .collect()
    }

    fn restore_lock(&self, id: &SessionId) -> Arc<Mutex<()>> {
        self.restore_locks.entry(id.clone()).or_default().value().clone()
    }

    /// Return the live handle for `id`, building it with `restore` if there
    /// is none. At most one `restore` runs per id at a time, and it is not
    /// called at all if another caller installed a handle meanwhile.
    ///
    /// A registered handle that was cancelled counts as absent: it is
    /// dropped and replaced.
    pub async fn get_or_restore<F, Fut>(
        &self,
        id: &SessionId,
        restore: F,
    ) -> Result<Arc<SessionHandle>, RestoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<SessionHandle>, RestoreError>>,
    {
        if let Some(handle) = self.get(id).filter(|h| !h.is_stopped()) {
            return Ok(handle);
        }

        let lock = self.restore_lock(id);
        let _guard = lock.lock().await;
        if let Some(handle) = self.get(id) {
            if !handle.is_stopped() {
                return Ok(handle);
            }
            self.remove_if_current(&handle);
            handle.stop_from_task().await;
            debug!(session_id = %id, "stopped session handle dropped");
        }

        let handle = restore().await?;
        self.handles.insert(id.clone(), handle.clone());
        debug!(session_id = %id, "session handle installed");
        Ok(handle)
    }

    /// Remove the handle for `id`, waiting out any restore in progress so a
    /// concurrent restore cannot re-install it afterwards.
    pub async fn evict(&self, id: &SessionId) -> Option<Arc<SessionHandle>> {
        let lock = self.restore_lock(id);
        let _guard = lock.lock().await;
        self.handles.remove(id).map(|(_, h)| h)
    }

    /// Remove `handle` only if it is still the registered one for its
    /// session.
    pub fn remove_if_current(&self, handle: &Arc<SessionHandle>) -> bool {
        self.handles
            .remove_if(handle.session_id(), |_, current| Arc::ptr_eq(current, handle))
            .is_some()
    }

    /// Drop bookkeeping for a session that will never be restored again.
    pub fn forget(&self, id: &SessionId) {
        self.handles.remove(id);
        self.restore_locks.remove(id);
    }
}
