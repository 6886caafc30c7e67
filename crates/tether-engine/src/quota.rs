//! Per-owner device quota.
//!
//! Admission is a two-phase reserve/commit so that concurrent requests for
//! the same owner can never overshoot the limit: a [`Reservation`] counts
//! against the owner from the moment it is granted, and gives its slot back
//! on drop unless it was committed to a session.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use tether_core::ids::{OwnerId, SessionId};

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("owner {owner_id} reached the limit of {limit} active sessions")]
pub struct LimitExceeded {
    pub owner_id: OwnerId,
    pub limit: usize,
}

#[derive(Debug, Default)]
struct OwnerSlots {
    held: HashSet<SessionId>,
    pending: usize,
}

impl OwnerSlots {
    fn used(&self) -> usize {
        self.held.len() + self.pending
    }

    fn is_empty(&self) -> bool {
        self.used() == 0
    }
}

#[derive(Debug)]
struct QuotaInner {
    limit: usize,
    owners: Mutex<HashMap<OwnerId, OwnerSlots>>,
}

/// Counts active sessions per owner. Cheap to clone.
#[derive(Clone, Debug)]
pub struct QuotaGuard {
    inner: Arc<QuotaInner>,
}

impl QuotaGuard {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(QuotaInner {
                limit,
                owners: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    /// Reserve one slot for `owner`. The check and the increment happen
    /// under one lock.
    pub fn reserve(&self, owner: &OwnerId) -> Result<Reservation, LimitExceeded> {
        let mut owners = self.inner.owners.lock();
        let slots = owners.entry(owner.clone()).or_default();
        if slots.used() >= self.inner.limit {
            debug!(owner_id = %owner, used = slots.used(), limit = self.inner.limit, "quota denied");
            if slots.is_empty() {
                owners.remove(owner);
            }
            return Err(LimitExceeded {
                owner_id: owner.clone(),
                limit: self.inner.limit,
            });
        }
        slots.pending += 1;
        Ok(Reservation {
            inner: self.inner.clone(),
            owner_id: owner.clone(),
            settled: false,
        })
    }

    /// Return the slot held by `session_id`. Idempotent.
    pub fn release(&self, owner: &OwnerId, session_id: &SessionId) -> bool {
        let mut owners = self.inner.owners.lock();
        let Some(slots) = owners.get_mut(owner) else {
            return false;
        };
        let released = slots.held.remove(session_id);
        if slots.is_empty() {
            owners.remove(owner);
        }
        released
    }

    /// Record a slot already held by a persisted session. Used at startup,
    /// so it does not check the limit.
    pub fn hydrate(&self, owner: &OwnerId, session_id: &SessionId) {
        let mut owners = self.inner.owners.lock();
        let slots = owners.entry(owner.clone()).or_default();
        slots.held.insert(session_id.clone());
        if slots.used() > self.inner.limit {
            warn!(
                owner_id = %owner,
                used = slots.used(),
                limit = self.inner.limit,
                "persisted sessions exceed the owner quota"
            );
        }
    }

    pub fn holds(&self, owner: &OwnerId, session_id: &SessionId) -> bool {
        self.inner
            .owners
            .lock()
            .get(owner)
            .is_some_and(|slots| slots.held.contains(session_id))
    }

    /// Slots in use by `owner`, reservations in flight included.
    pub fn used(&self, owner: &OwnerId) -> usize {
        self.inner
            .owners
            .lock()
            .get(owner)
            .map_or(0, OwnerSlots::used)
    }

    pub fn remaining(&self, owner: &OwnerId) -> usize {
        self.inner.limit.saturating_sub(self.used(owner))
    }
}

/// A granted but not yet committed slot.
#[derive(Debug)]
#[must_use = "a reservation is released as soon as it is dropped"]
pub struct Reservation {
    inner: Arc<QuotaInner>,
    owner_id: OwnerId,
    settled: bool,
}

impl Reservation {
    pub fn owner_id(&self) -> &OwnerId {
        &self.owner_id
    }

    /// Bind the slot to `session_id`.
    pub fn commit(mut self, session_id: &SessionId) {
        let mut owners = self.inner.owners.lock();
        let slots = owners.entry(self.owner_id.clone()).or_default();
        slots.pending = slots.pending.saturating_sub(1);
        slots.held.insert(session_id.clone());
        self.settled = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut owners = self.inner.owners.lock();
        if let Some(slots) = owners.get_mut(&self.owner_id) {
            slots.pending = slots.pending.saturating_sub(1);
            if slots.is_empty() {
                owners.remove(&self.owner_id);
            }
        }
    }
}
