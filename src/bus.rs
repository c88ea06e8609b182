// Copyright 2026 The Foreman Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Node-local rendezvous between inbound fragment-initialization messages,
//! arriving data streams, and registered listeners.
//!
//! `managers` and `listeners` are `dashmap::DashMap`s rather than
//! `Mutex<HashMap<_>>`: registration here is a bare compare-and-insert with
//! no surrounding transaction, so a lock-free map is the better fit than a
//! coarser mutex-guarded table.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{ForemanError, ForemanResult};
use crate::ids::{FragmentHandle, QueryId};
use crate::types::FragmentStatus;

const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);
const DEFAULT_CAPACITY: usize = 10_000;

/// Node-local collaborator that owns one fragment's inbound rendezvous:
/// buffered data and whatever wiring lets it start once its inputs arrive.
/// Opaque to the bus itself — the bus only needs a handle to key it by.
pub trait FragmentManager: Send + Sync + fmt::Debug {
    fn handle(&self) -> FragmentHandle;
}

pub type FragmentManagerRef = Arc<dyn FragmentManager>;

/// Receives aggregated status updates for one query.
pub trait FragmentStatusListener: Send + Sync {
    fn status_update(&self, status: FragmentStatus);
}

pub type FragmentStatusListenerRef = Arc<dyn FragmentStatusListener>;

/// Bounded, TTL-bearing set of recently-torn-down fragment handles.
///
/// Cancellation races with inbound data/status: after a fragment is torn
/// down, peer nodes may still send data for it. A handle present here means
/// any late-arriving setup for that handle must be silently dropped rather
/// than reported as a setup error.
///
/// Eviction is LRU-ish by insertion order: a bounded deque records insertion
/// order, and `prune` drops both expired entries and, if still over
/// capacity, the oldest entries regardless of age. This is not a precise LRU
/// (lookups don't bump recency) — a bounded, roughly-time-ordered
/// suppression window is enough here, not exact LRU semantics.
struct RecentlyFinished {
    ttl: Duration,
    capacity: usize,
    order: Mutex<VecDeque<(FragmentHandle, Instant)>>,
    members: DashMap<FragmentHandle, ()>,
}

impl RecentlyFinished {
    fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            order: Mutex::new(VecDeque::new()),
            members: DashMap::new(),
        }
    }

    fn insert(&self, handle: FragmentHandle) {
        self.members.insert(handle, ());
        let mut order = self.order.lock();
        order.push_back((handle, Instant::now()));
        self.prune_locked(&mut order);
    }

    fn contains(&self, handle: &FragmentHandle) -> bool {
        self.members.contains_key(handle)
    }

    fn prune_locked(&self, order: &mut VecDeque<(FragmentHandle, Instant)>) {
        let now = Instant::now();
        while let Some((handle, inserted_at)) = order.front().copied() {
            let expired = now.duration_since(inserted_at) > self.ttl;
            let over_capacity = order.len() > self.capacity;
            if expired || over_capacity {
                order.pop_front();
                self.members.remove(&handle);
            } else {
                break;
            }
        }
    }
}

/// Node-local registry: fragment managers by handle, query status listeners
/// by query id, recently-finished-fragment TTL set.
pub struct WorkEventBus {
    managers: DashMap<FragmentHandle, FragmentManagerRef>,
    listeners: DashMap<QueryId, FragmentStatusListenerRef>,
    recently_finished: RecentlyFinished,
}

impl Default for WorkEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_TTL, DEFAULT_CAPACITY)
    }
}

impl WorkEventBus {
    pub fn new(recently_finished_ttl: Duration, recently_finished_capacity: usize) -> Self {
        Self {
            managers: DashMap::new(),
            listeners: DashMap::new(),
            recently_finished: RecentlyFinished::new(
                recently_finished_ttl,
                recently_finished_capacity,
            ),
        }
    }

    /// Fails with `DuplicateListener` if a listener for that query is already
    /// registered.
    pub fn register_listener(
        &self,
        query_id: QueryId,
        listener: FragmentStatusListenerRef,
    ) -> ForemanResult<()> {
        match self.listeners.entry(query_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ForemanError::DuplicateListener(query_id))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(listener);
                Ok(())
            }
        }
    }

    /// Idempotent.
    pub fn unregister_listener(&self, query_id: QueryId) {
        self.listeners.remove(&query_id);
    }

    /// Looks up by the status's query id; if no listener, logs and drops
    /// (warning level). No retry.
    pub fn deliver_status(&self, status: FragmentStatus) {
        let query_id = status.handle.query_id;
        match self.listeners.get(&query_id) {
            Some(listener) => listener.status_update(status),
            None => warn!(%query_id, handle = %status.handle, "no listener registered for query, dropping status"),
        }
    }

    /// Fails with `DuplicateManager` if that handle is already registered
    ///.
    pub fn register_manager(&self, manager: FragmentManagerRef) -> ForemanResult<()> {
        let handle = manager.handle();
        match self.managers.entry(handle) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ForemanError::DuplicateManager(handle))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(manager);
                Ok(())
            }
        }
    }

    /// Returns the manager or nothing; never fails.
    pub fn lookup_manager_optional(&self, handle: FragmentHandle) -> Option<FragmentManagerRef> {
        self.managers.get(&handle).map(|entry| entry.value().clone())
    }

    /// If `handle` is in `recentlyFinished`, returns `Ok(None)` (message must
    /// be discarded); else if registered, returns `Ok(Some(_))`; else fails
    /// with `FragmentSetup` — non-leaf fragments are sent first, so the
    /// manager must already be present.
    pub fn lookup_manager(&self, handle: FragmentHandle) -> ForemanResult<Option<FragmentManagerRef>> {
        if self.recently_finished.contains(&handle) {
            return Ok(None);
        }
        match self.managers.get(&handle) {
            Some(entry) => Ok(Some(entry.value().clone())),
            None => Err(ForemanError::FragmentSetup { handle }),
        }
    }

    /// Atomically inserts into `recentlyFinished` and removes from
    /// `managers`, in that order: a concurrent `lookup_manager` must never
    /// observe the handle absent from both, or it would wrongly conclude
    /// setup never happened.
    pub fn remove_manager(&self, handle: FragmentHandle) {
        self.recently_finished.insert(handle);
        self.managers.remove(&handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct FakeManager(FragmentHandle);
    impl FragmentManager for FakeManager {
        fn handle(&self) -> FragmentHandle {
            self.0
        }
    }

    struct FakeListener {
        received: Mutex<Vec<FragmentHandle>>,
    }
    impl FragmentStatusListener for FakeListener {
        fn status_update(&self, status: FragmentStatus) {
            self.received.lock().push(status.handle);
        }
    }

    fn handle(major: i32) -> FragmentHandle {
        FragmentHandle::new(QueryId::new(1, 1), major, 0)
    }

    fn status(h: FragmentHandle) -> FragmentStatus {
        FragmentStatus {
            handle: h,
            state: crate::types::FragmentRunState::Running,
            profile: vec![],
            error: None,
        }
    }

    #[test]
    fn duplicate_listener_registration_fails_and_keeps_original() {
        let bus = WorkEventBus::default();
        let q = QueryId::new(1, 1);
        let l1 = Arc::new(FakeListener {
            received: Mutex::new(vec![]),
        });
        bus.register_listener(q, l1.clone()).unwrap();
        let l2 = Arc::new(FakeListener {
            received: Mutex::new(vec![]),
        });
        let err = bus.register_listener(q, l2).unwrap_err();
        assert_matches::assert_matches!(err, ForemanError::DuplicateListener(_));

        bus.deliver_status(status(handle(0)));
        assert_eq!(l1.received.lock().len(), 1);
    }

    #[test]
    fn unregister_listener_is_idempotent() {
        let bus = WorkEventBus::default();
        let q = QueryId::new(2, 2);
        bus.unregister_listener(q);
        bus.unregister_listener(q);
    }

    #[test]
    fn deliver_status_with_no_listener_is_dropped_not_panicked() {
        let bus = WorkEventBus::default();
        bus.deliver_status(status(handle(0)));
    }

    #[test]
    fn duplicate_manager_registration_fails() {
        let bus = WorkEventBus::default();
        let h = handle(1);
        bus.register_manager(Arc::new(FakeManager(h))).unwrap();
        let err = bus.register_manager(Arc::new(FakeManager(h))).unwrap_err();
        assert_matches::assert_matches!(err, ForemanError::DuplicateManager(_));
    }

    #[test]
    fn lookup_manager_missing_and_not_recently_finished_fails_fragment_setup() {
        let bus = WorkEventBus::default();
        let h = handle(2);
        let err = bus.lookup_manager(h).unwrap_err();
        assert_matches::assert_matches!(err, ForemanError::FragmentSetup { .. });
    }

    #[test]
    fn lookup_manager_after_remove_is_suppressed_not_an_error() {
        let bus = WorkEventBus::default();
        let h = handle(3);
        bus.register_manager(Arc::new(FakeManager(h))).unwrap();
        bus.remove_manager(h);
        assert!(bus.lookup_manager(h).unwrap().is_none());
        assert!(bus.lookup_manager_optional(h).is_none());
    }

    #[test]
    fn remove_manager_on_unregistered_handle_is_a_no_op() {
        let bus = WorkEventBus::default();
        let h = handle(4);
        bus.remove_manager(h);
        assert!(bus.lookup_manager(h).unwrap().is_none());
    }

    #[test]
    fn recently_finished_evicts_past_capacity() {
        let bus = WorkEventBus::new(Duration::from_secs(600), 2);
        let h0 = handle(10);
        let h1 = handle(11);
        let h2 = handle(12);
        bus.remove_manager(h0);
        bus.remove_manager(h1);
        bus.remove_manager(h2);
        // h0 should have been evicted once capacity 2 was exceeded.
        assert!(!bus.recently_finished.contains(&h0));
        assert!(bus.recently_finished.contains(&h2));
    }
}
