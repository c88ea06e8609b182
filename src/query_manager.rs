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

//! Tracks every fragment of one query to a terminal state and fires exactly
//! one aggregate transition back into the Foreman.
//!
//! `QueryManager` never holds a `Foreman`: it only holds a `StateListener`
//! trait object and notifies through that instead. That keeps the ownership
//! graph a tree instead of a cycle: the Foreman owns the QueryManager, and
//! the QueryManager gets back only a narrow callback rather than a full
//! reference to its owner.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::bus::FragmentStatusListener;
use crate::collab::{Controller, DrillbitStatusListener};
use crate::error::ForemanError;
use crate::ids::{FragmentHandle, QueryId};
use crate::types::{Endpoint, FragmentRunState, FragmentStatus, QueryState};

/// Narrow callback the `QueryManager` uses to report an aggregate outcome.
/// Implemented by [`crate::foreman::Foreman`] without exposing the whole
/// type.
#[async_trait::async_trait]
pub trait StateListener: Send + Sync {
    async fn notify(&self, state: QueryState, cause: Option<ForemanError>);
}

pub type StateListenerRef = Arc<dyn StateListener>;

#[derive(Debug, Clone)]
struct Tracker {
    state: FragmentRunState,
    is_root: bool,
    endpoint: Endpoint,
    error: Option<String>,
}

/// One query's fragment bookkeeping: every fragment's last-reported state,
/// the single-fire aggregation gate, and cancellation-broadcast plumbing.
pub struct QueryManager {
    query_id: QueryId,
    controller: Arc<dyn Controller>,
    state_listener: StateListenerRef,
    trackers: DashMap<FragmentHandle, Tracker>,
    cancellation_requested: AtomicBool,
    fired: AtomicBool,
    first_failure: Mutex<Option<ForemanError>>,
    root_cancel: RootCancelToken,
}

/// Cooperative cancellation signal for the locally-running root fragment,
/// polled by whatever executes it rather than delivered by RPC like
/// the non-root fragments'.
#[derive(Debug, Clone, Default)]
pub struct RootCancelToken(Arc<AtomicBool>);

impl RootCancelToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl QueryManager {
    pub fn new(
        query_id: QueryId,
        controller: Arc<dyn Controller>,
        state_listener: StateListenerRef,
        root_cancel: RootCancelToken,
    ) -> Self {
        Self {
            query_id,
            controller,
            state_listener,
            trackers: DashMap::new(),
            cancellation_requested: AtomicBool::new(false),
            fired: AtomicBool::new(false),
            first_failure: Mutex::new(None),
            root_cancel,
        }
    }

    pub fn root_cancel_token(&self) -> RootCancelToken {
        self.root_cancel.clone()
    }

    /// Registers a fragment to be tracked to a terminal state, at
    /// `FragmentRunState::Submitted`. `is_root` fragments are excluded
    /// from RPC cancellation broadcast — the root runs locally and is
    /// cancelled directly instead.
    pub fn add_fragment_status_tracker(&self, handle: FragmentHandle, endpoint: Endpoint, is_root: bool) {
        self.trackers.insert(
            handle,
            Tracker {
                state: FragmentRunState::Submitted,
                is_root,
                endpoint,
                error: None,
            },
        );
    }

    /// Records a status report and, if this is the fragment that completes
    /// the set, returns the aggregate outcome to report to the Foreman.
    /// Returns `None` on every non-completing update: exactly one Foreman
    /// transition fires as a consequence of reaching terminal state.
    fn record_status(&self, status: FragmentStatus) -> Option<(QueryState, Option<ForemanError>)> {
        if let Some(mut tracker) = self.trackers.get_mut(&status.handle) {
            tracker.state = status.state;
            tracker.error = status.error.clone();
        } else {
            warn!(handle = %status.handle, "status update for an untracked fragment, ignoring");
            return None;
        }

        if status.state == FragmentRunState::Failed {
            let mut first = self.first_failure.lock();
            if first.is_none() {
                *first = Some(ForemanError::setup(
                    status.error.unwrap_or_else(|| "fragment failed".to_string()),
                ));
            } else {
                warn!(
                    handle = %status.handle,
                    error = status.error.as_deref().unwrap_or("fragment failed"),
                    "suppressing later fragment failure, first failure already recorded as the query cause",
                );
            }
        }

        self.maybe_aggregate()
    }

    /// Aggregation rule: if any fragment failed, FAILED with the
    /// first-seen cause; else if cancellation was requested, CANCELED; else
    /// COMPLETED. Fires at most once per query via `fired`.
    fn maybe_aggregate(&self) -> Option<(QueryState, Option<ForemanError>)> {
        let all_terminal = self.trackers.iter().all(|entry| entry.value().state.is_terminal());
        if !all_terminal {
            return None;
        }
        if self.fired.swap(true, Ordering::SeqCst) {
            return None;
        }

        let cause = self.first_failure.lock().take();
        let outcome = if cause.is_some() {
            QueryState::Failed
        } else if self.cancellation_requested.load(Ordering::SeqCst) {
            QueryState::Canceled
        } else {
            QueryState::Completed
        };
        Some((outcome, cause))
    }

    /// Records a status update and, if it completes the fragment set,
    /// notifies the Foreman.
    pub async fn status_update(&self, status: FragmentStatus) {
        if let Some((state, cause)) = self.record_status(status) {
            self.state_listener.notify(state, cause).await;
        }
    }

    /// Best-effort broadcast cancellation (RUNNING ->
    /// CANCELLATION_REQUESTED): cancels the root directly and fires one
    /// detached cancel RPC per still-running non-root fragment. Does not
    /// wait for acknowledgement; acknowledgement arrives later as ordinary
    /// status updates.
    pub fn cancel_executing_fragments(&self) {
        self.cancellation_requested.store(true, Ordering::SeqCst);
        self.root_cancel.cancel();

        for entry in self.trackers.iter() {
            let handle = *entry.key();
            let tracker = entry.value();
            if tracker.is_root || tracker.state.is_terminal() {
                continue;
            }
            let controller = self.controller.clone();
            let endpoint = tracker.endpoint.clone();
            tokio::spawn(async move {
                if let Err(e) = controller.cancel_fragment(&endpoint, handle).await {
                    warn!(%handle, error = %e, "best-effort fragment cancellation failed");
                }
            });
        }
    }

    /// A human-readable snapshot of every tracked fragment's last-known
    /// state, for `ForemanResult::close` step 1.
    pub fn fragment_state_summary(&self) -> String {
        let mut states: HashMap<&'static str, usize> = HashMap::new();
        for entry in self.trackers.iter() {
            let name = match entry.value().state {
                FragmentRunState::Submitted => "submitted",
                FragmentRunState::Running => "running",
                FragmentRunState::Finished => "finished",
                FragmentRunState::Canceled => "canceled",
                FragmentRunState::Failed => "failed",
            };
            *states.entry(name).or_insert(0) += 1;
        }
        let mut parts: Vec<String> = states.into_iter().map(|(k, v)| format!("{k}={v}")).collect();
        parts.sort();
        format!("query {} fragments[{}]", self.query_id, parts.join(", "))
    }
}

impl FragmentStatusListener for QueryManager {
    fn status_update(&self, status: FragmentStatus) {
        let this_query = status.handle.query_id;
        debug_assert_eq!(this_query, self.query_id, "status routed to the wrong QueryManager");
        if let Some((state, cause)) = self.record_status(status) {
            let listener = self.state_listener.clone();
            tokio::spawn(async move {
                listener.notify(state, cause).await;
            });
        }
    }
}

impl DrillbitStatusListener for QueryManager {
    /// A membership change marks every fragment assigned to a downed
    /// endpoint as failed. An endpoint with zero assigned fragments
    /// produces no state change.
    fn endpoints_down(&self, endpoints: &[Endpoint]) {
        let down: std::collections::HashSet<&Endpoint> = endpoints.iter().collect();
        let affected: Vec<FragmentHandle> = self
            .trackers
            .iter()
            .filter(|entry| down.contains(&entry.value().endpoint) && !entry.value().state.is_terminal())
            .map(|entry| *entry.key())
            .collect();

        for handle in affected {
            let endpoint = self
                .trackers
                .get(&handle)
                .map(|t| t.endpoint.to_string())
                .unwrap_or_default();
            let status = FragmentStatus {
                handle,
                state: FragmentRunState::Failed,
                profile: Vec::new(),
                error: Some(format!("endpoint {endpoint} unreachable")),
            };
            if let Some((state, cause)) = self.record_status(status) {
                let listener = self.state_listener.clone();
                tokio::spawn(async move {
                    listener.notify(state, cause).await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::error::ForemanResult as FResult;

    struct NoopController;
    #[async_trait]
    impl Controller for NoopController {
        async fn send_fragments(
            &self,
            _endpoint: &Endpoint,
            _message: crate::types::InitializeFragments,
        ) -> FResult<()> {
            Ok(())
        }
        async fn cancel_fragment(&self, _endpoint: &Endpoint, _handle: FragmentHandle) -> FResult<()> {
            Ok(())
        }
    }

    struct RecordingListener {
        calls: Arc<Mutex<Vec<(QueryState, bool)>>>,
    }
    #[async_trait]
    impl StateListener for RecordingListener {
        async fn notify(&self, state: QueryState, cause: Option<ForemanError>) {
            self.calls.lock().push((state, cause.is_some()));
        }
    }

    fn endpoint(n: u16) -> Endpoint {
        Endpoint {
            host: "127.0.0.1".into(),
            port: n,
        }
    }

    fn manager(calls: Arc<Mutex<Vec<(QueryState, bool)>>>) -> (QueryManager, QueryId) {
        let query_id = QueryId::new(0, 1);
        let listener = Arc::new(RecordingListener { calls });
        let qm = QueryManager::new(query_id, Arc::new(NoopController), listener, RootCancelToken::new());
        (qm, query_id)
    }

    #[tokio::test]
    async fn all_fragments_completing_fires_completed_exactly_once() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (qm, qid) = manager(calls.clone());
        let h0 = FragmentHandle::new(qid, 0, 0);
        let h1 = FragmentHandle::new(qid, 1, 0);
        qm.add_fragment_status_tracker(h0, endpoint(1), true);
        qm.add_fragment_status_tracker(h1, endpoint(2), false);

        qm.status_update(FragmentStatus {
            handle: h0,
            state: FragmentRunState::Finished,
            profile: vec![],
            error: None,
        })
        .await;
        assert!(calls.lock().is_empty());

        qm.status_update(FragmentStatus {
            handle: h1,
            state: FragmentRunState::Finished,
            profile: vec![],
            error: None,
        })
        .await;
        let calls = calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], (QueryState::Completed, false));
    }

    #[tokio::test]
    async fn one_failure_among_many_fragments_aggregates_to_failed() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (qm, qid) = manager(calls.clone());
        let h0 = FragmentHandle::new(qid, 0, 0);
        let h1 = FragmentHandle::new(qid, 1, 0);
        qm.add_fragment_status_tracker(h0, endpoint(1), true);
        qm.add_fragment_status_tracker(h1, endpoint(2), false);

        qm.status_update(FragmentStatus {
            handle: h1,
            state: FragmentRunState::Failed,
            profile: vec![],
            error: Some("boom".into()),
        })
        .await;
        qm.status_update(FragmentStatus {
            handle: h0,
            state: FragmentRunState::Canceled,
            profile: vec![],
            error: None,
        })
        .await;

        let calls = calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], (QueryState::Failed, true));
    }

    #[tokio::test]
    async fn cancellation_requested_with_no_failures_aggregates_to_canceled() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (qm, qid) = manager(calls.clone());
        let h0 = FragmentHandle::new(qid, 0, 0);
        qm.add_fragment_status_tracker(h0, endpoint(1), true);
        qm.cancel_executing_fragments();
        assert!(qm.root_cancel_token().is_canceled());

        qm.status_update(FragmentStatus {
            handle: h0,
            state: FragmentRunState::Canceled,
            profile: vec![],
            error: None,
        })
        .await;

        let calls = calls.lock();
        assert_eq!(calls[0], (QueryState::Canceled, false));
    }

    #[tokio::test]
    async fn endpoint_down_with_zero_assigned_fragments_is_a_no_op() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (qm, qid) = manager(calls.clone());
        let h0 = FragmentHandle::new(qid, 0, 0);
        qm.add_fragment_status_tracker(h0, endpoint(1), true);
        qm.endpoints_down(&[endpoint(99)]);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(calls.lock().is_empty());
    }

    #[tokio::test]
    async fn endpoint_down_fails_every_fragment_assigned_to_it() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (qm, qid) = manager(calls.clone());
        let h0 = FragmentHandle::new(qid, 0, 0);
        let h1 = FragmentHandle::new(qid, 1, 0);
        qm.add_fragment_status_tracker(h0, endpoint(1), true);
        qm.add_fragment_status_tracker(h1, endpoint(2), false);
        qm.endpoints_down(&[endpoint(2)]);
        tokio::time::sleep(Duration::from_millis(10)).await;

        qm.status_update(FragmentStatus {
            handle: h0,
            state: FragmentRunState::Finished,
            profile: vec![],
            error: None,
        })
        .await;

        let calls = calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], (QueryState::Failed, true));
    }
}
