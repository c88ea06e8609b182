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

//! Two-phase remote fragment submission.
//!
//! Phase 0 sets up the root locally. Phase 1 submits intermediates batched
//! per endpoint and waits for every batch to land before continuing — an
//! async `join_all` stands in for a countdown latch: there is no thread to
//! interrupt in an async task, so waiting on every submission future
//! concurrently is already an uninterruptible wait. Phase 2 submits leaves
//! the same way but does not wait; a failed leaf batch is folded back in as
//! an ordinary fragment failure through the `QueryManager`, the same path
//! any other fragment failure takes.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use parking_lot::Mutex;

use crate::bus::{FragmentManager, WorkEventBus};
use crate::collab::Controller;
use crate::collab::{ExecutorPool, FragmentContextHandle, RootExecutionContext, RootExecutorFactory, RootStatusSink};
use crate::error::{ForemanError, ForemanResult};
use crate::ids::FragmentHandle;
use crate::query_manager::QueryManager;
use crate::types::{Endpoint, FragmentRunState, FragmentStatus, InitializeFragments, PlanFragment, QueryWorkUnit};

/// Forwards the root fragment's own status reports into its `QueryManager`
/// tracker, the same destination a remote fragment's status reaches via the
/// `WorkEventBus`.
struct QueryManagerRootStatusSink {
    query_manager: Arc<QueryManager>,
    handle: FragmentHandle,
}

impl RootStatusSink for QueryManagerRootStatusSink {
    fn report(&self, state: FragmentRunState, error: Option<String>) {
        let query_manager = self.query_manager.clone();
        let handle = self.handle;
        tokio::spawn(async move {
            query_manager
                .status_update(FragmentStatus {
                    handle,
                    state,
                    profile: Vec::new(),
                    error,
                })
                .await;
        });
    }
}

/// Registered on the [`WorkEventBus`] for a root fragment that has remote
/// inputs to wait for. Holds the boxed root-execution future until whatever
/// owns fragment-input readiness (out of scope here) calls
/// [`RootManager::mark_ready`].
pub struct RootManager {
    handle: crate::ids::FragmentHandle,
    executor_pool: Arc<dyn ExecutorPool>,
    runner: Mutex<Option<BoxFuture<'static, ()>>>,
}

impl fmt::Debug for RootManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootManager").field("handle", &self.handle).finish()
    }
}

impl FragmentManager for RootManager {
    fn handle(&self) -> crate::ids::FragmentHandle {
        self.handle
    }
}

impl RootManager {
    /// Hands the stored root-execution future to the executor pool. A no-op
    /// if already submitted.
    pub fn mark_ready(&self) {
        if let Some(task) = self.runner.lock().take() {
            self.executor_pool.submit(task);
        }
    }
}

fn group_by_endpoint(fragments: Vec<PlanFragment>) -> HashMap<Endpoint, Vec<PlanFragment>> {
    let mut batches: HashMap<Endpoint, Vec<PlanFragment>> = HashMap::new();
    for fragment in fragments {
        batches.entry(fragment.assignment.clone()).or_default().push(fragment);
    }
    batches
}

pub struct FragmentDispatcher {
    controller: Arc<dyn Controller>,
    executor_pool: Arc<dyn ExecutorPool>,
    bus: Arc<WorkEventBus>,
    root_executor_factory: Arc<dyn RootExecutorFactory>,
}

impl FragmentDispatcher {
    pub fn new(
        controller: Arc<dyn Controller>,
        executor_pool: Arc<dyn ExecutorPool>,
        bus: Arc<WorkEventBus>,
        root_executor_factory: Arc<dyn RootExecutorFactory>,
    ) -> Self {
        Self {
            controller,
            executor_pool,
            bus,
            root_executor_factory,
        }
    }

    /// Runs all three phases in order.
    pub async fn dispatch(&self, work_unit: &QueryWorkUnit, query_manager: Arc<QueryManager>) -> ForemanResult<()> {
        self.phase0_root_setup(work_unit, &query_manager)?;
        self.phase1_intermediates(work_unit, &query_manager).await?;
        self.phase2_leaves(work_unit, query_manager);
        Ok(())
    }

    /// Constructs the root fragment context, asks the
    /// [`RootExecutorFactory`] to wire the root executor, and either
    /// submits it immediately (no remote inputs to wait for) or registers
    /// it on the bus so it starts once its inputs arrive.
    fn phase0_root_setup(&self, work_unit: &QueryWorkUnit, query_manager: &Arc<QueryManager>) -> ForemanResult<()> {
        let root = &work_unit.root_fragment;
        query_manager.add_fragment_status_tracker(root.handle, root.assignment.clone(), true);

        let status_sink: Arc<dyn RootStatusSink> = Arc::new(QueryManagerRootStatusSink {
            query_manager: query_manager.clone(),
            handle: root.handle,
        });
        let root_runner = self.root_executor_factory.create_root_runner(RootExecutionContext {
            context_handle: FragmentContextHandle { handle: root.handle },
            root_fragment: root.clone(),
            root_operator: work_unit.root_operator.clone(),
            cancel_token: query_manager.root_cancel_token(),
            status_sink,
        });

        if work_unit.fragments.is_empty() {
            // No remote inputs feed the root: run it now.
            self.executor_pool.submit(root_runner);
        } else {
            self.bus.register_manager(Arc::new(RootManager {
                handle: root.handle,
                executor_pool: self.executor_pool.clone(),
                runner: Mutex::new(Some(root_runner)),
            }))?;
        }
        Ok(())
    }

    /// Batches every intermediate fragment per endpoint and waits for all
    /// batches to land. Any failure aborts the whole dispatch.
    async fn phase1_intermediates(&self, work_unit: &QueryWorkUnit, query_manager: &QueryManager) -> ForemanResult<()> {
        let intermediates: Vec<PlanFragment> = work_unit.non_root_intermediates().cloned().collect();
        for fragment in &intermediates {
            query_manager.add_fragment_status_tracker(fragment.handle, fragment.assignment.clone(), false);
        }

        let batches = group_by_endpoint(intermediates);
        if batches.is_empty() {
            return Ok(());
        }

        let sends = batches.into_iter().map(|(endpoint, fragments)| {
            let controller = self.controller.clone();
            async move { controller.send_fragments(&endpoint, InitializeFragments { fragments }).await }
        });

        for result in join_all(sends).await {
            result.map_err(|e| ForemanError::setup(format!("intermediate fragment submission failed: {e}")))?;
        }
        Ok(())
    }

    /// Batches every leaf fragment per endpoint and submits without waiting.
    /// A batch's failure is reported as a FAILED status for each of its
    /// fragments, which the `QueryManager`'s ordinary aggregation then folds
    /// into the query's outcome.
    fn phase2_leaves(&self, work_unit: &QueryWorkUnit, query_manager: Arc<QueryManager>) {
        let leaves: Vec<PlanFragment> = work_unit.non_root_leaves().cloned().collect();
        for fragment in &leaves {
            query_manager.add_fragment_status_tracker(fragment.handle, fragment.assignment.clone(), false);
        }

        for (endpoint, fragments) in group_by_endpoint(leaves) {
            let controller = self.controller.clone();
            let query_manager = query_manager.clone();
            let handles: Vec<_> = fragments.iter().map(|f| f.handle).collect();
            tokio::spawn(async move {
                if let Err(e) = controller
                    .send_fragments(&endpoint, InitializeFragments { fragments })
                    .await
                {
                    warn!(%endpoint, error = %e, "leaf fragment batch submission failed");
                    for handle in handles {
                        query_manager
                            .status_update(FragmentStatus {
                                handle,
                                state: FragmentRunState::Failed,
                                profile: Vec::new(),
                                error: Some(e.to_string()),
                            })
                            .await;
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::ids::{FragmentHandle, QueryId};
    use crate::query_manager::{RootCancelToken, StateListener};
    use crate::types::QueryState;

    struct CountingController {
        calls: Arc<AtomicUsize>,
        fail_for: Option<Endpoint>,
    }

    #[async_trait]
    impl Controller for CountingController {
        async fn send_fragments(&self, endpoint: &Endpoint, _message: InitializeFragments) -> ForemanResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_for.as_ref() == Some(endpoint) {
                return Err(ForemanError::setup("simulated rpc failure"));
            }
            Ok(())
        }
        async fn cancel_fragment(&self, _endpoint: &Endpoint, _handle: FragmentHandle) -> ForemanResult<()> {
            Ok(())
        }
    }

    struct CountingExecutor {
        submitted: Arc<AtomicUsize>,
    }
    impl ExecutorPool for CountingExecutor {
        fn submit(&self, task: BoxFuture<'static, ()>) {
            self.submitted.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(task);
        }
    }

    /// A root runner that never reports anything; these tests only care
    /// about whether and where phase 0 submits or registers it.
    struct NoopRootExecutorFactory;
    impl RootExecutorFactory for NoopRootExecutorFactory {
        fn create_root_runner(&self, _context: RootExecutionContext) -> BoxFuture<'static, ()> {
            Box::pin(async {})
        }
    }

    struct RecordingListener {
        calls: Arc<Mutex<Vec<QueryState>>>,
    }
    #[async_trait]
    impl StateListener for RecordingListener {
        async fn notify(&self, state: QueryState, _cause: Option<ForemanError>) {
            self.calls.lock().push(state);
        }
    }

    fn endpoint(port: u16) -> Endpoint {
        Endpoint {
            host: "127.0.0.1".into(),
            port,
        }
    }

    fn fragment(handle: FragmentHandle, endpoint: Endpoint, is_leaf: bool) -> PlanFragment {
        PlanFragment {
            handle,
            assignment: endpoint,
            is_leaf,
            operator_tree: vec![],
            initial_memory_budget: 0,
            max_memory_budget: 0,
            query_start_time_millis: 0,
            query_time_zone: "UTC".into(),
            options: Default::default(),
        }
    }

    #[tokio::test]
    async fn root_with_no_other_fragments_submits_immediately() {
        let submitted = Arc::new(AtomicUsize::new(0));
        let executor = Arc::new(CountingExecutor { submitted: submitted.clone() });
        let bus = Arc::new(WorkEventBus::default());
        let controller = Arc::new(CountingController { calls: Arc::new(AtomicUsize::new(0)), fail_for: None });
        let dispatcher = FragmentDispatcher::new(controller, executor, bus, Arc::new(NoopRootExecutorFactory));

        let query_id = QueryId::new(0, 1);
        let root_handle = FragmentHandle::new(query_id, 0, 0);
        let work_unit = QueryWorkUnit {
            root_fragment: fragment(root_handle, endpoint(1), false),
            root_operator: vec![],
            fragments: vec![],
        };
        let listener = Arc::new(RecordingListener { calls: Arc::new(Mutex::new(vec![])) });
        let qm = Arc::new(QueryManager::new(
            query_id,
            Arc::new(CountingController { calls: Arc::new(AtomicUsize::new(0)), fail_for: None }),
            listener,
            RootCancelToken::new(),
        ));

        dispatcher.dispatch(&work_unit, qm).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(submitted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn root_with_other_fragments_registers_a_manager_instead_of_submitting() {
        let submitted = Arc::new(AtomicUsize::new(0));
        let executor = Arc::new(CountingExecutor { submitted: submitted.clone() });
        let bus = Arc::new(WorkEventBus::default());
        let controller = Arc::new(CountingController { calls: Arc::new(AtomicUsize::new(0)), fail_for: None });
        let dispatcher = FragmentDispatcher::new(controller.clone(), executor, bus.clone(), Arc::new(NoopRootExecutorFactory));

        let query_id = QueryId::new(0, 2);
        let root_handle = FragmentHandle::new(query_id, 0, 0);
        let leaf_handle = FragmentHandle::new(query_id, 1, 0);
        let work_unit = QueryWorkUnit {
            root_fragment: fragment(root_handle, endpoint(1), false),
            root_operator: vec![],
            fragments: vec![fragment(leaf_handle, endpoint(2), true)],
        };
        let listener = Arc::new(RecordingListener { calls: Arc::new(Mutex::new(vec![])) });
        let qm = Arc::new(QueryManager::new(query_id, controller, listener, RootCancelToken::new()));

        dispatcher.dispatch(&work_unit, qm).await.unwrap();
        assert_eq!(submitted.load(Ordering::SeqCst), 0);
        assert!(bus.lookup_manager(root_handle).unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_intermediate_submission_aborts_dispatch() {
        let submitted = Arc::new(AtomicUsize::new(0));
        let executor = Arc::new(CountingExecutor { submitted });
        let bus = Arc::new(WorkEventBus::default());
        let bad_endpoint = endpoint(7);
        let controller = Arc::new(CountingController {
            calls: Arc::new(AtomicUsize::new(0)),
            fail_for: Some(bad_endpoint.clone()),
        });
        let dispatcher = FragmentDispatcher::new(controller.clone(), executor, bus, Arc::new(NoopRootExecutorFactory));

        let query_id = QueryId::new(0, 3);
        let root_handle = FragmentHandle::new(query_id, 0, 0);
        let mid_handle = FragmentHandle::new(query_id, 1, 0);
        let work_unit = QueryWorkUnit {
            root_fragment: fragment(root_handle, endpoint(1), false),
            root_operator: vec![],
            fragments: vec![fragment(mid_handle, bad_endpoint, false)],
        };
        let listener = Arc::new(RecordingListener { calls: Arc::new(Mutex::new(vec![])) });
        let qm = Arc::new(QueryManager::new(query_id, controller, listener, RootCancelToken::new()));

        let err = dispatcher.dispatch(&work_unit, qm).await.unwrap_err();
        assert_matches::assert_matches!(err, ForemanError::Setup(_));
    }

    #[tokio::test]
    async fn failed_leaf_batch_surfaces_as_fragment_failures() {
        let submitted = Arc::new(AtomicUsize::new(0));
        let executor = Arc::new(CountingExecutor { submitted });
        let bus = Arc::new(WorkEventBus::default());
        let bad_endpoint = endpoint(9);
        let controller = Arc::new(CountingController {
            calls: Arc::new(AtomicUsize::new(0)),
            fail_for: Some(bad_endpoint.clone()),
        });
        let dispatcher = FragmentDispatcher::new(controller.clone(), executor, bus, Arc::new(NoopRootExecutorFactory));

        let query_id = QueryId::new(0, 4);
        let root_handle = FragmentHandle::new(query_id, 0, 0);
        let leaf_handle = FragmentHandle::new(query_id, 1, 0);
        let work_unit = QueryWorkUnit {
            root_fragment: fragment(root_handle, endpoint(1), false),
            root_operator: vec![],
            fragments: vec![fragment(leaf_handle, bad_endpoint, true)],
        };
        let calls = Arc::new(Mutex::new(vec![]));
        let listener = Arc::new(RecordingListener { calls: calls.clone() });
        let qm = Arc::new(QueryManager::new(query_id, controller, listener, RootCancelToken::new()));

        dispatcher.dispatch(&work_unit, qm).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*calls.lock(), vec![QueryState::Failed]);
    }
}
