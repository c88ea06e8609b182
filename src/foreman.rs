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

//! The per-query state machine: the single entry point every
//! lifecycle transition goes through, guarded by one lock.
//!
//! `Foreman` and `QueryManager` would form a reference cycle if each held a
//! strong pointer to the other. To avoid that,
//! `QueryManager` only ever sees a [`crate::query_manager::StateListener`]
//! trait object; the concrete implementation here
//! ([`StateListenerHandle`]) holds a `Weak` pointer back into the shared
//! core, built with `Arc::new_cyclic` the way a parent hands a child a
//! narrow, weakly-held callback instead of itself.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{watch, Mutex as AsyncMutex};

use crate::admission::AdmissionController;
use crate::bus::WorkEventBus;
use crate::collab::{
    ClusterCoordinator, Controller, DrillbitStatusListener, ExecutorPool, FragmentPlanner, PersistentStore,
    PhysicalOptimizer, PlanReader, QueryContext, RootExecutorFactory, UserClientConnection,
};
use crate::config::QueueConfig;
use crate::dispatch::FragmentDispatcher;
use crate::error::{ForemanError, ForemanResult as FResult};
use crate::fault::InjectorRef;
use crate::ids::QueryId;
use crate::query_manager::{QueryManager, RootCancelToken, StateListener};
use crate::result::{CloseContext, ForemanResult, QueryContextCloser};
use crate::types::QueryState;

/// One-shot, race-free gate: `wait()` returns immediately once `open()` has
/// been called, no matter how the two race, because the underlying
/// `tokio::sync::watch` channel always remembers its last value (unlike
/// `Notify`, where a `notify_waiters()` call racing ahead of a `notified()`
/// registration is simply lost).
struct AcceptGate {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl AcceptGate {
    fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    fn open(&self) {
        let _ = self.tx.send(true);
    }

    async fn wait(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// All collaborators a `Foreman` needs, grouped so the constructor doesn't
/// take a dozen positional arguments.
pub struct ForemanParams {
    pub query_id: QueryId,
    pub query_context: QueryContext,
    pub plan_reader: Arc<dyn PlanReader>,
    pub physical_optimizer: Arc<dyn PhysicalOptimizer>,
    pub fragment_planner: Arc<dyn FragmentPlanner>,
    pub cluster_coordinator: Arc<dyn ClusterCoordinator>,
    pub controller: Arc<dyn Controller>,
    pub executor_pool: Arc<dyn ExecutorPool>,
    pub user_client: Arc<dyn UserClientConnection>,
    pub persistent_store: Arc<dyn PersistentStore>,
    pub bus: Arc<WorkEventBus>,
    pub queue_config: QueueConfig,
    pub fault_injector: InjectorRef,
    pub root_executor_factory: Arc<dyn RootExecutorFactory>,
}

struct Inner {
    state: QueryState,
    result: ForemanResult,
}

struct ForemanCore {
    query_id: QueryId,
    query_context: QueryContext,
    plan_reader: Arc<dyn PlanReader>,
    physical_optimizer: Arc<dyn PhysicalOptimizer>,
    fragment_planner: Arc<dyn FragmentPlanner>,
    cluster_coordinator: Arc<dyn ClusterCoordinator>,
    user_client: Arc<dyn UserClientConnection>,
    persistent_store: Arc<dyn PersistentStore>,
    bus: Arc<WorkEventBus>,
    fault: InjectorRef,
    admission: AdmissionController,
    dispatcher: FragmentDispatcher,
    query_manager: Arc<QueryManager>,
    accept_gate: AcceptGate,
    lease: SyncMutex<Option<crate::collab::LeaseRef>>,
    query_context_closer: SyncMutex<Option<Arc<dyn QueryContextCloser>>>,
    inner: AsyncMutex<Inner>,
}

struct StateListenerHandle(Weak<ForemanCore>);

#[async_trait]
impl StateListener for StateListenerHandle {
    async fn notify(&self, state: QueryState, cause: Option<ForemanError>) {
        let Some(core) = self.0.upgrade() else {
            return;
        };
        // Externally-originated transitions wait for setup to finish opening
        // the gate, so a fragment that finishes unusually fast can never
        // race ahead of the Foreman's own PENDING -> RUNNING -> dispatched
        // sequence.
        core.accept_gate.wait().await;
        core.move_to_state(state, cause).await;
    }
}

impl ForemanCore {
    /// The single entry point every transition goes through, under one lock
    ///. Illegal transitions are a programming error and abort the
    /// process the same way an unchecked exception would have propagated in
    /// the source material this crate reinterprets — there is no caller that
    /// could meaningfully recover from the scheduler's own state machine
    /// being wrong.
    async fn move_to_state(&self, requested: QueryState, cause: Option<ForemanError>) {
        let mut guard = self.inner.lock().await;
        let current = guard.state;

        if current.is_terminal() {
            warn!(
                query_id = %self.query_id,
                %current,
                %requested,
                "ignoring transition request arriving after a terminal state",
            );
            return;
        }
        if current == requested {
            // A repeated request for the state we're already in (e.g. a
            // second `cancel()` call while still CANCELLATION_REQUESTED,
            // waiting on outstanding fragments) is idempotent, not a
            // programming error — there's no transition to make.
            debug!(query_id = %self.query_id, %current, "ignoring repeated request for the current state");
            return;
        }
        if !current.can_transition_to(requested) {
            error!(query_id = %self.query_id, %current, %requested, "illegal foreman state transition");
            panic!("illegal foreman state transition: {current} -> {requested}");
        }

        guard.state = requested;
        debug!(query_id = %self.query_id, %current, %requested, "foreman state transition");

        match requested {
            QueryState::Pending => unreachable!("no transition ever targets PENDING"),
            QueryState::Running => {}
            QueryState::CancellationRequested => {
                self.query_manager.cancel_executing_fragments();
                self.stage(&mut guard, QueryState::Canceled, None);
            }
            QueryState::Completed => {
                self.stage(&mut guard, QueryState::Completed, None);
                self.close_result(&mut guard).await;
            }
            QueryState::Failed => {
                // A failure stops the rest of the query the same way an
                // explicit cancellation would.
                self.query_manager.cancel_executing_fragments();
                self.stage(&mut guard, QueryState::Failed, cause);
                self.close_result(&mut guard).await;
            }
            QueryState::Canceled => {
                self.close_result(&mut guard).await;
            }
        }
    }

    fn stage(&self, guard: &mut Inner, state: QueryState, cause: Option<ForemanError>) {
        if let Err(e) = guard.result.stage(state, cause) {
            debug!(query_id = %self.query_id, error = %e, "result already staged, keeping the earlier outcome");
        }
    }

    async fn close_result(&self, guard: &mut Inner) {
        let membership_listener: Arc<dyn DrillbitStatusListener> = self.query_manager.clone();
        let ctx = CloseContext {
            bus: self.bus.clone(),
            cluster_coordinator: self.cluster_coordinator.clone(),
            membership_listener: Some(membership_listener),
            query_context: self.query_context_closer.lock().take(),
            persistent_store: self.persistent_store.clone(),
            user_client: self.user_client.clone(),
            lease: self.lease.lock().take(),
            fragment_state_summary: self.query_manager.fragment_state_summary(),
        };
        guard.result.close(ctx).await;
    }
}

/// The Foreman: per-query coordinator from PENDING through a terminal
/// state. Cheaply `Clone`: an `Arc`-wrapped handle around the shared core.
#[derive(Clone)]
pub struct Foreman(Arc<ForemanCore>);

impl Foreman {
    pub fn new(params: ForemanParams) -> Self {
        let core = Arc::new_cyclic(|weak| {
            let state_listener: Arc<dyn StateListener> = Arc::new(StateListenerHandle(weak.clone()));
            let query_manager = Arc::new(QueryManager::new(
                params.query_id,
                params.controller.clone(),
                state_listener,
                RootCancelToken::new(),
            ));
            ForemanCore {
                query_id: params.query_id,
                query_context: params.query_context,
                plan_reader: params.plan_reader,
                physical_optimizer: params.physical_optimizer,
                fragment_planner: params.fragment_planner,
                cluster_coordinator: params.cluster_coordinator.clone(),
                user_client: params.user_client,
                persistent_store: params.persistent_store,
                bus: params.bus.clone(),
                fault: params.fault_injector,
                admission: AdmissionController::new(params.cluster_coordinator, params.queue_config),
                dispatcher: FragmentDispatcher::new(
                    params.controller,
                    params.executor_pool,
                    params.bus,
                    params.root_executor_factory,
                ),
                query_manager,
                accept_gate: AcceptGate::new(),
                lease: SyncMutex::new(None),
                query_context_closer: SyncMutex::new(None),
                inner: AsyncMutex::new(Inner {
                    state: QueryState::Pending,
                    result: ForemanResult::new(params.query_id),
                }),
            }
        });
        Self(core)
    }

    pub fn query_id(&self) -> QueryId {
        self.0.query_id
    }

    pub async fn current_state(&self) -> QueryState {
        self.0.inner.lock().await.state
    }

    /// Supplies the collaborator that releases the root fragment's execution
    /// context at close time. Optional: left unset,
    /// `ForemanResult::close` simply has nothing to close at that step.
    pub fn set_query_context_closer(&self, closer: Arc<dyn QueryContextCloser>) {
        *self.0.query_context_closer.lock() = Some(closer);
    }

    /// Runs a query end to end: PENDING → RUNNING, plan → optimize → plan
    /// fragments, acquire an admission lease, dispatch, and open the
    /// external-events gate. `total_cost` is the planner's already-computed
    /// total plan cost used for admission-queue selection; computing
    /// it is out of scope here.
    pub async fn run(&self, plan_text: &str, is_physical: bool, total_cost: i64) -> FResult<()> {
        let core = self.0.clone();
        core.fault.inject("foreman.run.enter")?;

        core.cluster_coordinator
            .add_membership_listener(core.query_manager.clone());
        core.bus
            .register_listener(core.query_id, core.query_manager.clone())?;

        core.move_to_state(QueryState::Running, None).await;

        let setup = self.setup(&core, plan_text, is_physical, total_cost).await;
        match setup {
            Ok(work_unit) => {
                if let Err(e) = core.dispatcher.dispatch(&work_unit, core.query_manager.clone()).await {
                    let message = e.to_string();
                    core.move_to_state(QueryState::Failed, Some(e)).await;
                    core.accept_gate.open();
                    return Err(ForemanError::setup(message));
                }
                core.accept_gate.open();
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                core.move_to_state(QueryState::Failed, Some(e)).await;
                core.accept_gate.open();
                Err(ForemanError::setup(message))
            }
        }
    }

    async fn setup(
        &self,
        core: &ForemanCore,
        plan_text: &str,
        is_physical: bool,
        total_cost: i64,
    ) -> FResult<crate::types::QueryWorkUnit> {
        core.fault.inject("foreman.setup.plan")?;
        let logical = core.plan_reader.read(plan_text, is_physical).await?;
        let physical = core.physical_optimizer.optimize(logical).await?;
        let work_unit = core
            .fragment_planner
            .plan(physical, &core.query_context, core.query_id)
            .await?;

        if !work_unit.check_invariant(core.query_id) {
            return Err(ForemanError::setup(
                "fragment planner returned a work unit for a different query id",
            ));
        }

        core.fault.inject("foreman.setup.admission")?;
        let lease = core.admission.acquire(total_cost).await?;
        *core.lease.lock() = lease;

        Ok(work_unit)
    }

    /// Client-initiated cancellation (RUNNING -> CANCELLATION_REQUESTED).
    /// Waits for the external-events gate like any other externally-sourced
    /// transition.
    pub async fn request_cancellation(&self) {
        self.0.accept_gate.wait().await;
        self.0.move_to_state(QueryState::CancellationRequested, None).await;
    }

    /// Delivers a cluster-membership change to the underlying
    /// `QueryManager`. Exposed so the embedding system can wire the
    /// Foreman up as a `DrillbitStatusListener` without reaching into
    /// private fields.
    pub fn endpoints_down(&self, endpoints: &[crate::types::Endpoint]) {
        self.0.query_manager.endpoints_down(endpoints);
    }
}

const _: fn() = || {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<Foreman>();
};
