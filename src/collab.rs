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

//! External collaborators the core consumes. Every concrete operator,
//! parser, optimizer, RPC transport and storage plugin lives outside this
//! crate; these `#[async_trait]` traits are the only seam the core
//! knows about.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::ForemanResult;
use crate::ids::{FragmentHandle, QueryId};
use crate::query_manager::RootCancelToken;
use crate::types::{Endpoint, FragmentRunState, InitializeFragments, PlanFragment, QueryResult, QueryState, SerializedOperatorTree};

/// Opaque logical plan. Parsing a `RunQuery.plan` string is out of scope
///; this crate only moves the result between collaborators.
pub type LogicalPlan = Vec<u8>;
/// Opaque physical plan with endpoint assignments already computed.
pub type PhysicalPlan = Vec<u8>;

/// Minimal session/query context threaded through planning. Fields beyond
/// `query_id` are intentionally left to the embedding system; the core never
/// reads them.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub query_id: QueryId,
    pub session_user: String,
}

/// Parses serialized logical/physical plans from a textual representation.
#[async_trait]
pub trait PlanReader: Send + Sync {
    async fn read(&self, plan_text: &str, is_physical: bool) -> ForemanResult<LogicalPlan>;
}

/// Lowers a logical plan to a physical plan.
#[async_trait]
pub trait PhysicalOptimizer: Send + Sync {
    async fn optimize(&self, logical: LogicalPlan) -> ForemanResult<PhysicalPlan>;
}

/// Produces a [`crate::types::QueryWorkUnit`] from a physical plan plus
/// cluster membership. Requires the tree's sorted operator iteration
/// to expose a single root and all operators to already carry endpoint
/// assignments.
#[async_trait]
pub trait FragmentPlanner: Send + Sync {
    async fn plan(
        &self,
        physical_plan: PhysicalPlan,
        query_context: &QueryContext,
        query_id: QueryId,
    ) -> ForemanResult<crate::types::QueryWorkUnit>;
}

/// An acquired slot on the cluster-wide admission semaphore.
/// `close` is idempotent from the caller's point of view: the
/// [`crate::admission::AdmissionController`] retries it in a loop and gives
/// up after logging.
pub trait Lease: Send + Sync + std::fmt::Debug {
    fn close(&self) -> ForemanResult<()>;
}

pub type LeaseRef = Box<dyn Lease>;

/// A cluster-coordinated counting semaphore named `"query.small"` /
/// `"query.large"`.
#[async_trait]
pub trait DistributedSemaphore: Send + Sync {
    async fn acquire(&self, timeout: Duration) -> ForemanResult<LeaseRef>;
}

/// Cluster membership change notifications.
pub trait DrillbitStatusListener: Send + Sync {
    fn endpoints_down(&self, endpoints: &[Endpoint]);
}

/// Exposes named distributed semaphores and a membership-change listener
/// registry.
#[async_trait]
pub trait ClusterCoordinator: Send + Sync {
    async fn get_semaphore(
        &self,
        name: &str,
        capacity: i32,
    ) -> ForemanResult<Arc<dyn DistributedSemaphore>>;

    fn add_membership_listener(&self, listener: Arc<dyn DrillbitStatusListener>);

    /// Symmetric with `add_membership_listener`, used by `ForemanResult::close`
    /// to stop receiving membership events once a query is done.
    fn remove_membership_listener(&self, listener: Arc<dyn DrillbitStatusListener>);
}

/// Per-endpoint RPC tunnels: batched fragment initialization and
/// best-effort cancellation.
#[async_trait]
pub trait Controller: Send + Sync {
    async fn send_fragments(
        &self,
        endpoint: &Endpoint,
        message: InitializeFragments,
    ) -> ForemanResult<()>;

    async fn cancel_fragment(&self, endpoint: &Endpoint, handle: FragmentHandle)
        -> ForemanResult<()>;
}

/// Delivers results and the final response to the requesting client.
#[async_trait]
pub trait UserClientConnection: Send + Sync {
    async fn send_result(&self, result: QueryResult) -> ForemanResult<()>;
}

/// Schedules the root fragment executor. `submit` hands off a boxed
/// future to be spawned on a worker thread; this crate never awaits the
/// task itself.
pub trait ExecutorPool: Send + Sync {
    fn submit(&self, task: BoxFuture<'static, ()>);
}

/// Records query state transitions, best-effort.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn record_state(&self, query_id: QueryId, state: QueryState) -> ForemanResult<()>;
}

/// Opaque handle to the root fragment's execution context, created during
/// Phase 0 root setup and released by `ForemanResult::close`. No internal
/// fields are specified here — the executor crate that actually owns
/// fragment memory allocators would extend this; per-fragment executor
/// internals are out of scope.
#[derive(Debug, Clone)]
pub struct FragmentContextHandle {
    pub handle: FragmentHandle,
}

/// Reports the root fragment's own status back into the coordinator. The
/// root runs locally rather than arriving through the `WorkEventBus` like a
/// remote fragment's status does, so this is the channel that takes its
/// place for the one fragment that never leaves the node.
pub trait RootStatusSink: Send + Sync {
    fn report(&self, state: FragmentRunState, error: Option<String>);
}

/// Everything [`RootExecutorFactory::create_root_runner`] needs, grouped so
/// the trait doesn't take a long parameter list.
pub struct RootExecutionContext {
    pub context_handle: FragmentContextHandle,
    pub root_fragment: PlanFragment,
    pub root_operator: SerializedOperatorTree,
    pub cancel_token: RootCancelToken,
    pub status_sink: Arc<dyn RootStatusSink>,
}

/// Builds the boxed future that runs the root fragment. Phase 0 root setup
/// (§4.4) calls this after constructing the fragment context; the operator
/// tree itself is opaque here and its execution is out of scope (§1) — this
/// is only the hand-off seam named by the `FragmentContext` row of the
/// component table ("the core sets it up for the root fragment and hands it
/// to the executor").
pub trait RootExecutorFactory: Send + Sync {
    fn create_root_runner(&self, context: RootExecutionContext) -> BoxFuture<'static, ()>;
}
