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

//! Per-query, single-use terminal cleanup.
//!
//! Re-expressed here as a plain struct with an explicit `close` method and a
//! `closed` flag checked at every entry point — there is no inheritance to
//! lean on in Rust, so a manual closed-once guard is the idiomatic
//! equivalent of a one-shot `AutoCloseable`.

use std::sync::Arc;

use crate::bus::WorkEventBus;
use crate::collab::{ClusterCoordinator, DrillbitStatusListener, LeaseRef, PersistentStore, UserClientConnection};
use crate::error::ForemanError;
use crate::ids::QueryId;
use crate::types::{DrillPbError, QueryResult, QueryState};

/// Teardown of whatever resources back the root fragment's execution
/// context. This crate only defines the shape of the interaction; the
/// executor crate that actually owns the allocator would implement it.
pub trait QueryContextCloser: Send + Sync {
    fn close(&self) -> Result<(), ForemanError>;
}

/// Everything `close()` needs that isn't already held by [`ForemanResult`]
/// itself. Grouped into one struct rather than a long parameter list.
pub struct CloseContext {
    pub bus: Arc<WorkEventBus>,
    pub cluster_coordinator: Arc<dyn ClusterCoordinator>,
    pub membership_listener: Option<Arc<dyn DrillbitStatusListener>>,
    pub query_context: Option<Arc<dyn QueryContextCloser>>,
    pub persistent_store: Arc<dyn PersistentStore>,
    pub user_client: Arc<dyn UserClientConnection>,
    pub lease: Option<LeaseRef>,
    /// A human-readable dump of each fragment's last-known state, built by
    /// the `QueryManager`, for the step-1 log line.
    pub fragment_state_summary: String,
}

/// Precondition for `stage`/`close` calls: `closed ⇒ a final result was
/// dispatched`; `resultState` is set exactly once before close except for
/// the one sanctioned re-stage described below.
pub struct ForemanResult {
    query_id: QueryId,
    staged: Option<(QueryState, Option<ForemanError>)>,
    closed: bool,
    last_recorded_state: Option<QueryState>,
}

impl ForemanResult {
    pub fn new(query_id: QueryId) -> Self {
        Self {
            query_id,
            staged: None,
            closed: false,
            last_recorded_state: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn staged_state(&self) -> Option<QueryState> {
        self.staged.as_ref().map(|(s, _)| *s)
    }

    /// Stages the outcome that `close()` will report. `state` must be
    /// `COMPLETED` or `CANCELED` when `cause` is `None`; pass `Failed` with a
    /// cause for `setFailed`-equivalent calls.
    ///
    /// Normally this is called exactly once (precondition `!closed &&
    /// staged.is_none()`), enforced here by returning an error. The one
    /// exception is the CANCELLATION_REQUESTED → FAILED path: a
    /// terminal failure arriving while a CANCELED outcome is already staged
    /// must *promote* the staged outcome to FAILED rather than being
    /// rejected. Callers making that promotion call [`Self::stage`] again
    /// knowingly; this function allows re-staging only when the new state is
    /// `Failed`, logging the promotion rather than silently overwriting a
    /// non-failure outcome.
    pub fn stage(&mut self, state: QueryState, cause: Option<ForemanError>) -> Result<(), ForemanError> {
        if self.closed {
            return Err(ForemanError::setup("cannot stage a result after close()"));
        }
        match &self.staged {
            None => {
                self.staged = Some((state, cause));
                Ok(())
            }
            Some((previous, _)) if state == QueryState::Failed && *previous != QueryState::Failed => {
                debug!(
                    query_id = %self.query_id,
                    from = %previous,
                    "promoting staged query result to FAILED on late terminal failure",
                );
                self.staged = Some((state, cause));
                Ok(())
            }
            Some(_) => Err(ForemanError::setup(
                "ForemanResult already staged; a result may only be staged once (except promotion to FAILED)",
            )),
        }
    }

    /// Runs the exactly-once cleanup-and-respond sequence. All of
    /// steps 2 through 7 run even if an earlier one failed; failures are
    /// accumulated and logged, and two of the steps (closing the query
    /// context, persisting the final state) additionally promote the
    /// reported outcome to FAILED if they themselves fail.
    pub async fn close(&mut self, mut ctx: CloseContext) {
        if self.closed {
            warn!(query_id = %self.query_id, "ForemanResult::close called more than once, ignoring");
            return;
        }
        let (mut state, mut cause) = self
            .staged
            .take()
            .unwrap_or((QueryState::Failed, Some(ForemanError::setup("closed without a staged result"))));

        let mut suppressed: Vec<ForemanError> = Vec::new();

        // 1. Log current fragment-state summary.
        info!(query_id = %self.query_id, summary = %ctx.fragment_state_summary, "closing query");

        // 2. Unregister the query's fragment status listener from the bus
        // and the cluster coordinator.
        ctx.bus.unregister_listener(self.query_id);
        if let Some(listener) = ctx.membership_listener.take() {
            ctx.cluster_coordinator.remove_membership_listener(listener);
        }

        // 3. Close the query context (suppressing & promoting to FAILED on
        // error).
        if let Some(qctx) = ctx.query_context.take() {
            if let Err(e) = qctx.close() {
                suppressed.push(e);
                state = QueryState::Failed;
            }
        }

        // 4. If the latest staged state differs from the currently-recorded
        // state, attempt to persist it (suppressing & promoting on error).
        if self.last_recorded_state != Some(state) {
            if let Err(e) = ctx.persistent_store.record_state(self.query_id, state).await {
                suppressed.push(e);
                state = QueryState::Failed;
            } else {
                self.last_recorded_state = Some(state);
            }
        }

        // 5. Build the final QueryResult. Root-cause message is extracted
        // from the exception chain.
        let errors = if state == QueryState::Failed {
            let message = cause
                .take()
                .map(|e| e.root_cause_message())
                .unwrap_or_else(|| "query failed".to_string());
            vec![DrillPbError { message }]
        } else {
            Vec::new()
        };
        let result = QueryResult {
            query_id: self.query_id,
            query_state: state,
            is_last_chunk: true,
            errors,
        };

        // 6. Attempt to send the result to the client; failure is attached as
        // suppressed but does not change the result on the wire.
        if let Err(e) = ctx.user_client.send_result(result).await {
            suppressed.push(e);
        }

        // 7. Release the admission lease.
        if let Some(lease) = ctx.lease.take() {
            crate::admission::AdmissionController::release(lease);
        }

        if !suppressed.is_empty() {
            warn!(
                query_id = %self.query_id,
                suppressed = suppressed.len(),
                "ForemanResult::close encountered non-fatal errors during cleanup: {:?}",
                suppressed.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
            );
        }

        // 8. Mark closed.
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_twice_with_same_non_failed_kind_is_rejected() {
        let mut r = ForemanResult::new(QueryId::new(0, 1));
        r.stage(QueryState::Completed, None).unwrap();
        let err = r.stage(QueryState::Completed, None).unwrap_err();
        assert_matches::assert_matches!(err, ForemanError::Setup(_));
    }

    #[test]
    fn staging_failed_over_an_already_staged_canceled_result_is_a_promotion() {
        let mut r = ForemanResult::new(QueryId::new(0, 1));
        r.stage(QueryState::Canceled, None).unwrap();
        r.stage(QueryState::Failed, Some(ForemanError::setup("boom")))
            .unwrap();
        assert_eq!(r.staged_state(), Some(QueryState::Failed));
    }

    #[test]
    fn stage_after_close_is_rejected() {
        let mut r = ForemanResult::new(QueryId::new(0, 1));
        r.closed = true;
        let err = r.stage(QueryState::Completed, None).unwrap_err();
        assert_matches::assert_matches!(err, ForemanError::Setup(_));
    }
}
