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

//! Core data model: plan fragments, the planner's output unit, query state,
//! and fragment status reports.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ids::{FragmentHandle, QueryId};

/// A cluster node's network identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Opaque serialized operator tree. Expression codegen and operator
/// implementations are out of scope; this crate only moves the bytes
/// between the planner, dispatcher and bus.
pub type SerializedOperatorTree = Vec<u8>;

/// One fragment's assignment, handle, leaf/intermediate flag, serialized
/// operator tree, memory budget and originating-query metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanFragment {
    pub handle: FragmentHandle,
    pub assignment: Endpoint,
    pub is_leaf: bool,
    pub operator_tree: SerializedOperatorTree,
    pub initial_memory_budget: u64,
    pub max_memory_budget: u64,
    /// Milliseconds since the epoch at which the originating query began.
    pub query_start_time_millis: i64,
    pub query_time_zone: String,
    pub options: HashMap<String, String>,
}

impl PlanFragment {
    pub fn is_root(&self) -> bool {
        self.handle.major_fragment_id == 0
    }
}

/// The planner's output: a root fragment plus the non-root fragments of the
/// plan, all endpoint-assigned.
///
/// Invariant: `root_fragment.handle.query_id == query_id` for the Foreman that
/// requested the plan.
#[derive(Debug, Clone)]
pub struct QueryWorkUnit {
    pub root_fragment: PlanFragment,
    pub root_operator: SerializedOperatorTree,
    pub fragments: Vec<PlanFragment>,
}

impl QueryWorkUnit {
    /// Checks that every fragment belongs to this query. Callers (the
    /// Foreman) must call this right after planning and treat a violation
    /// as a setup bug, not a user error.
    pub fn check_invariant(&self, query_id: QueryId) -> bool {
        self.root_fragment.handle.query_id == query_id
    }

    pub fn non_root_intermediates(&self) -> impl Iterator<Item = &PlanFragment> {
        self.fragments.iter().filter(|f| !f.is_leaf)
    }

    pub fn non_root_leaves(&self) -> impl Iterator<Item = &PlanFragment> {
        self.fragments.iter().filter(|f| f.is_leaf)
    }
}

/// Per-query lifecycle state. Terminal states are `Canceled`,
/// `Completed` and `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryState {
    Pending,
    Running,
    CancellationRequested,
    Canceled,
    Completed,
    Failed,
}

impl QueryState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            QueryState::Canceled | QueryState::Completed | QueryState::Failed
        )
    }

    /// Table of legal transitions. `move_to_state` consults this
    /// before doing anything else.
    pub fn can_transition_to(self, next: QueryState) -> bool {
        use QueryState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, CancellationRequested)
                | (Running, Completed)
                | (Running, Failed)
                | (CancellationRequested, Canceled)
                | (CancellationRequested, Completed)
                | (CancellationRequested, Failed)
        )
    }
}

impl std::fmt::Display for QueryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            QueryState::Pending => "PENDING",
            QueryState::Running => "RUNNING",
            QueryState::CancellationRequested => "CANCELLATION_REQUESTED",
            QueryState::Canceled => "CANCELED",
            QueryState::Completed => "COMPLETED",
            QueryState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// The terminal/in-flight progress of a fragment tracked by one fragment
/// handle, as last reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FragmentRunState {
    Submitted,
    Running,
    Finished,
    Canceled,
    Failed,
}

impl FragmentRunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FragmentRunState::Finished | FragmentRunState::Canceled | FragmentRunState::Failed
        )
    }
}

#[derive(Debug, Clone)]
pub struct FragmentStatus {
    pub handle: FragmentHandle,
    pub state: FragmentRunState,
    /// Free-form execution profile (row counts, bytes, timings); opaque here
    /// since operator internals are out of scope.
    pub profile: Vec<u8>,
    pub error: Option<String>,
}

/// `RunQuery { type, plan }`: the client's initial submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunQuery {
    pub query_type: QueryType,
    pub plan: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryType {
    Logical,
    Physical,
    Sql,
}

/// `InitializeFragments { repeated PlanFragment }`: one batched message
/// per (phase × endpoint).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeFragments {
    pub fragments: Vec<PlanFragment>,
}

/// A single error reported back to the client on a failed query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrillPbError {
    pub message: String,
}

/// The final message sent to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub query_id: QueryId,
    pub query_state: QueryState,
    pub is_last_chunk: bool,
    pub errors: Vec<DrillPbError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transition_table_matches_spec_diagram() {
        use QueryState::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(CancellationRequested));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(CancellationRequested.can_transition_to(Canceled));
        assert!(CancellationRequested.can_transition_to(Completed));
        assert!(CancellationRequested.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Canceled.can_transition_to(Failed));
        assert!(!Running.can_transition_to(Pending));
    }

    #[test]
    fn terminal_states_are_exactly_canceled_completed_failed() {
        assert!(QueryState::Canceled.is_terminal());
        assert!(QueryState::Completed.is_terminal());
        assert!(QueryState::Failed.is_terminal());
        assert!(!QueryState::Pending.is_terminal());
        assert!(!QueryState::Running.is_terminal());
        assert!(!QueryState::CancellationRequested.is_terminal());
    }
}
