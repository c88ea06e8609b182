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

//! Error taxonomy.
//!
//! `ForemanSetup` and `FragmentSetup` are the two synchronous failure shapes
//! callers see directly; `Rpc` wraps asynchronous submission/result-send
//! failures that get routed back into the state machine rather than returned.
//! `DuplicateListener`/`DuplicateManager` are programming errors in the
//! [`crate::bus::WorkEventBus`] and are treated as fatal by callers.

use crate::ids::{FragmentHandle, QueryId};

pub type ForemanResult<T> = std::result::Result<T, ForemanError>;

#[derive(Debug, thiserror::Error)]
pub enum ForemanError {
    /// Synchronous setup failure: planning, admission, or the intermediate
    /// dispatch barrier reporting at least one failure.
    #[error("foreman setup failed: {0}")]
    Setup(String),

    /// An inbound control message referred to a fragment whose manager is
    /// neither registered nor recently finished.
    #[error(
        "fragment setup error for {handle}: non-leaf fragments are sent first, \
         so the manager must be present by now"
    )]
    FragmentSetup { handle: FragmentHandle },

    /// Asynchronous submission or result-send failure.
    #[error("rpc failure: {0}")]
    Rpc(#[source] anyhow::Error),

    #[error("a status listener is already registered for query {0}")]
    DuplicateListener(QueryId),

    #[error("a fragment manager is already registered for handle {0}")]
    DuplicateManager(FragmentHandle),

    /// Surfaced by collaborators; wrapped so every fallible boundary in this
    /// crate can return a single error type.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ForemanError {
    pub fn setup(msg: impl Into<String>) -> Self {
        ForemanError::Setup(msg.into())
    }

    pub fn rpc(err: impl Into<anyhow::Error>) -> Self {
        ForemanError::Rpc(err.into())
    }

    /// The root-cause message, walking the `source()` chain. Used to build the
    /// single `DrillPBError` on the final `QueryResult`.
    pub fn root_cause_message(&self) -> String {
        let mut cause: &dyn std::error::Error = self;
        while let Some(next) = cause.source() {
            cause = next;
        }
        cause.to_string()
    }
}

/// Out-of-memory is fatal for the process: the core cannot safely
/// continue with corrupted allocator accounting, so this terminates rather
/// than returning a `Result`. Not part of [`ForemanError`] on purpose.
pub fn abort_on_oom(context: &str) -> ! {
    error!(context, "out of memory, aborting process");
    std::process::abort()
}
