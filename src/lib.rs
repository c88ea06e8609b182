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

//! Query coordination core for a distributed SQL execution engine.
//!
//! This crate implements the Foreman: the per-query state machine that plans a
//! query into fragments, dispatches them across the cluster, tracks their
//! lifecycle to a terminal state and returns exactly one result to the
//! client. SQL parsing, plan optimization, operator execution and wire
//! framing are modeled as collaborator traits in [`collab`] and are not
//! implemented here.

#[macro_use]
extern crate tracing;

pub mod admission;
pub mod bus;
pub mod collab;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod fault;
pub mod foreman;
pub mod ids;
pub mod query_manager;
pub mod result;
pub mod types;

pub use error::ForemanError;
pub use foreman::Foreman;
pub use ids::{FragmentHandle, QueryId};
pub use result::ForemanResult;
pub use types::{FragmentStatus, PlanFragment, QueryState, QueryWorkUnit};

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, error::ForemanError>;
