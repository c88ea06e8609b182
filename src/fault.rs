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

//! Fault-injection seam.
//!
//! The source this crate is modeled on references a process-wide
//! `ExceptionInjector` singleton. Here it is an injected dependency instead,
//! defaulting to a no-op, so tests can trip synchronous failures at named
//! points without any process-wide mutable state.

use std::sync::Arc;

use crate::error::ForemanResult;

/// A named injection point. Call sites pass a stable name; a test injector
/// can match on it to decide whether to fail.
pub trait ExceptionInjector: Send + Sync + std::fmt::Debug {
    /// Called at a named point in the Foreman's control flow. Returns `Ok(())`
    /// to proceed normally, or an error to simulate a failure at that point.
    fn inject(&self, site: &str) -> ForemanResult<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInjector;

impl ExceptionInjector for NoopInjector {
    fn inject(&self, _site: &str) -> ForemanResult<()> {
        Ok(())
    }
}

pub type InjectorRef = Arc<dyn ExceptionInjector>;

pub fn noop() -> InjectorRef {
    Arc::new(NoopInjector)
}
