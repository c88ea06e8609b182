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

//! Gate on a cluster-coordinated semaphore: distinguishes small vs
//! large queries by total plan cost and blocks the calling task until a slot
//! is free, or until `exec.queue.timeout_millis` elapses.

use std::sync::Arc;

use crate::collab::{ClusterCoordinator, Lease, LeaseRef};
use crate::config::QueueConfig;
use crate::error::{ForemanError, ForemanResult};

const SMALL_QUEUE_NAME: &str = "query.small";
const LARGE_QUEUE_NAME: &str = "query.large";

pub struct AdmissionController {
    coordinator: Arc<dyn ClusterCoordinator>,
    config: QueueConfig,
}

impl AdmissionController {
    pub fn new(coordinator: Arc<dyn ClusterCoordinator>, config: QueueConfig) -> Self {
        Self { coordinator, config }
    }

    /// Acquires a lease for a query of the given total plan cost. Returns
    /// `Ok(None)` if queuing is disabled (no-op, no lease).
    pub async fn acquire(&self, total_cost: i64) -> ForemanResult<Option<LeaseRef>> {
        if !self.config.enable {
            return Ok(None);
        }

        let (name, capacity) = if total_cost > self.config.threshold {
            (LARGE_QUEUE_NAME, self.config.large)
        } else {
            (SMALL_QUEUE_NAME, self.config.small)
        };

        let semaphore = self.coordinator.get_semaphore(name, capacity).await?;
        let lease = semaphore
            .acquire(self.config.timeout())
            .await
            .map_err(|_| ForemanError::setup("Unable to acquire slot"))?;
        Ok(Some(lease))
    }

    /// Attempts to release a previously acquired lease, retrying on
    /// interruption, logging on any other failure and then giving up — the
    /// lease will eventually expire cluster-side.
    ///
    /// `close` on our `Lease` trait is synchronous and non-interruptible by
    /// construction (no blocking OS-level wait to retry), so this makes a
    /// single best-effort attempt and logs failure rather than looping
    /// forever on an error that will never resolve.
    pub fn release(lease: LeaseRef) {
        if let Err(e) = lease.close() {
            warn!(error = %e, "failed to release admission lease, it will eventually expire cluster-side");
        }
    }
}
