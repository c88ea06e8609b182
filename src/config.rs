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

//! Configuration knobs grouped into typed, `serde`-deserializable structs,
//! one per section, each field carrying its own `#[serde(default)]`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_threshold() -> i64 {
    1_000_000
}

fn default_small_queue() -> i32 {
    1000
}

fn default_large_queue() -> i32 {
    10
}

fn default_queue_timeout_millis() -> i64 {
    60_000
}

/// `exec.queue.*` knobs consumed by [`crate::admission::AdmissionController`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(rename = "exec.queue.enable", default = "default_true")]
    pub enable: bool,
    #[serde(rename = "exec.queue.threshold", default = "default_threshold")]
    pub threshold: i64,
    #[serde(rename = "exec.queue.small", default = "default_small_queue")]
    pub small: i32,
    #[serde(rename = "exec.queue.large", default = "default_large_queue")]
    pub large: i32,
    #[serde(
        rename = "exec.queue.timeout_millis",
        default = "default_queue_timeout_millis"
    )]
    pub timeout_millis: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enable: default_true(),
            threshold: default_threshold(),
            small: default_small_queue(),
            large: default_large_queue(),
            timeout_millis: default_queue_timeout_millis(),
        }
    }
}

impl QueueConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_millis.max(0) as u64)
    }
}

/// `planner.*` knobs. The core only forwards these to the `FragmentPlanner`
/// collaborator — planning itself is out of scope, so they are
/// not interpreted here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlannerConfig {
    #[serde(rename = "planner.width.max_per_node", default)]
    pub max_width_per_node: Option<i64>,
    #[serde(rename = "planner.memory.max_query_memory_per_node", default)]
    pub max_query_memory_per_node: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForemanConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_named_knobs_from_json() {
        let json = serde_json::json!({
            "queue": {
                "exec.queue.enable": false,
                "exec.queue.threshold": 5000,
                "exec.queue.small": 4,
                "exec.queue.large": 2,
                "exec.queue.timeout_millis": 10
            },
            "planner": {
                "planner.width.max_per_node": 8,
                "planner.memory.max_query_memory_per_node": 1024
            }
        });
        let cfg: ForemanConfig = serde_json::from_value(json).unwrap();
        assert!(!cfg.queue.enable);
        assert_eq!(cfg.queue.threshold, 5000);
        assert_eq!(cfg.planner.max_width_per_node, Some(8));
    }

    #[test]
    fn defaults_enable_queueing() {
        let cfg = ForemanConfig::default();
        assert!(cfg.queue.enable);
    }
}
