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

//! Identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque, globally unique identifier for a query.
///
/// Newtyped over a 128-bit value (high/low `u64` pair) the way the wider
/// ecosystem wraps UUID-shaped trace ids, rather than a bare `Uuid` — this
/// keeps `QueryId` `Copy` and lets the hex `Display` form match the fragment
/// handle identifier format exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryId {
    hi: u64,
    lo: u64,
}

impl QueryId {
    pub fn new(hi: u64, lo: u64) -> Self {
        Self { hi, lo }
    }

    pub fn generate() -> Self {
        let id = uuid::Uuid::new_v4();
        let (hi, lo) = id.as_u64_pair();
        Self { hi, lo }
    }

    /// Lowercase hex form used in fragment handle identifiers.
    pub fn as_hex(&self) -> String {
        format!("{:016x}{:016x}", self.hi, self.lo)
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_hex())
    }
}

/// Identifies one fragment instance on one node: `(QueryId, majorFragmentId,
/// minorFragmentId)`. Equality by all three fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FragmentHandle {
    pub query_id: QueryId,
    pub major_fragment_id: i32,
    pub minor_fragment_id: i32,
}

impl FragmentHandle {
    pub fn new(query_id: QueryId, major_fragment_id: i32, minor_fragment_id: i32) -> Self {
        Self {
            query_id,
            major_fragment_id,
            minor_fragment_id,
        }
    }
}

/// `"<queryIdHex>:<majorId>:<minorId>"`, the format used for logs and map keys
///.
impl fmt::Display for FragmentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.query_id.as_hex(),
            self.major_fragment_id,
            self.minor_fragment_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_handle_equality_is_by_all_three_fields() {
        let q1 = QueryId::new(1, 2);
        let q2 = QueryId::new(1, 3);
        let a = FragmentHandle::new(q1, 0, 0);
        let b = FragmentHandle::new(q1, 0, 1);
        let c = FragmentHandle::new(q2, 0, 0);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, FragmentHandle::new(q1, 0, 0));
    }

    #[test]
    fn display_format_matches_log_key_spec() {
        let handle = FragmentHandle::new(QueryId::new(0, 1), 2, 3);
        let s = handle.to_string();
        assert!(s.ends_with(":2:3"));
        assert_eq!(s.matches(':').count(), 2);
    }
}
