// Copyright 2022 Singularity Data
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt::{Display, Formatter};

use uuid::Uuid;

/// Uniquely identifies a query for the lifetime of the coordinator process.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct QueryId {
    pub id: String,
}

impl Default for QueryId {
    fn default() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
        }
    }
}

impl Display for QueryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "query:{}", self.id)
    }
}

/// Stages are numbered in the order the fragmenter discovers them; the root stage of a query
/// is always the highest id produced by [`crate`] consumers, never a fixed sentinel.
pub type StageId = u32;

/// A task is one partition of a stage. Successive attempts at the same partition share a
/// `TaskId` and are distinguished by `AttemptId`.
pub type TaskId = u32;

pub type PartitionId = u32;

pub type AttemptId = u32;

/// Fine-grained hash bucket from the plan; see `HashDistribution` for how buckets collapse
/// into partitions.
pub type BucketId = u32;
