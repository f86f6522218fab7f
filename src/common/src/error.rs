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

use thiserror::Error;

use crate::ids::{AttemptId, PartitionId, QueryId, StageId};

/// Why a task attempt failed, independent of which attempt or partition it was. This is the
/// taxonomy the stage scheduler's retry protocol switches on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskFailureKind {
    /// Network error, process crash, node lost. Counted against the retry budgets.
    Transient,
    /// Worker ran out of memory executing the task. Counted; the memory estimator must
    /// strictly increase its estimate for the next attempt.
    OutOfMemory,
    /// Bad input, a plan error surfaced by the worker. Never retried.
    UserError,
    /// A scheduler-internal invariant was violated. Never retried, always fatal.
    InvariantViolation,
}

impl TaskFailureKind {
    /// Whether this failure kind is retried at all (subject to the per-task and overall
    /// budgets) as opposed to failing the stage immediately.
    pub fn is_retriable(self) -> bool {
        matches!(self, TaskFailureKind::Transient | TaskFailureKind::OutOfMemory)
    }
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("user error: {0}")]
    UserError(String),

    #[error(
        "task failed beyond retry budget: stage={stage} partition={partition} attempt={attempt} kind={kind:?}"
    )]
    TaskFailed {
        stage: StageId,
        partition: PartitionId,
        attempt: AttemptId,
        kind: TaskFailureKind,
        #[source]
        cause: anyhow::Error,
    },

    #[error("task descriptor storage for {query_id} exceeded its memory cap")]
    DescriptorStorageOverflow { query_id: QueryId },

    #[error("scheduler invariant violated: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
