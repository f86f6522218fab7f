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

//! Predicts initial and post-failure memory per partition (`spec.md` §4.4).

use sched_common::{DataSize, PartitionId, TaskFailureKind};

/// `initial_estimate`/`on_failure` per `spec.md` §4.4. On an out-of-memory failure the
/// returned estimate must strictly exceed the previous one; other failure kinds may keep the
/// estimate unchanged or shrink it.
pub trait PartitionMemoryEstimator: Send + Sync {
    fn initial_estimate(&self, partition_id: PartitionId) -> DataSize;

    fn on_failure(&self, previous_estimate: DataSize, failure_kind: TaskFailureKind) -> DataSize;
}

/// Doubles the estimate on every out-of-memory failure, capped at `max_estimate`; leaves the
/// estimate unchanged on other retriable failures. Every partition starts at `initial_estimate`
/// regardless of id, mirroring the teacher's flat per-stage memory budget before any attempt
/// has run.
pub struct GrowthMemoryEstimator {
    initial_estimate: DataSize,
    max_estimate: DataSize,
    growth_factor: u64,
}

impl GrowthMemoryEstimator {
    pub fn new(initial_estimate: DataSize, max_estimate: DataSize, growth_factor: u64) -> Self {
        Self {
            initial_estimate,
            max_estimate,
            growth_factor,
        }
    }
}

impl PartitionMemoryEstimator for GrowthMemoryEstimator {
    fn initial_estimate(&self, _partition_id: PartitionId) -> DataSize {
        self.initial_estimate
    }

    fn on_failure(&self, previous_estimate: DataSize, failure_kind: TaskFailureKind) -> DataSize {
        match failure_kind {
            TaskFailureKind::OutOfMemory => {
                let grown = previous_estimate.saturating_mul(self.growth_factor);
                let grown = if grown > previous_estimate {
                    grown
                } else {
                    // growth_factor of 0 or 1 would otherwise violate the strict-increase rule.
                    DataSize(previous_estimate.bytes() + 1)
                };
                grown.min(self.max_estimate)
            }
            _ => previous_estimate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_estimate_is_flat() {
        let estimator = GrowthMemoryEstimator::new(DataSize(100), DataSize(1_000), 2);
        assert_eq!(estimator.initial_estimate(0), DataSize(100));
        assert_eq!(estimator.initial_estimate(7), DataSize(100));
    }

    #[test]
    fn out_of_memory_strictly_grows() {
        let estimator = GrowthMemoryEstimator::new(DataSize(100), DataSize(1_000), 2);
        let next = estimator.on_failure(DataSize(100), TaskFailureKind::OutOfMemory);
        assert!(next > DataSize(100));
        assert_eq!(next, DataSize(200));
    }

    #[test]
    fn out_of_memory_growth_is_capped() {
        let estimator = GrowthMemoryEstimator::new(DataSize(100), DataSize(150), 2);
        let next = estimator.on_failure(DataSize(100), TaskFailureKind::OutOfMemory);
        assert_eq!(next, DataSize(150));
    }

    #[test]
    fn transient_failure_does_not_change_estimate() {
        let estimator = GrowthMemoryEstimator::new(DataSize(100), DataSize(1_000), 2);
        let next = estimator.on_failure(DataSize(250), TaskFailureKind::Transient);
        assert_eq!(next, DataSize(250));
    }
}
