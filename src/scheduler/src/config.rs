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

use sched_common::DataSize;
use serde::{Deserialize, Serialize};

/// Recognized configuration options (`spec.md` §6), plus `arbitrary_distribution_target_partition_size`
/// which `spec.md`'s "Recognized options" list omits even though §4.2.2 requires it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default::task_retry_attempts_overall")]
    pub task_retry_attempts_overall: u32,

    #[serde(default = "default::task_retry_attempts_per_task")]
    pub task_retry_attempts_per_task: u32,

    #[serde(default = "default::max_tasks_waiting_for_node_per_stage")]
    pub max_tasks_waiting_for_node_per_stage: u32,

    #[serde(default = "default::fault_tolerant_execution_partition_count")]
    pub fault_tolerant_execution_partition_count: u32,

    #[serde(default = "default::target_partition_split_weight")]
    pub target_partition_split_weight: DataSize,

    #[serde(default = "default::target_partition_source_size")]
    pub target_partition_source_size: DataSize,

    #[serde(default = "default::arbitrary_distribution_target_partition_size")]
    pub arbitrary_distribution_target_partition_size: DataSize,

    #[serde(default = "default::split_batch_size")]
    pub split_batch_size: u32,

    #[serde(default = "default::min_splits_per_task")]
    pub min_splits_per_task: u32,

    #[serde(default = "default::max_splits_per_task")]
    pub max_splits_per_task: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        toml::from_str("").unwrap()
    }
}

mod default {
    use sched_common::DataSize;

    pub fn task_retry_attempts_overall() -> u32 {
        100
    }

    pub fn task_retry_attempts_per_task() -> u32 {
        4
    }

    pub fn max_tasks_waiting_for_node_per_stage() -> u32 {
        32
    }

    pub fn fault_tolerant_execution_partition_count() -> u32 {
        50
    }

    pub fn target_partition_split_weight() -> DataSize {
        DataSize(256 * 1024 * 1024)
    }

    pub fn target_partition_source_size() -> DataSize {
        DataSize(256 * 1024 * 1024)
    }

    pub fn arbitrary_distribution_target_partition_size() -> DataSize {
        DataSize(256 * 1024 * 1024)
    }

    pub fn split_batch_size() -> u32 {
        100
    }

    pub fn min_splits_per_task() -> u32 {
        1
    }

    pub fn max_splits_per_task() -> u32 {
        256
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.task_retry_attempts_per_task, 4);
        assert_eq!(config.min_splits_per_task, 1);
    }

    #[test]
    fn overrides_parse() {
        let config: SchedulerConfig = toml::from_str("task_retry_attempts_per_task = 9\n").unwrap();
        assert_eq!(config.task_retry_attempts_per_task, 9);
        assert_eq!(config.task_retry_attempts_overall, 100);
    }
}
