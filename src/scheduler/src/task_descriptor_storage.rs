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

//! Durable index of in-flight task descriptors per query, bounded by memory (`spec.md` §4.5).
//! Shared across every query the coordinator runs; state is partitioned by [`QueryId`] so
//! queries never see each other's descriptors, following `spec.md` §9's "scoped per-query
//! lifecycle rather than singletons" design note.

use std::collections::HashMap;

use parking_lot::Mutex;
use sched_common::{DataSize, PartitionId, QueryId, Result, SchedulerError, StageId};

use crate::task::TaskDescriptor;

/// A task's identity within a query: the pair of stage and partition id (`spec.md` §3
/// "successive attempts at the same partition share a TaskId"). The storage is shared by every
/// stage of a query under one [`QueryId`], so `partition_id` alone is not unique — two stages
/// both number their partitions from zero.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub stage_id: StageId,
    pub partition_id: PartitionId,
}

impl TaskKey {
    pub fn new(stage_id: StageId, partition_id: PartitionId) -> Self {
        Self { stage_id, partition_id }
    }
}

fn descriptor_size(descriptor: &TaskDescriptor) -> DataSize {
    // A real implementation would size the serialized splits; this crate only owns the
    // scheduling logic, so it approximates with the already-computed split weight plus a
    // fixed per-descriptor overhead for the node requirement and bookkeeping fields.
    DataSize(descriptor.total_weight().bytes() + 256)
}

#[derive(Default)]
struct QueryDescriptors {
    by_task: HashMap<TaskKey, TaskDescriptor>,
    bytes_used: DataSize,
}

/// Per-query bounded store for [`TaskDescriptor`]s (`spec.md` §4.5). Thread-safe; `destroy` is
/// idempotent.
pub struct TaskDescriptorStorage {
    memory_cap: DataSize,
    queries: Mutex<HashMap<QueryId, QueryDescriptors>>,
}

impl TaskDescriptorStorage {
    pub fn new(memory_cap: DataSize) -> Self {
        Self {
            memory_cap,
            queries: Mutex::new(HashMap::new()),
        }
    }

    /// Registers `query_id` so it can subsequently accept `put`s. Idempotent.
    pub fn initialize(&self, query_id: QueryId) {
        self.queries.lock().entry(query_id).or_default();
    }

    /// Inserts or replaces `descriptor` under `task_key`. Rejects the insert with
    /// [`SchedulerError::DescriptorStorageOverflow`] once the query's memory cap would be
    /// exceeded; the stage scheduler translates that into a query-level failure (`spec.md`
    /// §4.5, §7.5).
    pub fn put(&self, query_id: &QueryId, task_key: TaskKey, descriptor: TaskDescriptor) -> Result<()> {
        let mut queries = self.queries.lock();
        let entry = queries.entry(query_id.clone()).or_default();

        let added = descriptor_size(&descriptor);
        let previous = entry.by_task.get(&task_key).map(descriptor_size).unwrap_or(DataSize::ZERO);
        let projected = DataSize(entry.bytes_used.bytes() - previous.bytes() + added.bytes());
        if projected > self.memory_cap {
            return Err(SchedulerError::DescriptorStorageOverflow {
                query_id: query_id.clone(),
            });
        }

        entry.bytes_used = projected;
        entry.by_task.insert(task_key, descriptor);
        Ok(())
    }

    pub fn get(&self, query_id: &QueryId, task_key: TaskKey) -> Option<TaskDescriptor> {
        self.queries
            .lock()
            .get(query_id)
            .and_then(|q| q.by_task.get(&task_key))
            .cloned()
    }

    /// Releases the descriptor for a terminal attempt (`spec.md` §3 Lifecycles). A no-op if
    /// the task, or the query itself, is already gone.
    pub fn remove(&self, query_id: &QueryId, task_key: TaskKey) {
        let mut queries = self.queries.lock();
        if let Some(entry) = queries.get_mut(query_id) {
            if let Some(descriptor) = entry.by_task.remove(&task_key) {
                let freed = descriptor_size(&descriptor);
                entry.bytes_used = DataSize(entry.bytes_used.bytes().saturating_sub(freed.bytes()));
            }
        }
    }

    /// Drops every descriptor for `query_id`. Idempotent.
    pub fn destroy(&self, query_id: &QueryId) {
        self.queries.lock().remove(query_id);
    }

    #[cfg(test)]
    fn bytes_used(&self, query_id: &QueryId) -> DataSize {
        self.queries
            .lock()
            .get(query_id)
            .map(|q| q.bytes_used)
            .unwrap_or(DataSize::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap as StdHashMap;

    use assert_matches::assert_matches;
    use sched_common::DataSize;

    use super::*;
    use crate::task::{NodeRequirement, TaskDescriptor};

    fn descriptor(partition_id: u32) -> TaskDescriptor {
        TaskDescriptor::new(partition_id, StdHashMap::new(), NodeRequirement::any(), DataSize::ZERO)
    }

    fn key(stage_id: StageId, partition_id: PartitionId) -> TaskKey {
        TaskKey::new(stage_id, partition_id)
    }

    #[test]
    fn put_get_remove_round_trip() {
        let storage = TaskDescriptorStorage::new(DataSize(1_000_000));
        let query_id = QueryId::default();
        storage.initialize(query_id.clone());

        storage.put(&query_id, key(0, 0), descriptor(0)).unwrap();
        assert_eq!(storage.get(&query_id, key(0, 0)).unwrap().partition_id, 0);

        storage.remove(&query_id, key(0, 0));
        assert!(storage.get(&query_id, key(0, 0)).is_none());
    }

    #[test]
    fn rejects_insert_once_cap_exceeded() {
        let storage = TaskDescriptorStorage::new(DataSize(300));
        let query_id = QueryId::default();
        storage.initialize(query_id.clone());

        storage.put(&query_id, key(0, 0), descriptor(0)).unwrap();
        let err = storage.put(&query_id, key(0, 1), descriptor(1)).unwrap_err();
        assert_matches!(err, SchedulerError::DescriptorStorageOverflow { .. });
    }

    #[test]
    fn destroy_is_idempotent_and_frees_all_state() {
        let storage = TaskDescriptorStorage::new(DataSize(1_000_000));
        let query_id = QueryId::default();
        storage.initialize(query_id.clone());
        storage.put(&query_id, key(0, 0), descriptor(0)).unwrap();

        storage.destroy(&query_id);
        storage.destroy(&query_id);
        assert_eq!(storage.bytes_used(&query_id), DataSize::ZERO);
        assert!(storage.get(&query_id, key(0, 0)).is_none());
    }

    #[test]
    fn replacing_a_descriptor_accounts_only_the_delta() {
        let storage = TaskDescriptorStorage::new(DataSize(600));
        let query_id = QueryId::default();
        storage.initialize(query_id.clone());

        storage.put(&query_id, key(0, 0), descriptor(0)).unwrap();
        let before = storage.bytes_used(&query_id);
        storage.put(&query_id, key(0, 0), descriptor(0)).unwrap();
        assert_eq!(storage.bytes_used(&query_id), before);
    }

    #[test]
    fn same_partition_id_in_different_stages_does_not_collide() {
        let storage = TaskDescriptorStorage::new(DataSize(1_000_000));
        let query_id = QueryId::default();
        storage.initialize(query_id.clone());

        storage.put(&query_id, key(0, 0), descriptor(0)).unwrap();
        storage.put(&query_id, key(1, 0), descriptor(0)).unwrap();

        storage.remove(&query_id, key(0, 0));
        assert!(storage.get(&query_id, key(0, 0)).is_none());
        assert!(storage.get(&query_id, key(1, 0)).is_some());
    }
}
