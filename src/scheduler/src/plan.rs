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

//! Plan fragments, stages and the stage graph that links them (`spec.md` §3, §4.7). The
//! scheduler consumes an already-compiled tree of [`PlanFragment`]s; turning SQL into a plan
//! is out of scope here, as it is for the teacher's `BatchPlanFragmenter`.

use std::collections::{HashMap, HashSet};

use sched_common::{BucketId, PartitionId, StageId};

use crate::task::CatalogHandle;

/// A node identifier within a single fragment's plan tree, used to key a task's input splits
/// by which plan-node they feed (`spec.md` §3).
pub type PlanNodeId = u32;

/// How a fragment's output is partitioned across its tasks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PartitioningHandle {
    /// Exactly one task, partition 0.
    Single,
    /// Exactly one task, pinned to the coordinator.
    Coordinator,
    /// Exactly `partition_count` tasks/partitions, fed by `bucket_count` hash buckets folded
    /// down via the per-query bucket-to-partition cache. `bucket_count >= partition_count`.
    /// `catalog_handle` is `None` for `FIXED_HASH_DISTRIBUTION` (identity mapping); `Some` for a
    /// catalog-bound distribution, whose bucket-to-node map is fetched through
    /// [`crate::external::NodePartitioningManager`] (`spec.md` §4.8 step 2).
    Hash {
        partition_count: u32,
        bucket_count: u32,
        catalog_handle: Option<CatalogHandle>,
    },
    /// An unbounded number of tasks, packed by upstream exchange byte size.
    Arbitrary,
    /// An unbounded number of tasks, driven by a connector split source.
    Source,
}

/// The source-scan half of a `SOURCE`-distributed fragment: which plan node is the table scan,
/// so the stage scheduler knows which plan-node id to route the connector's splits to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableScanSource {
    pub plan_node_id: PlanNodeId,
}

/// A compiled fragment of a query plan, before it has been turned into a runtime [`Stage`].
#[derive(Clone, Debug)]
pub struct PlanFragment {
    pub id: StageId,
    pub partitioning: PartitioningHandle,
    pub children: Vec<StageId>,
    pub table_scan: Option<TableScanSource>,
}

impl PlanFragment {
    pub fn is_output_fragment(&self, root_id: StageId) -> bool {
        self.id == root_id
    }
}

/// Runtime lifecycle of a [`Stage`] (`spec.md` §3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageLifecycle {
    Planned,
    Scheduling,
    Running,
    Finished,
    Failed,
    Aborted,
}

impl StageLifecycle {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StageLifecycle::Finished | StageLifecycle::Failed | StageLifecycle::Aborted
        )
    }
}

/// A runtime instance of a [`PlanFragment`].
#[derive(Clone, Debug)]
pub struct Stage {
    pub id: StageId,
    pub fragment: PlanFragment,
}

impl Stage {
    pub fn has_table_scan(&self) -> bool {
        self.fragment.table_scan.is_some()
    }
}

/// Maintains how stages are connected, mirroring `BatchPlanFragmenter`'s `StageGraph`: child
/// edges are used to split the plan into stages top-down, parent edges to schedule them
/// bottom-up.
#[derive(Debug)]
pub struct StageGraph {
    pub root_stage_id: StageId,
    pub stages: HashMap<StageId, Stage>,
    child_edges: HashMap<StageId, HashSet<StageId>>,
    parent_edges: HashMap<StageId, HashSet<StageId>>,
}

impl StageGraph {
    pub fn get_stage(&self, stage_id: StageId) -> &Stage {
        self.stages
            .get(&stage_id)
            .unwrap_or_else(|| panic!("unknown stage {stage_id}"))
    }

    pub fn children(&self, stage_id: StageId) -> &HashSet<StageId> {
        self.child_edges
            .get(&stage_id)
            .unwrap_or_else(|| panic!("unknown stage {stage_id}"))
    }

    pub fn parents(&self, stage_id: StageId) -> &HashSet<StageId> {
        self.parent_edges
            .get(&stage_id)
            .unwrap_or_else(|| panic!("unknown stage {stage_id}"))
    }

    pub fn leaf_stages(&self) -> Vec<StageId> {
        self.stages
            .keys()
            .copied()
            .filter(|id| self.children(*id).is_empty())
            .collect()
    }

    /// Stage ids such that every child appears before its parent. The query scheduler drives
    /// construction of per-stage exchanges in this order (`spec.md` §4.8 step 1).
    pub fn stage_ids_by_topo_order(&self) -> Vec<StageId> {
        let mut stack = vec![self.root_stage_id];
        let mut ret = Vec::with_capacity(self.stages.len());
        let mut seen = HashSet::with_capacity(self.stages.len());

        while let Some(s) = stack.pop() {
            if seen.insert(s) {
                ret.push(s);
                stack.extend(self.children(s).iter().copied());
            }
        }

        ret.reverse();
        ret
    }
}

/// Builds a [`StageGraph`] from a flat list of [`PlanFragment`]s, one fragment per stage
/// (`spec.md`'s scheduler treats fragment and stage ids as the same space; a fragment becomes
/// exactly one stage).
pub struct StageGraphBuilder {
    root_stage_id: StageId,
    stages: HashMap<StageId, Stage>,
    child_edges: HashMap<StageId, HashSet<StageId>>,
    parent_edges: HashMap<StageId, HashSet<StageId>>,
}

impl StageGraphBuilder {
    pub fn new(root_stage_id: StageId) -> Self {
        Self {
            root_stage_id,
            stages: HashMap::new(),
            child_edges: HashMap::new(),
            parent_edges: HashMap::new(),
        }
    }

    pub fn add_fragment(&mut self, fragment: PlanFragment) {
        let id = fragment.id;
        let children: Vec<StageId> = fragment.children.clone();
        self.stages.insert(
            id,
            Stage {
                id,
                fragment,
            },
        );
        self.child_edges.entry(id).or_default();
        self.parent_edges.entry(id).or_default();
        for child in children {
            self.child_edges.entry(id).or_default().insert(child);
            self.parent_edges.entry(child).or_default().insert(id);
        }
    }

    pub fn build(self) -> StageGraph {
        StageGraph {
            root_stage_id: self.root_stage_id,
            stages: self.stages,
            child_edges: self.child_edges,
            parent_edges: self.parent_edges,
        }
    }
}

/// Per-query cache mapping a hash bucket to the partition id it belongs to. `spec.md` §4.8
/// step 2 requires that, for the same partitioning handle, every stage in a query agree on
/// this mapping — it is computed once and shared.
#[derive(Clone, Debug)]
pub struct BucketToPartition {
    map: Vec<PartitionId>,
}

impl BucketToPartition {
    /// `FIXED_HASH_DISTRIBUTION`: identity over `[0, partition_count)`.
    pub fn identity(partition_count: u32) -> Self {
        Self {
            map: (0..partition_count).collect(),
        }
    }

    /// A catalog-bound handle: one partition per distinct node in `node_for_bucket`'s image,
    /// assigned in the stable order nodes are first seen.
    pub fn from_bucket_node_map(node_for_bucket: &[u32]) -> Self {
        let mut node_to_partition: HashMap<u32, PartitionId> = HashMap::new();
        let mut next_partition = 0u32;
        let mut map = Vec::with_capacity(node_for_bucket.len());
        for &node in node_for_bucket {
            let partition = *node_to_partition.entry(node).or_insert_with(|| {
                let p = next_partition;
                next_partition += 1;
                p
            });
            map.push(partition);
        }
        Self { map }
    }

    pub fn partition_for(&self, bucket: BucketId) -> PartitionId {
        self.map[bucket as usize]
    }

    pub fn bucket_count(&self) -> usize {
        self.map.len()
    }
}
