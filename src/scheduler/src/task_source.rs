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

//! Turns a stage's input splits and upstream exchange handles into a lazy sequence of task
//! descriptors (`spec.md` §4.2). One [`TaskSource`] per distribution policy; dispatch is a
//! tagged enum rather than a trait-object hierarchy, per `spec.md` §9's "no inheritance
//! chains" design note.

use std::collections::HashMap;
use std::sync::Arc;

use sched_common::{BucketId, DataSize, PartitionId, Result};

use crate::external::ConnectorSplitSource;
use crate::plan::{BucketToPartition, PlanNodeId};
use crate::task::{
    ConnectorSplit, ExchangeSourceHandle, HostAddress, NodeRequirement, RemoteSplit, Split,
    TaskDescriptor,
};

/// Exchange-handle inputs shared by every distribution policy (`spec.md` §4.2 "Shared
/// construction parameter"): handles broadcast to every task, and handles already bucketed by
/// the downstream partition id they target (the producing stage wrote them through the same
/// per-query [`BucketToPartition`], so no further bucket lookup is needed here).
#[derive(Clone, Debug, Default)]
pub struct ExchangeInputs {
    pub replicated: HashMap<PlanNodeId, Vec<ExchangeSourceHandle>>,
    pub partitioned: HashMap<PlanNodeId, HashMap<PartitionId, Vec<ExchangeSourceHandle>>>,
}

impl ExchangeInputs {
    /// Builds the split map a task for `partition_id` should carry: one [`Split::Remote`] per
    /// plan node, wrapping that node's replicated handles plus whatever partitioned handles
    /// target this partition (`spec.md` §4.2.5).
    fn splits_for_partition(&self, partition_id: PartitionId) -> HashMap<PlanNodeId, Vec<Split>> {
        let mut out: HashMap<PlanNodeId, Vec<Split>> = HashMap::new();
        for (node, handles) in &self.replicated {
            if !handles.is_empty() {
                out.entry(*node).or_default().push(Split::Remote(RemoteSplit {
                    handles: handles.clone(),
                }));
            }
        }
        for (node, by_partition) in &self.partitioned {
            if let Some(handles) = by_partition.get(&partition_id) {
                if !handles.is_empty() {
                    out.entry(*node).or_default().push(Split::Remote(RemoteSplit {
                        handles: handles.clone(),
                    }));
                }
            }
        }
        out
    }

    fn partitions_with_input(&self) -> Vec<PartitionId> {
        let mut partitions: Vec<PartitionId> = self
            .partitioned
            .values()
            .flat_map(|by_partition| by_partition.keys().copied())
            .collect();
        partitions.sort_unstable();
        partitions.dedup();
        partitions
    }

    fn is_empty(&self) -> bool {
        self.replicated.values().all(|v| v.is_empty())
            && self.partitioned.values().all(|m| m.values().all(|v| v.is_empty()))
    }
}

fn merge_splits(into: &mut HashMap<PlanNodeId, Vec<Split>>, from: HashMap<PlanNodeId, Vec<Split>>) {
    for (node, mut splits) in from {
        into.entry(node).or_default().append(&mut splits);
    }
}

/// `spec.md` §4.2: `more_tasks`/`is_finished`/`close` with dispatch over the five variants.
pub enum TaskSource {
    Single(SingleDistributionSource),
    Arbitrary(ArbitraryDistributionSource),
    Hash(HashDistributionSource),
    Source(SourceDistributionSource),
}

impl TaskSource {
    /// Completes when at least one new task is ready or the source is exhausted; may return an
    /// empty list at exhaustion (`spec.md` §4.2).
    pub async fn more_tasks(&mut self) -> Result<Vec<TaskDescriptor>> {
        match self {
            TaskSource::Single(s) => s.more_tasks(),
            TaskSource::Arbitrary(s) => s.more_tasks(),
            TaskSource::Hash(s) => s.more_tasks().await,
            TaskSource::Source(s) => s.more_tasks().await,
        }
    }

    pub fn is_finished(&self) -> bool {
        match self {
            TaskSource::Single(s) => s.is_finished(),
            TaskSource::Arbitrary(s) => s.is_finished(),
            TaskSource::Hash(s) => s.is_finished(),
            TaskSource::Source(s) => s.is_finished(),
        }
    }

    /// Idempotent; releases split sources and pending futures.
    pub fn close(&mut self) {
        match self {
            TaskSource::Single(_) | TaskSource::Arbitrary(_) | TaskSource::Hash(_) => {}
            TaskSource::Source(s) => s.close(),
        }
    }
}

// ---------------------------------------------------------------------------------------------
// 4.2.1 SingleDistribution
// ---------------------------------------------------------------------------------------------

/// Emits exactly one task containing every split, at partition 0 (`spec.md` §4.2.1).
pub struct SingleDistributionSource {
    input_splits: HashMap<PlanNodeId, Vec<Split>>,
    exchange_inputs: ExchangeInputs,
    coordinator_only: bool,
    coordinator_address: HostAddress,
    emitted: bool,
}

impl SingleDistributionSource {
    pub fn new(
        input_splits: HashMap<PlanNodeId, Vec<Split>>,
        exchange_inputs: ExchangeInputs,
        coordinator_only: bool,
        coordinator_address: HostAddress,
    ) -> Self {
        Self {
            input_splits,
            exchange_inputs,
            coordinator_only,
            coordinator_address,
            emitted: false,
        }
    }

    fn more_tasks(&mut self) -> Result<Vec<TaskDescriptor>> {
        if self.emitted {
            return Ok(vec![]);
        }
        self.emitted = true;

        let mut splits = self.exchange_inputs.splits_for_partition(0);
        merge_splits(&mut splits, std::mem::take(&mut self.input_splits));

        let requirement = if self.coordinator_only {
            NodeRequirement::pinned_to(self.coordinator_address.clone())
        } else {
            NodeRequirement::any()
        };

        Ok(vec![TaskDescriptor::new(0, splits, requirement, DataSize::ZERO)])
    }

    fn is_finished(&self) -> bool {
        self.emitted
    }
}

// ---------------------------------------------------------------------------------------------
// 4.2.2 ArbitraryDistribution
// ---------------------------------------------------------------------------------------------

/// Packs non-replicated exchange source handles greedily into partitions by byte size
/// (`spec.md` §4.2.2). The exchange's `source_handles` future only resolves once, after the
/// producing stage has finished every partition, so this source emits its one batch of tasks
/// synchronously and is then exhausted.
pub struct ArbitraryDistributionSource {
    handles: Vec<(PlanNodeId, ExchangeSourceHandle)>,
    replicated: HashMap<PlanNodeId, Vec<ExchangeSourceHandle>>,
    target_partition_size: DataSize,
    emitted: bool,
}

impl ArbitraryDistributionSource {
    pub fn new(
        handles: Vec<(PlanNodeId, ExchangeSourceHandle)>,
        replicated: HashMap<PlanNodeId, Vec<ExchangeSourceHandle>>,
        target_partition_size: DataSize,
    ) -> Self {
        Self {
            handles,
            replicated,
            target_partition_size,
            emitted: false,
        }
    }

    fn more_tasks(&mut self) -> Result<Vec<TaskDescriptor>> {
        if self.emitted {
            return Ok(vec![]);
        }
        self.emitted = true;

        let groups = pack_by_size(std::mem::take(&mut self.handles), self.target_partition_size);
        let replicated_splits: HashMap<PlanNodeId, Split> = self
            .replicated
            .iter()
            .filter(|(_, handles)| !handles.is_empty())
            .map(|(node, handles)| {
                (
                    *node,
                    Split::Remote(RemoteSplit {
                        handles: handles.clone(),
                    }),
                )
            })
            .collect();

        let tasks = groups
            .into_iter()
            .enumerate()
            .map(|(partition_id, group)| {
                let mut splits: HashMap<PlanNodeId, Vec<Split>> = HashMap::new();
                for (node, handle) in group {
                    splits
                        .entry(node)
                        .or_default()
                        .push(Split::Remote(RemoteSplit { handles: vec![handle] }));
                }
                for (node, split) in &replicated_splits {
                    splits.entry(*node).or_default().push(split.clone());
                }
                TaskDescriptor::new(
                    partition_id as PartitionId,
                    splits,
                    NodeRequirement::any(),
                    DataSize::ZERO,
                )
            })
            .collect();

        Ok(tasks)
    }

    fn is_finished(&self) -> bool {
        self.emitted
    }
}

/// The packing algorithm of `spec.md` §4.2.2 steps 1-4: append to a running open partition,
/// sealing it once the running total reaches `target`; a handle that alone reaches `target`
/// first seals whatever was already open, then forms its own singleton partition.
fn pack_by_size(
    handles: Vec<(PlanNodeId, ExchangeSourceHandle)>,
    target: DataSize,
) -> Vec<Vec<(PlanNodeId, ExchangeSourceHandle)>> {
    let mut sealed = Vec::new();
    let mut open: Vec<(PlanNodeId, ExchangeSourceHandle)> = Vec::new();
    let mut running = DataSize::ZERO;

    for (node, handle) in handles {
        if target > DataSize::ZERO && handle.size >= target {
            if !open.is_empty() {
                sealed.push(std::mem::take(&mut open));
                running = DataSize::ZERO;
            }
            sealed.push(vec![(node, handle)]);
            continue;
        }
        running += handle.size;
        open.push((node, handle));
        if running >= target {
            sealed.push(std::mem::take(&mut open));
            running = DataSize::ZERO;
        }
    }
    if !open.is_empty() {
        sealed.push(open);
    }
    sealed
}

// ---------------------------------------------------------------------------------------------
// 4.2.3 HashDistribution
// ---------------------------------------------------------------------------------------------

/// One connector split source feeding a hash-distributed stage, paired with the plan node it
/// feeds and a function recovering each split's bucket.
pub struct HashConnectorInput {
    pub plan_node_id: PlanNodeId,
    pub source: Arc<dyn ConnectorSplitSource>,
    pub split_batch_size: u32,
}

/// Inputs: a fixed partitioning scheme (`partition_count`, `bucket_count`, optional
/// `bucket_to_node` affinity), per-plan-node connector split sources, and per-plan-node
/// partitioned exchange handles already keyed by downstream partition (`spec.md` §4.2.3).
pub struct HashDistributionSource {
    connector_inputs: Vec<HashConnectorInput>,
    exchange_inputs: ExchangeInputs,
    bucket_to_partition: BucketToPartition,
    bucket_to_node: Option<HashMap<BucketId, HostAddress>>,
    target_partition_split_weight: DataSize,
    target_partition_source_size: DataSize,
    emitted: bool,
}

impl HashDistributionSource {
    pub fn new(
        connector_inputs: Vec<HashConnectorInput>,
        exchange_inputs: ExchangeInputs,
        bucket_to_partition: BucketToPartition,
        bucket_to_node: Option<HashMap<BucketId, HostAddress>>,
        target_partition_split_weight: DataSize,
        target_partition_source_size: DataSize,
    ) -> Self {
        Self {
            connector_inputs,
            exchange_inputs,
            bucket_to_partition,
            bucket_to_node,
            target_partition_split_weight,
            target_partition_source_size,
            emitted: false,
        }
    }

    async fn more_tasks(&mut self) -> Result<Vec<TaskDescriptor>> {
        if self.emitted {
            return Ok(vec![]);
        }
        self.emitted = true;

        // Step 1: await every connector split source to completion, grouping by partition.
        let mut data_by_partition: HashMap<PartitionId, HashMap<PlanNodeId, Vec<ConnectorSplit>>> =
            HashMap::new();
        for input in &self.connector_inputs {
            loop {
                let batch = input.source.get_next_batch(input.split_batch_size).await?;
                for split in batch.splits {
                    let bucket = split.bucket.unwrap_or(0);
                    let partition = self.bucket_to_partition.partition_for(bucket);
                    data_by_partition
                        .entry(partition)
                        .or_default()
                        .entry(input.plan_node_id)
                        .or_default()
                        .push(split);
                }
                if batch.no_more_splits {
                    break;
                }
            }
        }

        // Step 2: partitioned exchange handles are already grouped by (final) partition id.
        let mut partitions: Vec<PartitionId> = data_by_partition.keys().copied().collect();
        partitions.extend(self.exchange_inputs.partitions_with_input());
        partitions.sort_unstable();
        partitions.dedup();

        // Step 3-4: build one candidate task per partition, then adaptively join runs of
        // adjacent partitions while both caps hold and node affinity (if any) agrees.
        let candidates: Vec<HashCandidate> = partitions
            .into_iter()
            .map(|partition_id| {
                let mut splits = self.exchange_inputs.splits_for_partition(partition_id);
                let exchange_bytes: DataSize = splits
                    .values()
                    .flat_map(|v| v.iter())
                    .map(Split::weight)
                    .sum();

                let mut weight = exchange_bytes;
                let mut address = None;
                let mut catalog_handle = None;
                if let Some(by_node) = data_by_partition.remove(&partition_id) {
                    for (node, connector_splits) in by_node {
                        for split in &connector_splits {
                            weight += split.weight;
                            if catalog_handle.is_none() {
                                catalog_handle = Some(split.catalog_handle.clone());
                            }
                            if address.is_none() {
                                if let Some(bucket) = split.bucket {
                                    address = self
                                        .bucket_to_node
                                        .as_ref()
                                        .and_then(|m| m.get(&bucket).cloned());
                                }
                            }
                        }
                        splits
                            .entry(node)
                            .or_default()
                            .extend(connector_splits.into_iter().map(Split::Connector));
                    }
                }

                HashCandidate {
                    partition_id,
                    splits,
                    weight,
                    exchange_bytes,
                    address,
                    catalog_handle,
                }
            })
            .collect();

        let mut tasks = Vec::new();
        let mut staged: Vec<HashCandidate> = Vec::new();
        let mut staged_weight = DataSize::ZERO;
        let mut staged_exchange_bytes = DataSize::ZERO;

        for candidate in candidates {
            let fits = staged.is_empty()
                || (staged_weight + candidate.weight <= self.target_partition_split_weight
                    && staged_exchange_bytes + candidate.exchange_bytes
                        <= self.target_partition_source_size
                    && staged.last().unwrap().address == candidate.address);

            if !fits {
                tasks.push(seal_candidate_group(std::mem::take(&mut staged)));
                staged_weight = DataSize::ZERO;
                staged_exchange_bytes = DataSize::ZERO;
            }

            staged_weight += candidate.weight;
            staged_exchange_bytes += candidate.exchange_bytes;
            staged.push(candidate);
        }
        if !staged.is_empty() {
            tasks.push(seal_candidate_group(staged));
        }

        Ok(tasks)
    }

    fn is_finished(&self) -> bool {
        self.emitted
    }
}

/// One partition's worth of input before adaptive joining folds it (and possibly its
/// neighbors) into a task. `spec.md` §9 leaves the exact shape of a joined task underspecified
/// (the coalescing rule never says whether the joined task keeps one partition id or several);
/// this implementation keeps `spec.md` §3's invariant — one task, one partition id, ids unique
/// — and resolves the ambiguity by having a joined task adopt the lowest partition id in its
/// run while carrying every joined partition's splits (see `DESIGN.md`).
struct HashCandidate {
    partition_id: PartitionId,
    splits: HashMap<PlanNodeId, Vec<Split>>,
    weight: DataSize,
    exchange_bytes: DataSize,
    address: Option<HostAddress>,
    catalog_handle: Option<crate::task::CatalogHandle>,
}

fn seal_candidate_group(group: Vec<HashCandidate>) -> TaskDescriptor {
    let partition_id = group.iter().map(|c| c.partition_id).min().unwrap();
    let mut splits: HashMap<PlanNodeId, Vec<Split>> = HashMap::new();
    let mut address = None;
    let mut catalog_handle = None;
    for candidate in group {
        if address.is_none() {
            address = candidate.address;
        }
        if catalog_handle.is_none() {
            catalog_handle = candidate.catalog_handle;
        }
        merge_splits(&mut splits, candidate.splits);
    }

    let mut requirement = NodeRequirement::any();
    if let Some(address) = address {
        requirement.addresses.insert(address);
    }
    if let Some(catalog_handle) = catalog_handle {
        requirement.catalog_handle = Some(catalog_handle);
    }

    TaskDescriptor::new(partition_id, splits, requirement, DataSize::ZERO)
}

// ---------------------------------------------------------------------------------------------
// 4.2.4 SourceDistribution
// ---------------------------------------------------------------------------------------------

/// Thresholds governing when `SourceDistributionSource` seals an accumulated batch of splits
/// into a task (`spec.md` §4.2.4).
#[derive(Clone, Copy, Debug)]
pub struct SourceDistributionThresholds {
    pub split_weight_per_task: DataSize,
    pub max_splits_per_task: u32,
    pub min_splits_per_task: u32,
    pub split_batch_size: u32,
}

/// Reads from a single connector split source, batching splits into tasks by weight/count
/// thresholds with host-affinity grouping and a final-task rule (`spec.md` §4.2.4).
pub struct SourceDistributionSource {
    plan_node_id: PlanNodeId,
    split_source: Arc<dyn ConnectorSplitSource>,
    thresholds: SourceDistributionThresholds,
    replicated: HashMap<PlanNodeId, Vec<ExchangeSourceHandle>>,
    groups: Vec<(Option<HostAddress>, Vec<ConnectorSplit>)>,
    next_partition_id: PartitionId,
    source_finished: bool,
    closed: bool,
}

impl SourceDistributionSource {
    pub fn new(
        plan_node_id: PlanNodeId,
        split_source: Arc<dyn ConnectorSplitSource>,
        thresholds: SourceDistributionThresholds,
        replicated: HashMap<PlanNodeId, Vec<ExchangeSourceHandle>>,
    ) -> Self {
        Self {
            plan_node_id,
            split_source,
            thresholds,
            replicated,
            groups: Vec::new(),
            next_partition_id: 0,
            source_finished: false,
            closed: false,
        }
    }

    fn push(&mut self, split: ConnectorSplit) {
        let key = split.address.clone();
        if let Some(entry) = self.groups.iter_mut().find(|(k, _)| *k == key) {
            entry.1.push(split);
        } else {
            self.groups.push((key, vec![split]));
        }
    }

    /// The address-affinity group sharing the largest number of pending splits anchors the
    /// next task (`spec.md` §4.2.4); splits without any address carry no requirement of their
    /// own and are only picked as an anchor when every other group is empty.
    fn anchor_index(&self) -> Option<usize> {
        self.groups
            .iter()
            .enumerate()
            .filter(|(_, (key, v))| key.is_some() && !v.is_empty())
            .max_by_key(|(_, (_, v))| v.len())
            .map(|(i, _)| i)
            .or_else(|| {
                self.groups
                    .iter()
                    .position(|(key, v)| key.is_none() && !v.is_empty())
            })
    }

    fn ready_to_seal(&self, group: &[ConnectorSplit]) -> bool {
        let weight: DataSize = group.iter().map(|s| s.weight).sum();
        let reached_target = weight >= self.thresholds.split_weight_per_task
            || group.len() as u32 >= self.thresholds.max_splits_per_task;
        reached_target && group.len() as u32 >= self.thresholds.min_splits_per_task
    }

    fn build_task(&mut self, address: Option<HostAddress>, splits: Vec<ConnectorSplit>) -> TaskDescriptor {
        let partition_id = self.next_partition_id;
        self.next_partition_id += 1;

        let mut split_map: HashMap<PlanNodeId, Vec<Split>> = HashMap::new();
        split_map
            .entry(self.plan_node_id)
            .or_default()
            .extend(splits.into_iter().map(Split::Connector));
        for (node, handles) in &self.replicated {
            if !handles.is_empty() {
                split_map.entry(*node).or_default().push(Split::Remote(RemoteSplit {
                    handles: handles.clone(),
                }));
            }
        }

        let requirement = match address {
            Some(address) => NodeRequirement::pinned_to(address),
            None => NodeRequirement::any(),
        };
        TaskDescriptor::new(partition_id, split_map, requirement, DataSize::ZERO)
    }

    async fn more_tasks(&mut self) -> Result<Vec<TaskDescriptor>> {
        if self.closed {
            return Ok(vec![]);
        }

        if !self.source_finished {
            let batch = self
                .split_source
                .get_next_batch(self.thresholds.split_batch_size)
                .await?;
            for split in batch.splits {
                self.push(split);
            }
            self.source_finished = batch.no_more_splits;
        }

        let mut emitted = Vec::new();
        while let Some(index) = self.anchor_index() {
            if !self.ready_to_seal(&self.groups[index].1) {
                break;
            }
            let (address, splits) = std::mem::take(&mut self.groups[index].1)
                .into_iter()
                .fold((self.groups[index].0.clone(), Vec::new()), |(addr, mut acc), s| {
                    acc.push(s);
                    (addr, acc)
                });
            emitted.push(self.build_task(address, splits));
        }

        // Final-task rule: once the source is exhausted, whatever remains per address group is
        // emitted as its own final task regardless of the weight/count/min thresholds.
        if self.source_finished {
            let groups = std::mem::take(&mut self.groups);
            for (address, splits) in groups {
                if !splits.is_empty() {
                    emitted.push(self.build_task(address, splits));
                }
            }
        }

        Ok(emitted)
    }

    fn is_finished(&self) -> bool {
        self.source_finished && self.groups.iter().all(|(_, v)| v.is_empty())
    }

    fn close(&mut self) {
        if !self.closed {
            self.split_source.close();
            self.closed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use crate::external::testing::FakeConnectorSplitSource;
    use crate::plan::BucketToPartition;
    use crate::task::CatalogHandle;

    use super::*;

    fn exchange_handle(id: u64, size: u64) -> ExchangeSourceHandle {
        ExchangeSourceHandle {
            id,
            target_partition: 0,
            size: DataSize(size),
        }
    }

    fn coordinator() -> HostAddress {
        HostAddress {
            host: "coordinator".into(),
            port: 1,
        }
    }

    // ---------------------------------------------------------------------------------------
    // Scenario 1: SingleDistribution, no addresses (`spec.md` §8 scenario 1).
    // ---------------------------------------------------------------------------------------

    #[tokio::test]
    async fn single_distribution_emits_exactly_one_task_at_partition_zero() {
        let mut source = TaskSource::Single(SingleDistributionSource::new(
            HashMap::new(),
            ExchangeInputs::default(),
            false,
            coordinator(),
        ));

        let tasks = source.more_tasks().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].partition_id, 0);
        assert!(tasks[0].node_requirement.addresses.is_empty());
        assert!(source.is_finished());
        assert!(
            source.more_tasks().await.unwrap().is_empty(),
            "exhausted sources emit nothing further"
        );
    }

    #[tokio::test]
    async fn single_distribution_coordinator_only_pins_the_coordinator_address() {
        let mut source = TaskSource::Single(SingleDistributionSource::new(
            HashMap::new(),
            ExchangeInputs::default(),
            true,
            coordinator(),
        ));

        let tasks = source.more_tasks().await.unwrap();
        assert_eq!(tasks[0].node_requirement.addresses, HashSet::from([coordinator()]));
    }

    // ---------------------------------------------------------------------------------------
    // Scenario 2 + "Arbitrary packing monotonicity": ArbitraryDistribution packing by target
    // byte size (`spec.md` §8 scenario 2, §4.2.2).
    // ---------------------------------------------------------------------------------------

    #[test]
    fn pack_by_size_seals_an_open_group_once_the_target_is_reached() {
        let handles = vec![
            (1u32, exchange_handle(1, 1)),
            (1u32, exchange_handle(2, 1)),
            (1u32, exchange_handle(3, 1)),
            (1u32, exchange_handle(4, 2)),
        ];
        // Target 3B: handles 1+2+3 sum to 3 and seal together; handle 4 is left open (2 < 3).
        let groups = pack_by_size(handles, DataSize(3));
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 3);
        assert_eq!(groups[1].len(), 1);
    }

    #[test]
    fn pack_by_size_isolates_a_handle_that_alone_reaches_the_target() {
        let handles = vec![
            (1u32, exchange_handle(1, 1)),
            (1u32, exchange_handle(2, 5)),
            (1u32, exchange_handle(3, 1)),
        ];
        // Handle 2 alone (5B) reaches the 3B target: it seals whatever was open (handle 1) and
        // forms its own singleton group; handle 3 is left open afterwards.
        let groups = pack_by_size(handles, DataSize(3));
        assert_eq!(groups, vec![
            vec![(1u32, exchange_handle(1, 1))],
            vec![(1u32, exchange_handle(2, 5))],
            vec![(1u32, exchange_handle(3, 1))],
        ]);
    }

    #[test]
    fn pack_by_size_with_target_3b_packs_monotonically_and_accounts_for_every_handle() {
        let handles: Vec<_> = (0..9).map(|i| (1u32, exchange_handle(i, 1))).collect();
        let groups = pack_by_size(handles, DataSize(3));
        // Nine 1-byte handles at a 3B target seal into exactly three groups of three.
        assert_eq!(groups.len(), 3);
        let total: usize = groups.iter().map(|g| g.len()).sum();
        assert_eq!(total, 9, "every handle is packed into exactly one partition");
        for g in &groups {
            assert_eq!(g.len(), 3);
        }
    }

    #[tokio::test]
    async fn arbitrary_distribution_packs_into_3b_partitions_and_carries_replicated_input() {
        let handles = vec![(10u32, exchange_handle(1, 2)), (10u32, exchange_handle(2, 2))];
        let mut replicated = HashMap::new();
        replicated.insert(20u32, vec![exchange_handle(3, 99)]);

        let mut source = TaskSource::Arbitrary(ArbitraryDistributionSource::new(handles, replicated, DataSize(3)));
        let tasks = source.more_tasks().await.unwrap();

        // Each 2B handle alone is under the 3B target, but together they reach it: one packed
        // partition.
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].partition_id, 0);
        assert!(tasks[0].splits.contains_key(&10u32), "packed handle's plan node is present");
        assert!(tasks[0].splits.contains_key(&20u32), "replicated input reaches every partition");
        assert!(source.is_finished());
    }

    // ---------------------------------------------------------------------------------------
    // Scenario 3 + "Partitioning completeness": HashDistribution folds buckets to partitions via
    // the shared `BucketToPartition` cache (`spec.md` §8 scenario 3, §4.2.3).
    // ---------------------------------------------------------------------------------------

    fn connector_split(bucket: BucketId, weight: u64) -> ConnectorSplit {
        ConnectorSplit {
            catalog_handle: CatalogHandle("warehouse".into()),
            payload: vec![],
            weight: DataSize(weight),
            address: None,
            bucket: Some(bucket),
        }
    }

    #[tokio::test]
    async fn hash_distribution_folds_four_buckets_into_four_partitions() {
        let splits = (0..4).map(|b| connector_split(b, 10)).collect();
        let connector_inputs = vec![HashConnectorInput {
            plan_node_id: 30,
            source: Arc::new(FakeConnectorSplitSource::new(splits)),
            split_batch_size: 100,
        }];

        // A target exactly equal to one candidate's weight forces the adaptive join to seal
        // after every single candidate, so the four buckets surface as four distinct tasks
        // rather than being coalesced into one.
        let mut source = TaskSource::Hash(HashDistributionSource::new(
            connector_inputs,
            ExchangeInputs::default(),
            BucketToPartition::identity(4),
            None,
            DataSize(10),
            DataSize(10),
        ));

        let tasks = source.more_tasks().await.unwrap();
        let mut partitions: Vec<PartitionId> = tasks.iter().map(|t| t.partition_id).collect();
        partitions.sort_unstable();
        assert_eq!(partitions, vec![0, 1, 2, 3], "every bucket's partition is scheduled under some task");
        assert!(source.is_finished());
    }

    #[tokio::test]
    async fn hash_distribution_includes_replicated_and_partitioned_exchange_input() {
        let mut partitioned = HashMap::new();
        partitioned.insert(0u32, vec![exchange_handle(1, 5)]);
        let exchange_inputs = ExchangeInputs {
            replicated: HashMap::from([(40u32, vec![exchange_handle(2, 7)])]),
            partitioned: HashMap::from([(41u32, partitioned)]),
        };

        let mut source = TaskSource::Hash(HashDistributionSource::new(
            Vec::new(),
            exchange_inputs,
            BucketToPartition::identity(2),
            None,
            DataSize(1 << 30),
            DataSize(1 << 30),
        ));

        let tasks = source.more_tasks().await.unwrap();
        assert_eq!(tasks.len(), 1, "only partition 0 has input; partition 1 never appears");
        assert_eq!(tasks[0].partition_id, 0);
        assert!(tasks[0].splits.contains_key(&40u32));
        assert!(tasks[0].splits.contains_key(&41u32));
    }

    // ---------------------------------------------------------------------------------------
    // Scenario 4 + "Source-distribution tail rule": SourceDistribution batches by weight/count
    // and flushes a final partial group once the connector source is exhausted (`spec.md` §8
    // scenario 4, §4.2.4).
    // ---------------------------------------------------------------------------------------

    fn thresholds() -> SourceDistributionThresholds {
        SourceDistributionThresholds {
            split_weight_per_task: DataSize(10),
            max_splits_per_task: 100,
            min_splits_per_task: 2,
            split_batch_size: 2,
        }
    }

    fn source_split(weight: u64) -> ConnectorSplit {
        ConnectorSplit {
            catalog_handle: CatalogHandle("warehouse".into()),
            payload: vec![],
            weight: DataSize(weight),
            address: None,
            bucket: None,
        }
    }

    #[tokio::test]
    async fn source_distribution_seals_once_weight_and_min_count_are_both_reached() {
        // A batch size of 2 forces the first split batch to stop short of exhausting the
        // source, so the first `more_tasks` call observes splits still arriving.
        let splits = vec![source_split(6), source_split(6), source_split(1)];
        let mut source = SourceDistributionSource::new(
            10,
            Arc::new(FakeConnectorSplitSource::new(splits)),
            thresholds(),
            HashMap::new(),
        );

        let tasks = source.more_tasks().await.unwrap();
        // The first two splits reach 12B (>= 10B) and satisfy the 2-split minimum: sealed as
        // one task, even though the connector source hasn't finished yet.
        assert_eq!(tasks.len(), 1);
        assert!(!source.is_finished());
    }

    #[tokio::test]
    async fn source_distribution_tail_rule_flushes_the_remainder_once_exhausted() {
        let splits = vec![source_split(6), source_split(6), source_split(1)];
        let mut source = SourceDistributionSource::new(
            10,
            Arc::new(FakeConnectorSplitSource::new(splits)),
            thresholds(),
            HashMap::new(),
        );

        let mut tasks = Vec::new();
        while !source.is_finished() {
            tasks.extend(source.more_tasks().await.unwrap());
        }
        // The first two splits seal on weight once they arrive; the trailing 1B split never
        // reaches either threshold but is still flushed once the source is exhausted.
        assert_eq!(tasks.len(), 2, "the tail rule emits the under-threshold remainder once exhausted");
        tasks.sort_by_key(|t| t.partition_id);

        let remainder_weight: DataSize = tasks[1]
            .splits
            .get(&10u32)
            .unwrap()
            .iter()
            .map(Split::weight)
            .sum();
        assert_eq!(remainder_weight, DataSize(1), "the final task carries the sub-threshold remainder");
    }

    #[tokio::test]
    async fn source_distribution_groups_by_address_affinity() {
        let addr_a = HostAddress {
            host: "a".into(),
            port: 1,
        };
        let addr_b = HostAddress {
            host: "b".into(),
            port: 1,
        };
        let splits = vec![
            ConnectorSplit {
                address: Some(addr_a.clone()),
                ..source_split(20)
            },
            ConnectorSplit {
                address: Some(addr_b.clone()),
                ..source_split(20)
            },
        ];
        let mut source = SourceDistributionSource::new(
            10,
            Arc::new(FakeConnectorSplitSource::new(splits)),
            thresholds(),
            HashMap::new(),
        );

        let tasks = source.more_tasks().await.unwrap();
        assert_eq!(tasks.len(), 2, "splits with distinct address affinity never share a task");
        let addresses: HashSet<HostAddress> = tasks
            .iter()
            .map(|t| t.node_requirement.addresses.iter().next().cloned().unwrap())
            .collect();
        assert_eq!(addresses, HashSet::from([addr_a, addr_b]));
    }
}
