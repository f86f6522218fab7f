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

//! Traits for the collaborators `spec.md` §6 documents as consumed-but-not-owned: the
//! exchange service, connector split sources, the node-partitioning manager, the failure
//! detector and the worker-side task runtime. The scheduler is generic over all of these; it
//! never constructs a concrete implementation itself.

use async_trait::async_trait;
use sched_common::{DataSize, PartitionId, Result, TaskFailureKind};

use crate::task::{CatalogHandle, ConnectorSplit, HostAddress, ExchangeSourceHandle, TaskDescriptor};

/// A worker node as the scheduler sees it: enough to decide whether a [`crate::task::NodeRequirement`]
/// is satisfied, and how much memory is free to lease against.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InternalNode {
    pub id: u32,
    pub address: HostAddress,
    pub memory_capacity: DataSize,
}

/// Static-per-poll snapshot of the cluster. `spec.md` leaves the mechanism for discovering
/// nodes out of scope ("worker-side task runtime" is an external collaborator); this trait is
/// the seam the node allocator polls through, mirroring the teacher's `WorkerNodeManager`.
pub trait WorkerNodeProvider: Send + Sync {
    fn list_nodes(&self) -> Vec<InternalNode>;

    /// Nodes known to host the given catalog, for requirements that pin a catalog handle.
    fn nodes_for_catalog(&self, catalog_handle: &CatalogHandle) -> Vec<InternalNode>;
}

/// External shuffle service. One instance per stage; sinks are keyed by partition id for
/// writers, and `source_handles` resolves once the producing stage has finished every
/// partition (`spec.md` §3 Exchange guarantees).
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Registers a sink for `partition_id`; the returned token is opaque to the scheduler and
    /// threaded through to the worker runtime when the task is started.
    fn create_sink(&self, partition_id: PartitionId) -> ExchangeSinkHandle;

    /// Resolves once every partition of the producing stage has finished. Ordering among the
    /// handles reflects producer order iff the exchange was constructed with `preserve_order`.
    async fn source_handles(&self) -> Result<Vec<ExchangeSourceHandle>>;

    fn close(&self);
}

/// Opaque token identifying a sink registered with an [`Exchange`]; the scheduler only ever
/// passes it along, never inspects it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ExchangeSinkHandle(pub u64);

#[derive(Clone, Debug, Default)]
pub struct SplitBatch {
    pub splits: Vec<ConnectorSplit>,
    pub no_more_splits: bool,
}

/// One connector's stream of input splits, pulled in batches (`spec.md` §6).
#[async_trait]
pub trait ConnectorSplitSource: Send + Sync {
    async fn get_next_batch(&self, max_size: u32) -> Result<SplitBatch>;

    fn close(&self);
}

/// Resolves a partitioning handle's buckets to the physical nodes that own them, for
/// catalog-bound hash distributions (`spec.md` §4.8 step 2).
#[async_trait]
pub trait NodePartitioningManager: Send + Sync {
    async fn get_bucket_node_map(&self, catalog_handle: &CatalogHandle) -> Result<Vec<u32>>;
}

pub trait FailureDetector: Send + Sync {
    fn is_failed(&self, node: &InternalNode) -> bool;
}

/// Constructs one [`Exchange`] per stage at query-scheduler construction time (`spec.md` §4.8
/// step 3): `preserve_order` is set for the query's output stage only.
pub trait ExchangeFactory: Send + Sync {
    fn create_exchange(&self, stage_id: sched_common::StageId, preserve_order: bool) -> std::sync::Arc<dyn Exchange>;
}

/// Lifecycle of one attempt as reported by the worker runtime (`spec.md` §6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteTaskState {
    Pending,
    Running,
    Finishing,
    Finished,
    Failed,
    Aborted,
}

/// A single running attempt on a worker. The stage scheduler owns exactly one of these per
/// in-flight attempt.
#[async_trait]
pub trait RemoteTask: Send + Sync {
    fn start(&self);

    /// Graceful: let the attempt run to completion but stop expecting more progress from it.
    fn cancel(&self);

    /// Forceful: tell the worker to tear the attempt down now.
    fn abort(&self);

    fn state(&self) -> RemoteTaskState;

    /// Classifies why the task reached `RemoteTaskState::Failed`; `None` for any other state.
    /// The stage scheduler's retry protocol (`spec.md` §4.6) switches on this.
    fn failure_kind(&self) -> Option<TaskFailureKind>;

    /// Registers a callback invoked (possibly from an arbitrary thread) whenever `state()`
    /// changes. Per `spec.md` §5, the callback must be lock-free and only publish one atomic
    /// state change plus signal readiness — it must not itself block.
    fn add_state_change_listener(&self, listener: Box<dyn Fn(RemoteTaskState) + Send + Sync>);
}

/// Constructs [`RemoteTask`]s for a given worker node (`spec.md` §6
/// `RemoteTaskFactory.createRemoteTask`).
pub trait RemoteTaskFactory: Send + Sync {
    fn create_remote_task(
        &self,
        stage_id: sched_common::StageId,
        node: InternalNode,
        descriptor: &TaskDescriptor,
        total_partitions: u32,
    ) -> Box<dyn RemoteTask>;
}

/// Terminal states of a query (`spec.md` §6 `QueryStateMachine`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryState {
    Running,
    Finishing,
    Finished,
    Failed,
}

pub trait QueryStateMachine: Send + Sync {
    fn transition_to(&self, state: QueryState);

    fn state(&self) -> QueryState;

    /// Records the cause of a `Failed` transition; the last captured cause wins
    /// (`spec.md` §7 propagation rule).
    fn fail(&self, cause: String);
}
