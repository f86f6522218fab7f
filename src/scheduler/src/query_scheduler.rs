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

//! Top-level query scheduler (`spec.md` §4.8): builds one [`FaultTolerantStageScheduler`] per
//! stage and drives them to completion with the single cooperative actor `spec.md` §5 describes.
//!
//! Construction is lazy rather than all-at-once: a stage needs its children's resolved exchange
//! output before its [`crate::task_source::TaskSource`] can be built (an `ArbitraryDistributionSource`
//! or `HashDistributionSource` is constructed from already-resolved `ExchangeSourceHandle`s, not
//! from a pending future), so `activate` only constructs a stage's scheduler once every child has
//! finished. Leaf stages with no children activate immediately on the first iteration of the run
//! loop.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use sched_common::{QueryId, Result, SchedulerError, StageId};

use crate::external::{Exchange, ExchangeFactory, NodePartitioningManager, QueryState, QueryStateMachine, RemoteTaskFactory};
use crate::memory_estimator::PartitionMemoryEstimator;
use crate::node_allocator::NodeAllocator;
use crate::plan::{BucketToPartition, PartitioningHandle};
use crate::stage_manager::{QueryStats, StageManager};
use crate::stage_scheduler::{FaultTolerantStageScheduler, StageSchedulerConfig};
use crate::task::{CatalogHandle, ExchangeSourceHandle};
use crate::task_descriptor_storage::TaskDescriptorStorage;
use crate::task_source::TaskSource;

/// Builds a stage's [`TaskSource`] once every child stage's exchange output is resolved, and the
/// stage's [`BucketToPartition`] cache entry (`Some` only for `Hash`-distributed stages) is
/// resolved. The handle map is keyed by child stage id; the builder knows, from the compiled
/// plan, which plan-node each child feeds and whether that input is replicated or partitioned
/// (`spec.md` §4.2), which the query scheduler itself has no way to know generically.
pub type TaskSourceBuilder =
    Box<dyn FnOnce(HashMap<StageId, Vec<ExchangeSourceHandle>>, Option<BucketToPartition>) -> TaskSource + Send>;

fn total_partitions_for(handle: &PartitioningHandle) -> Option<u32> {
    match handle {
        PartitioningHandle::Single | PartitioningHandle::Coordinator => Some(1),
        PartitioningHandle::Hash { partition_count, .. } => Some(*partition_count),
        PartitioningHandle::Arbitrary | PartitioningHandle::Source => None,
    }
}

/// Keys the per-query bucket-to-partition cache (`spec.md` §4.8 step 2): two stages sharing the
/// same key must end up sharing the same [`BucketToPartition`], satisfying the "Bucket affinity
/// consistency" invariant (`spec.md` §8).
#[derive(Clone, PartialEq, Eq, Hash)]
enum BucketCacheKey {
    /// `FIXED_HASH_DISTRIBUTION`: identity over `[0, partition_count)`.
    Identity(u32),
    /// Catalog-bound: one partition per distinct node in the fetched bucket-node map.
    Catalog(CatalogHandle),
}

struct Shared {
    query_id: QueryId,
    stage_manager: Arc<StageManager>,
    node_allocator: Arc<NodeAllocator>,
    memory_estimator: Arc<dyn PartitionMemoryEstimator>,
    descriptor_storage: Arc<TaskDescriptorStorage>,
    remote_task_factory: Arc<dyn RemoteTaskFactory>,
    query_state_machine: Arc<dyn QueryStateMachine>,
    node_partitioning_manager: Arc<dyn NodePartitioningManager>,
    stage_config: StageSchedulerConfig,
    remaining_task_retry_attempts_overall: Arc<AtomicI64>,
    exchanges: HashMap<StageId, Arc<dyn Exchange>>,
    task_source_builders: Mutex<HashMap<StageId, TaskSourceBuilder>>,
    schedulers: Mutex<HashMap<StageId, FaultTolerantStageScheduler>>,
    bucket_to_partition_cache: Mutex<HashMap<BucketCacheKey, BucketToPartition>>,
    final_output: Mutex<Option<Vec<ExchangeSourceHandle>>>,
}

/// Owns every stage of one query end to end: construction (`spec.md` §4.8 steps 1-4), the
/// scheduling loop, and the final-results hook (step 5).
pub struct QueryScheduler {
    shared: Arc<Shared>,
}

impl QueryScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        query_id: QueryId,
        stage_manager: Arc<StageManager>,
        exchange_factory: &dyn ExchangeFactory,
        task_source_builders: HashMap<StageId, TaskSourceBuilder>,
        node_allocator: Arc<NodeAllocator>,
        memory_estimator: Arc<dyn PartitionMemoryEstimator>,
        descriptor_storage: Arc<TaskDescriptorStorage>,
        remote_task_factory: Arc<dyn RemoteTaskFactory>,
        query_state_machine: Arc<dyn QueryStateMachine>,
        node_partitioning_manager: Arc<dyn NodePartitioningManager>,
        task_retry_attempts_overall: u32,
        stage_config: StageSchedulerConfig,
    ) -> Self {
        descriptor_storage.initialize(query_id.clone());

        let root_stage_id = stage_manager.root_stage_id();
        let exchanges = stage_manager
            .all_stage_ids()
            .into_iter()
            .map(|stage_id| {
                let preserve_order = stage_id == root_stage_id;
                (stage_id, exchange_factory.create_exchange(stage_id, preserve_order))
            })
            .collect();

        let shared = Arc::new(Shared {
            query_id,
            stage_manager,
            node_allocator,
            memory_estimator,
            descriptor_storage,
            remote_task_factory,
            query_state_machine,
            node_partitioning_manager,
            stage_config,
            remaining_task_retry_attempts_overall: Arc::new(AtomicI64::new(task_retry_attempts_overall as i64)),
            exchanges,
            task_source_builders: Mutex::new(task_source_builders),
            schedulers: Mutex::new(HashMap::new()),
            bucket_to_partition_cache: Mutex::new(HashMap::new()),
            final_output: Mutex::new(None),
        });

        Self { shared }
    }

    /// Resolves (computing and caching on first use) the [`BucketToPartition`] a `Hash`-
    /// distributed stage should use (`spec.md` §4.8 step 2). `None` for any other partitioning.
    /// Two stages whose fragments share a `PartitioningHandle::Hash` with the same shape and
    /// catalog handle are guaranteed the identical cached value, which is the "Bucket affinity
    /// consistency" invariant (`spec.md` §8).
    async fn bucket_to_partition_for(&self, handle: &PartitioningHandle) -> Result<Option<BucketToPartition>> {
        let (partition_count, catalog_handle) = match handle {
            PartitioningHandle::Hash {
                partition_count,
                catalog_handle,
                ..
            } => (*partition_count, catalog_handle.clone()),
            _ => return Ok(None),
        };

        let key = match &catalog_handle {
            None => BucketCacheKey::Identity(partition_count),
            Some(handle) => BucketCacheKey::Catalog(handle.clone()),
        };

        if let Some(cached) = self.shared.bucket_to_partition_cache.lock().get(&key).cloned() {
            return Ok(Some(cached));
        }

        let computed = match &catalog_handle {
            None => BucketToPartition::identity(partition_count),
            Some(handle) => {
                let node_for_bucket = self.shared.node_partitioning_manager.get_bucket_node_map(handle).await?;
                BucketToPartition::from_bucket_node_map(&node_for_bucket)
            }
        };

        // A second caller racing the same fetch would simply overwrite with an identical value;
        // `run()` drives `activate()` for one stage at a time so this never actually races.
        self.shared.bucket_to_partition_cache.lock().insert(key, computed.clone());
        Ok(Some(computed))
    }

    /// Constructs `stage_id`'s scheduler once every child has finished. Returns `Ok(false)` if
    /// the stage is still waiting on a child (the caller should try again next iteration).
    async fn activate(&self, stage_id: StageId) -> Result<bool> {
        if self.shared.schedulers.lock().contains_key(&stage_id) {
            return Ok(true);
        }

        let children: Vec<StageId> = self.shared.stage_manager.children(stage_id).iter().copied().collect();
        let all_children_finished = children
            .iter()
            .all(|child| self.shared.stage_manager.lifecycle(*child).is_terminal());
        if !all_children_finished {
            return Ok(false);
        }

        let mut child_handles = HashMap::with_capacity(children.len());
        for child in &children {
            let exchange = self
                .shared
                .exchanges
                .get(child)
                .expect("every stage has an exchange")
                .clone();
            child_handles.insert(*child, exchange.source_handles().await?);
        }

        let partitioning = self.shared.stage_manager.get_stage(stage_id).fragment.partitioning.clone();
        let bucket_to_partition = self.bucket_to_partition_for(&partitioning).await?;

        let builder = self.shared.task_source_builders.lock().remove(&stage_id).ok_or_else(|| {
            SchedulerError::Internal(format!("no task source builder registered for stage {stage_id}"))
        })?;
        let task_source = builder(child_handles, bucket_to_partition);

        let total_partitions = total_partitions_for(&partitioning);
        let output_exchange = self.shared.exchanges.get(&stage_id).expect("exchange exists").clone();

        let scheduler = FaultTolerantStageScheduler::new(
            self.shared.query_id.clone(),
            stage_id,
            task_source,
            self.shared.node_allocator.clone(),
            self.shared.memory_estimator.clone(),
            self.shared.descriptor_storage.clone(),
            self.shared.remote_task_factory.clone(),
            output_exchange,
            self.shared.stage_manager.clone(),
            total_partitions,
            self.shared.stage_config,
            self.shared.remaining_task_retry_attempts_overall.clone(),
        );
        self.shared.schedulers.lock().insert(stage_id, scheduler);
        self.shared.stage_manager.transition(stage_id, crate::plan::StageLifecycle::Scheduling);
        tracing::info!(query_id = %self.shared.query_id, stage_id, "stage activated");
        Ok(true)
    }

    async fn finish_stage(&self, stage_id: StageId) {
        self.shared.stage_manager.transition(stage_id, crate::plan::StageLifecycle::Finished);
        if !self.shared.stage_manager.mark_terminal_broadcast(stage_id) {
            return;
        }
        tracing::info!(query_id = %self.shared.query_id, stage_id, "stage finished");

        let exchange = self.shared.exchanges.get(&stage_id).expect("exchange exists").clone();
        exchange.close();

        if stage_id == self.shared.stage_manager.root_stage_id() {
            if let Ok(handles) = exchange.source_handles().await {
                *self.shared.final_output.lock() = Some(handles);
            }
        }
    }

    fn mark_running_if_scheduled(&self, stage_id: StageId, scheduler: &FaultTolerantStageScheduler) {
        if !scheduler.partition_ids().is_empty() {
            self.shared.stage_manager.transition(stage_id, crate::plan::StageLifecycle::Running);
        }
    }

    /// Cancels the offending stage with `cause`, aborts every other stage (activated or not),
    /// closes every exchange and transitions the query to `Failed` (`spec.md` §4.8 "On any
    /// thrown exception from `schedule()`").
    async fn fail_query(&self, offending_stage: StageId, cause: String) {
        tracing::warn!(query_id = %self.shared.query_id, stage_id = offending_stage, %cause, "query failed");
        self.shared.stage_manager.transition(offending_stage, crate::plan::StageLifecycle::Failed);

        let schedulers: Vec<(StageId, FaultTolerantStageScheduler)> =
            self.shared.schedulers.lock().iter().map(|(id, s)| (*id, s.clone())).collect();
        for (stage_id, scheduler) in &schedulers {
            if *stage_id != offending_stage {
                scheduler.abort();
            }
        }
        for stage_id in self.shared.stage_manager.all_stage_ids() {
            self.shared.stage_manager.transition(stage_id, crate::plan::StageLifecycle::Aborted);
        }
        for exchange in self.shared.exchanges.values() {
            exchange.close();
        }
        self.shared.node_allocator.close();
        self.shared.descriptor_storage.destroy(&self.shared.query_id);
        self.shared.query_state_machine.fail(cause);
        self.shared.query_state_machine.transition_to(QueryState::Failed);
    }

    async fn finish_query(&self) {
        self.shared.query_state_machine.transition_to(QueryState::Finishing);
        self.shared.descriptor_storage.destroy(&self.shared.query_id);
        self.shared.query_state_machine.transition_to(QueryState::Finished);
        tracing::info!(query_id = %self.shared.query_id, "query finished");
    }

    /// Drives every stage to completion (`spec.md` §4.8, §5): each iteration activates
    /// newly-eligible stages, schedules whichever of the already-active ones is not blocked, and
    /// — only if nothing in the whole pass made progress — awaits the first stage to unblock,
    /// capped at one second so a stalled blocker never wedges the loop indefinitely.
    pub async fn run(&self) {
        self.shared.query_state_machine.transition_to(QueryState::Running);
        tracing::info!(query_id = %self.shared.query_id, "query started");

        loop {
            let mut made_progress = false;
            let mut blockers: Vec<Pin<Box<dyn Future<Output = ()> + Send + '_>>> = Vec::new();

            for stage_id in self.shared.stage_manager.stage_ids_by_topo_order() {
                if self.shared.stage_manager.lifecycle(stage_id).is_terminal() {
                    continue;
                }

                match self.activate(stage_id).await {
                    Ok(true) => {}
                    Ok(false) => continue,
                    Err(err) => {
                        self.fail_query(stage_id, err.to_string()).await;
                        return;
                    }
                }

                let scheduler = self
                    .shared
                    .schedulers
                    .lock()
                    .get(&stage_id)
                    .cloned()
                    .expect("just activated");

                if scheduler.is_finished() {
                    self.finish_stage(stage_id).await;
                    made_progress = true;
                    continue;
                }
                if scheduler.is_failed() {
                    let cause = scheduler.failure_cause().unwrap_or_default();
                    self.fail_query(stage_id, cause).await;
                    return;
                }

                if scheduler.is_blocked().now_or_never().is_none() {
                    let blocked = scheduler.clone();
                    blockers.push(Box::pin(async move { blocked.is_blocked().await }));
                    continue;
                }

                if let Err(err) = scheduler.schedule() {
                    self.fail_query(stage_id, err.to_string()).await;
                    return;
                }
                made_progress = true;
                self.mark_running_if_scheduled(stage_id, &scheduler);

                if scheduler.is_failed() {
                    let cause = scheduler.failure_cause().unwrap_or_default();
                    self.fail_query(stage_id, cause).await;
                    return;
                }
            }

            if self.shared.stage_manager.all_terminal() {
                break;
            }

            if !made_progress {
                if blockers.is_empty() {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                } else {
                    tokio::select! {
                        biased;
                        _ = futures::future::select_all(blockers) => {}
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }

        self.finish_query().await;
    }

    /// Graceful query-wide cancellation: every active stage stops admitting new attempts but
    /// in-flight ones run to completion (`spec.md` §5).
    pub fn cancel(&self) {
        for scheduler in self.shared.schedulers.lock().values() {
            scheduler.cancel();
        }
    }

    /// Forceful query-wide teardown: every active stage is aborted, every exchange closed, the
    /// node allocator closed and the descriptor store for this query destroyed.
    pub fn abort(&self) {
        for scheduler in self.shared.schedulers.lock().values() {
            scheduler.abort();
        }
        for exchange in self.shared.exchanges.values() {
            exchange.close();
        }
        self.shared.node_allocator.close();
        self.shared.descriptor_storage.destroy(&self.shared.query_id);
    }

    pub fn state(&self) -> QueryState {
        self.shared.query_state_machine.state()
    }

    pub fn stats(&self) -> QueryStats {
        self.shared.stage_manager.query_stats()
    }

    /// The root stage's produced `ExchangeSourceHandle`s, wrapped for downstream spooling by
    /// the caller once the query has finished (`spec.md` §4.8 step 5).
    pub fn final_output(&self) -> Option<Vec<ExchangeSourceHandle>> {
        self.shared.final_output.lock().clone()
    }
}
