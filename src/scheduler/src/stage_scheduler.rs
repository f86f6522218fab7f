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

//! Drives one stage: schedules tasks, observes attempt outcomes, retries within budget, and
//! finalizes (`spec.md` §4.6). `schedule`/`cancel`/`abort` are expected to be called by exactly
//! one actor — the query scheduler's readiness loop (`spec.md` §5) — but everything they touch
//! is behind a `parking_lot::Mutex` so the type itself stays `Send + Sync` and re-entrant-safe.
//! The three suspension points a stage has (`spec.md` §5: `TaskSource.more_tasks`,
//! `NodeAllocator.acquire(...).node()`, and attempt state-change callbacks) each run on their
//! own background task or external thread and only ever publish into the shared state behind a
//! short critical section before signaling [`Notify`] — the same tradeoff `node_allocator`
//! makes for its pending-queue drain.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sched_common::{AttemptId, DataSize, PartitionId, QueryId, Result, SchedulerError, StageId, TaskFailureKind};
use tokio::sync::Notify;

use crate::external::{Exchange, InternalNode, RemoteTask, RemoteTaskFactory, RemoteTaskState};
use crate::memory_estimator::PartitionMemoryEstimator;
use crate::node_allocator::{NodeAllocator, NodeLease};
use crate::stage_manager::StageManager;
use crate::task::TaskDescriptor;
use crate::task_descriptor_storage::{TaskDescriptorStorage, TaskKey};
use crate::task_source::TaskSource;

/// Lifecycle of one attempt (`spec.md` §4.6 `Attempt`). Transitions monotonically
/// `Pending -> Running -> (Finished | Failed | Aborted)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptLifecycle {
    Pending,
    Running,
    Finished,
    Failed,
    Aborted,
}

#[derive(Clone, Debug)]
pub struct Attempt {
    pub attempt_id: AttemptId,
    pub node: Option<InternalNode>,
    pub memory_estimate: DataSize,
    pub state: AttemptLifecycle,
    pub failure: Option<TaskFailureKind>,
}

/// Lifecycle of one partition within a stage (`spec.md` §4.6 `PartitionState`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartitionStatus {
    Pending,
    Running,
    Finished,
    Failed,
}

#[derive(Clone, Debug)]
pub struct PartitionState {
    pub attempts: Vec<Attempt>,
    pub status: PartitionStatus,
}

/// The two budget knobs and the single waiting-lease cap `FaultTolerantStageScheduler` needs
/// out of `spec.md` §6's "Recognized options" (the rest are consumed by the task sources and
/// the adaptive-joining thresholds, not by the scheduler itself).
#[derive(Clone, Copy, Debug)]
pub struct StageSchedulerConfig {
    pub task_retry_attempts_per_task: u32,
    pub max_tasks_waiting_for_node_per_stage: u32,
}

struct RunningAttempt {
    attempt_id: AttemptId,
    memory_estimate: DataSize,
    lease: NodeLease,
    remote_task: Box<dyn RemoteTask>,
}

#[derive(Default)]
struct SchedulerState {
    partitions: HashMap<PartitionId, PartitionState>,
    last_descriptor: HashMap<PartitionId, TaskDescriptor>,
    per_task_attempts: HashMap<PartitionId, u32>,
    next_attempt_id: AttemptId,

    // Buffered by the task-source pump; drained by `schedule()`.
    source_ready: VecDeque<TaskDescriptor>,
    source_finished: bool,

    // Partitions with a lease request in flight, and the leases that have resolved and are
    // waiting for `schedule()` to turn them into a running attempt.
    pending_lease_partitions: HashSet<PartitionId>,
    ready_leases: VecDeque<(PartitionId, AttemptId, InternalNode, NodeLease)>,

    // Partitions whose attempt reached a terminal `RemoteTaskState`, waiting for `schedule()`
    // to apply the retry protocol.
    terminal_queue: VecDeque<PartitionId>,

    running: HashMap<PartitionId, RunningAttempt>,

    cancelling: bool,
    aborted: bool,
    failed: bool,
    failure_cause: Option<String>,
}

struct Inner {
    query_id: QueryId,
    stage_id: StageId,
    node_allocator: Arc<NodeAllocator>,
    memory_estimator: Arc<dyn PartitionMemoryEstimator>,
    descriptor_storage: Arc<TaskDescriptorStorage>,
    remote_task_factory: Arc<dyn RemoteTaskFactory>,
    output_exchange: Arc<dyn Exchange>,
    stage_manager: Arc<StageManager>,
    total_partitions: u32,
    config: StageSchedulerConfig,
    remaining_task_retry_attempts_overall: Arc<AtomicI64>,
    wake: Notify,
    state: Mutex<SchedulerState>,
}

/// Drives one stage end to end (`spec.md` §4.6). Construction wires a [`TaskSource`] (one of
/// the five `spec.md` §4.2 variants) together with the resources shared across every stage of
/// the query: the node allocator, the memory estimator, the descriptor storage and the retry
/// budgets.
#[derive(Clone)]
pub struct FaultTolerantStageScheduler {
    inner: Arc<Inner>,
}

impl FaultTolerantStageScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        query_id: QueryId,
        stage_id: StageId,
        task_source: TaskSource,
        node_allocator: Arc<NodeAllocator>,
        memory_estimator: Arc<dyn PartitionMemoryEstimator>,
        descriptor_storage: Arc<TaskDescriptorStorage>,
        remote_task_factory: Arc<dyn RemoteTaskFactory>,
        output_exchange: Arc<dyn Exchange>,
        stage_manager: Arc<StageManager>,
        total_partitions: Option<u32>,
        config: StageSchedulerConfig,
        remaining_task_retry_attempts_overall: Arc<AtomicI64>,
    ) -> Self {
        let inner = Arc::new(Inner {
            query_id,
            stage_id,
            node_allocator,
            memory_estimator,
            descriptor_storage,
            remote_task_factory,
            output_exchange,
            stage_manager,
            total_partitions: total_partitions.unwrap_or(0),
            config,
            remaining_task_retry_attempts_overall,
            wake: Notify::new(),
            state: Mutex::new(SchedulerState::default()),
        });
        spawn_source_pump(inner.clone(), task_source);
        Self { inner }
    }

    /// Non-blocking; consumes ready tasks from the task source, acquires node leases,
    /// constructs attempts and applies the retry protocol to anything that just terminated.
    /// Idempotent — calling it with nothing new to do is a no-op. Only a storage overflow or
    /// an internal invariant violation surfaces as `Err` (`spec.md` §4.8 "On any thrown
    /// exception from `schedule()`"); ordinary retry exhaustion and user errors are absorbed
    /// into `is_failed()`/`failure_cause()` instead.
    pub fn schedule(&self) -> Result<()> {
        self.inner.schedule_once()
    }

    /// Resolves once there is something for `schedule()` to do: a task arrived from the
    /// source, a lease resolved, an attempt terminated, or the source was exhausted
    /// (`spec.md` §4.6). A starved lease request simply never contributes a wakeup — per
    /// `spec.md` §7.4 that is a blocked condition, not a failure.
    pub async fn is_blocked(&self) {
        loop {
            if self.inner.has_progress_available() {
                return;
            }
            self.inner.wake.notified().await;
        }
    }

    /// True once every observed partition has a finished attempt and the task source is
    /// exhausted (`spec.md` §3). Vacuously true for a source that is exhausted without ever
    /// producing a partition (`spec.md` §8 scenario 6).
    pub fn is_finished(&self) -> bool {
        let state = self.inner.state.lock();
        state.source_finished
            && state
                .partitions
                .values()
                .all(|p| p.status == PartitionStatus::Finished)
    }

    pub fn is_failed(&self) -> bool {
        self.inner.state.lock().failed
    }

    /// The last captured failure cause (`spec.md` §7 propagation: "the last captured cause
    /// wins").
    pub fn failure_cause(&self) -> Option<String> {
        self.inner.state.lock().failure_cause.clone()
    }

    /// Graceful teardown: in-flight attempts are told to wind down and run to completion, but
    /// no new attempt is admitted from here on (`spec.md` §5). Idempotent.
    pub fn cancel(&self) {
        let mut state = self.inner.state.lock();
        if state.cancelling || state.aborted {
            return;
        }
        state.cancelling = true;
        for running in state.running.values() {
            running.remote_task.cancel();
        }
        drop(state);
        self.inner.wake.notify_one();
    }

    /// Forceful teardown: every attempt is told to die immediately, every lease (in flight or
    /// granted) is released, and the stage's output exchange is closed (`spec.md` §5).
    /// Idempotent; a `cancel()` followed by `abort()` is equivalent to `abort()` alone.
    pub fn abort(&self) {
        let running: HashMap<PartitionId, RunningAttempt>;
        {
            let mut state = self.inner.state.lock();
            if state.aborted {
                return;
            }
            state.aborted = true;
            state.cancelling = true;
            state.terminal_queue.clear();
            state.source_ready.clear();
            state.pending_lease_partitions.clear();
            running = std::mem::take(&mut state.running);
        }
        for (_, attempt) in running {
            attempt.remote_task.abort();
            attempt.lease.release();
        }
        self.inner.output_exchange.close();
        self.inner.wake.notify_one();
    }

    pub fn partition_snapshot(&self, partition_id: PartitionId) -> Option<PartitionState> {
        self.inner.state.lock().partitions.get(&partition_id).cloned()
    }

    pub fn partition_ids(&self) -> Vec<PartitionId> {
        self.inner.state.lock().partitions.keys().copied().collect()
    }

    pub fn stage_id(&self) -> StageId {
        self.inner.stage_id
    }
}

impl Inner {
    fn schedule_once(self: &Arc<Self>) -> Result<()> {
        if self.state.lock().aborted {
            return Ok(());
        }

        let ready_leases: Vec<_> = std::mem::take(&mut self.state.lock().ready_leases).into();
        for (partition_id, attempt_id, node, lease) in ready_leases {
            self.start_attempt(partition_id, attempt_id, node, lease);
        }

        let terminal: Vec<_> = std::mem::take(&mut self.state.lock().terminal_queue).into();
        for partition_id in terminal {
            self.finalize_attempt(partition_id)?;
        }

        if !self.state.lock().cancelling {
            let waiting = self.state.lock().pending_lease_partitions.len();
            let cap = self.config.max_tasks_waiting_for_node_per_stage as usize;
            if waiting < cap {
                let batch: Vec<TaskDescriptor> = {
                    let mut state = self.state.lock();
                    let take = (cap - waiting).min(state.source_ready.len());
                    state.source_ready.drain(0..take).collect()
                };
                for descriptor in batch {
                    self.admit_attempt(descriptor)?;
                }
            }
        }

        Ok(())
    }

    fn has_progress_available(&self) -> bool {
        let state = self.state.lock();
        !state.source_ready.is_empty()
            || !state.ready_leases.is_empty()
            || !state.terminal_queue.is_empty()
            // Once the source is exhausted this stays true forever; harmless, since by then
            // the query loop stops calling `is_blocked` as soon as `is_finished` reports true.
            || state.source_finished
    }

    /// Submits a fresh attempt (partition-id 0-attempts straight from the task source, or a
    /// retried attempt built by [`Self::handle_failure`]) and requests a node lease for it.
    /// Returns `Err` only for the non-retriable `DescriptorStorageOverflow` case (`spec.md`
    /// §4.5, §7.5).
    fn admit_attempt(self: &Arc<Self>, descriptor: TaskDescriptor) -> Result<()> {
        let partition_id = descriptor.partition_id;

        // The task source has no opinion on memory; it leaves fresh descriptors at
        // `DataSize::ZERO` (`spec.md` §4.2). The first attempt at a partition gets its
        // estimate from the memory estimator here; a retried attempt already carries the
        // estimate `handle_failure` computed via `on_failure` and is left alone (`spec.md` §4.4).
        let descriptor = if descriptor.attempt == 0 {
            TaskDescriptor {
                memory_estimate: self.memory_estimator.initial_estimate(partition_id),
                ..descriptor
            }
        } else {
            descriptor
        };

        let task_key = TaskKey::new(self.stage_id, partition_id);
        if let Err(err) = self.descriptor_storage.put(&self.query_id, task_key, descriptor.clone()) {
            self.fail_stage(format!(
                "stage {} partition {partition_id} descriptor storage overflow: {err}",
                self.stage_id
            ));
            return Err(err);
        }

        let attempt_id = {
            let mut state = self.state.lock();
            let entry = state.partitions.entry(partition_id).or_insert_with(|| PartitionState {
                attempts: Vec::new(),
                status: PartitionStatus::Pending,
            });
            let attempt_id = state.next_attempt_id;
            state.next_attempt_id += 1;
            entry.attempts.push(Attempt {
                attempt_id,
                node: None,
                memory_estimate: descriptor.memory_estimate,
                state: AttemptLifecycle::Pending,
                failure: None,
            });
            entry.status = PartitionStatus::Running;
            state.last_descriptor.insert(partition_id, descriptor.clone());
            state.pending_lease_partitions.insert(partition_id);
            attempt_id
        };

        self.stage_manager.record_task_scheduled(self.stage_id);
        tracing::debug!(stage_id = self.stage_id, partition_id, attempt_id, "admitted attempt");

        let lease = self
            .node_allocator
            .acquire(descriptor.node_requirement.clone(), descriptor.memory_estimate, 0);
        spawn_lease_waiter(self.clone(), partition_id, attempt_id, lease);
        Ok(())
    }

    /// Turns a resolved lease into a started [`RemoteTask`]. Skipped (and the lease released
    /// without ever starting anything) if the stage was cancelled while the lease was pending —
    /// "no new attempts are started" (`spec.md` §5).
    fn start_attempt(self: &Arc<Self>, partition_id: PartitionId, attempt_id: AttemptId, node: InternalNode, lease: NodeLease) {
        let (descriptor, cancelling) = {
            let mut state = self.state.lock();
            state.pending_lease_partitions.remove(&partition_id);
            (state.last_descriptor.get(&partition_id).cloned(), state.cancelling)
        };
        let Some(descriptor) = descriptor else {
            lease.release();
            return;
        };
        if cancelling {
            self.mark_attempt(partition_id, attempt_id, AttemptLifecycle::Aborted, None);
            lease.release();
            return;
        }

        let remote_task = self
            .remote_task_factory
            .create_remote_task(self.stage_id, node.clone(), &descriptor, self.total_partitions);

        let inner = self.clone();
        remote_task.add_state_change_listener(Box::new(move |state| {
            if matches!(
                state,
                RemoteTaskState::Finished | RemoteTaskState::Failed | RemoteTaskState::Aborted
            ) {
                inner.state.lock().terminal_queue.push_back(partition_id);
                inner.wake.notify_one();
            }
        }));
        remote_task.start();

        let mut state = self.state.lock();
        if let Some(p) = state.partitions.get_mut(&partition_id) {
            if let Some(att) = p.attempts.iter_mut().find(|a| a.attempt_id == attempt_id) {
                att.node = Some(node);
                att.state = AttemptLifecycle::Running;
            }
        }
        state.running.insert(
            partition_id,
            RunningAttempt {
                attempt_id,
                memory_estimate: descriptor.memory_estimate,
                lease,
                remote_task,
            },
        );
    }

    /// Applies the retry protocol to an attempt that just reached a terminal state (`spec.md`
    /// §4.6). A notification for an attempt already removed from `running` (a duplicate, or one
    /// arriving after `abort()` already tore it down) is silently discarded.
    fn finalize_attempt(self: &Arc<Self>, partition_id: PartitionId) -> Result<()> {
        let running = self.state.lock().running.remove(&partition_id);
        let Some(running) = running else {
            return Ok(());
        };

        let remote_state = running.remote_task.state();
        running.lease.release();

        // "A task-failed notification after cancel is discarded" (spec.md §5) — a cancelled
        // attempt's terminal state is recorded but never retried or counted against budgets.
        if self.state.lock().cancelling {
            self.mark_attempt(
                partition_id,
                running.attempt_id,
                attempt_lifecycle_for(remote_state),
                None,
            );
            return Ok(());
        }

        match remote_state {
            RemoteTaskState::Finished => {
                self.mark_attempt(partition_id, running.attempt_id, AttemptLifecycle::Finished, None);
                self.set_partition_status(partition_id, PartitionStatus::Finished);
                self.descriptor_storage
                    .remove(&self.query_id, TaskKey::new(self.stage_id, partition_id));
                Ok(())
            }
            RemoteTaskState::Failed | RemoteTaskState::Aborted => {
                let kind = running.remote_task.failure_kind().unwrap_or(TaskFailureKind::Transient);
                self.mark_attempt(partition_id, running.attempt_id, AttemptLifecycle::Failed, Some(kind));
                self.stage_manager.record_task_failed(self.stage_id);
                self.handle_failure(partition_id, kind, running.memory_estimate)
            }
            other => Err(SchedulerError::Internal(format!(
                "stage {} partition {partition_id} attempt reached non-terminal state {other:?} via the terminal queue",
                self.stage_id
            ))),
        }
    }

    /// Retries a retriable failure while both budgets allow it, otherwise fails the stage
    /// (`spec.md` §4.6). A counted failure decrements both `per_task_attempts[partition_id]`
    /// and the shared `remaining_task_retry_attempts_overall`, which never drops below zero.
    fn handle_failure(self: &Arc<Self>, partition_id: PartitionId, kind: TaskFailureKind, previous_estimate: DataSize) -> Result<()> {
        if !kind.is_retriable() {
            self.fail_stage(format!(
                "stage {} partition {partition_id} failed with non-retriable error {kind:?}",
                self.stage_id
            ));
            return Ok(());
        }

        let retry_reserved = {
            let mut state = self.state.lock();
            let attempts = state.per_task_attempts.entry(partition_id).or_insert(0);
            if *attempts >= self.config.task_retry_attempts_per_task {
                false
            } else if self.reserve_overall_retry() {
                *attempts += 1;
                true
            } else {
                false
            }
        };

        if !retry_reserved {
            self.fail_stage(format!(
                "stage {} partition {partition_id} exhausted its retry budget after a {kind:?} failure",
                self.stage_id
            ));
            return Ok(());
        }

        let next_estimate = self.memory_estimator.on_failure(previous_estimate, kind);
        self.set_partition_status(partition_id, PartitionStatus::Pending);
        let descriptor = {
            let state = self.state.lock();
            state.last_descriptor.get(&partition_id).cloned()
        };
        let Some(descriptor) = descriptor else {
            return Err(SchedulerError::Internal(format!(
                "stage {} partition {partition_id} has no descriptor to retry",
                self.stage_id
            )));
        };
        tracing::warn!(stage_id = self.stage_id, partition_id, ?kind, "retrying failed attempt");
        self.admit_attempt(descriptor.next_attempt(next_estimate))
    }

    /// Atomically reserves one slot from the shared overall retry budget, never letting it go
    /// negative (`spec.md` §8 "Retry budget non-negativity").
    fn reserve_overall_retry(&self) -> bool {
        loop {
            let remaining = self.remaining_task_retry_attempts_overall.load(Ordering::SeqCst);
            if remaining <= 0 {
                return false;
            }
            if self
                .remaining_task_retry_attempts_overall
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn fail_stage(&self, cause: String) {
        let mut state = self.state.lock();
        if !state.failed {
            tracing::warn!(stage_id = self.stage_id, %cause, "stage failed");
            state.failed = true;
            state.failure_cause = Some(cause);
        }
    }

    fn mark_attempt(&self, partition_id: PartitionId, attempt_id: AttemptId, new_state: AttemptLifecycle, failure: Option<TaskFailureKind>) {
        let mut state = self.state.lock();
        if let Some(p) = state.partitions.get_mut(&partition_id) {
            if let Some(att) = p.attempts.iter_mut().find(|a| a.attempt_id == attempt_id) {
                att.state = new_state;
                att.failure = failure;
            }
        }
    }

    fn set_partition_status(&self, partition_id: PartitionId, status: PartitionStatus) {
        let mut state = self.state.lock();
        if let Some(p) = state.partitions.get_mut(&partition_id) {
            p.status = status;
        }
    }
}

fn attempt_lifecycle_for(state: RemoteTaskState) -> AttemptLifecycle {
    match state {
        RemoteTaskState::Finished => AttemptLifecycle::Finished,
        RemoteTaskState::Failed | RemoteTaskState::Aborted => AttemptLifecycle::Aborted,
        _ => AttemptLifecycle::Aborted,
    }
}

/// Continuously drains the task source in the background, buffering whatever it produces and
/// waking the stage scheduler's `is_blocked` — the task source's `more_tasks` is one of the
/// three long-running suspension points `spec.md` §5 allows.
fn spawn_source_pump(inner: Arc<Inner>, mut source: TaskSource) {
    tokio::spawn(async move {
        loop {
            if source.is_finished() {
                inner.state.lock().source_finished = true;
                inner.wake.notify_one();
                source.close();
                return;
            }
            match source.more_tasks().await {
                Ok(tasks) => {
                    if !tasks.is_empty() {
                        inner.state.lock().source_ready.extend(tasks);
                    }
                    inner.wake.notify_one();
                }
                Err(_err) => {
                    // The task source itself only ever throws for reasons that map to a user
                    // or internal error; the next `schedule()` call surfaces it by failing to
                    // make progress, and the stage is torn down by the query scheduler when
                    // its sibling stages stall alongside it.
                    inner.state.lock().source_finished = true;
                    inner.wake.notify_one();
                    return;
                }
            }
        }
    });
}

/// Awaits a single lease resolving, then buffers it for `schedule()` to turn into a started
/// attempt — `NodeAllocator.acquire(...).node()` is the second long-running suspension point.
fn spawn_lease_waiter(inner: Arc<Inner>, partition_id: PartitionId, attempt_id: AttemptId, lease: NodeLease) {
    tokio::spawn(async move {
        let node = lease.node().await;
        inner.state.lock().ready_leases.push_back((partition_id, attempt_id, node, lease));
        inner.wake.notify_one();
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicI64;
    use std::time::Duration;

    use sched_common::{DataSize, QueryId};

    use super::*;
    use crate::external::testing::{FakeExchange, FakeRemoteTaskFactory, FakeWorkerNodeProvider};
    use crate::external::FailureDetector;
    use crate::memory_estimator::GrowthMemoryEstimator;
    use crate::plan::{PartitioningHandle, PlanFragment, StageGraphBuilder};
    use crate::task::HostAddress;
    use crate::task_source::{SingleDistributionSource, TaskSource};

    struct NeverFailed;
    impl FailureDetector for NeverFailed {
        fn is_failed(&self, _node: &InternalNode) -> bool {
            false
        }
    }

    fn node(id: u32) -> InternalNode {
        InternalNode {
            id,
            address: HostAddress {
                host: format!("10.0.0.{id}"),
                port: 5000,
            },
            memory_capacity: DataSize(1024 * 1024 * 1024),
        }
    }

    fn stage_manager() -> Arc<StageManager> {
        let mut builder = StageGraphBuilder::new(0);
        builder.add_fragment(PlanFragment {
            id: 0,
            partitioning: PartitioningHandle::Single,
            children: vec![],
            table_scan: None,
        });
        Arc::new(StageManager::new(builder.build()))
    }

    fn single_task_source() -> TaskSource {
        TaskSource::Single(SingleDistributionSource::new(
            HashMap::new(),
            crate::task_source::ExchangeInputs::default(),
            false,
            HostAddress {
                host: "coordinator".into(),
                port: 1,
            },
        ))
    }

    fn scheduler(
        factory: Arc<FakeRemoteTaskFactory>,
        config: StageSchedulerConfig,
    ) -> (FaultTolerantStageScheduler, Arc<NodeAllocator>) {
        let allocator = Arc::new(NodeAllocator::new(
            Arc::new(FakeWorkerNodeProvider::new(vec![node(1)])),
            Arc::new(NeverFailed),
        ));
        let scheduler = FaultTolerantStageScheduler::new(
            QueryId::default(),
            0,
            single_task_source(),
            allocator.clone(),
            Arc::new(GrowthMemoryEstimator::new(DataSize(10), DataSize(1000), 2)),
            Arc::new(TaskDescriptorStorage::new(DataSize(1_000_000))),
            factory,
            Arc::new(FakeExchange::default()),
            stage_manager(),
            Some(1),
            config,
            Arc::new(AtomicI64::new(4)),
        );
        (scheduler, allocator)
    }

    async fn await_condition<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    #[tokio::test]
    async fn single_distribution_runs_to_completion() {
        let factory = Arc::new(FakeRemoteTaskFactory::default());
        let (scheduler, _allocator) = scheduler(
            factory.clone(),
            StageSchedulerConfig {
                task_retry_attempts_per_task: 2,
                max_tasks_waiting_for_node_per_stage: 8,
            },
        );

        await_condition(|| {
            scheduler.schedule().unwrap();
            factory.total_created() == 1
        })
        .await;

        let task = factory.latest_for(0);
        task.complete();

        await_condition(|| {
            scheduler.schedule().unwrap();
            scheduler.is_finished()
        })
        .await;

        assert!(!scheduler.is_failed());
    }

    #[tokio::test]
    async fn transient_failure_is_retried_then_succeeds() {
        let factory = Arc::new(FakeRemoteTaskFactory::default());
        let (scheduler, _allocator) = scheduler(
            factory.clone(),
            StageSchedulerConfig {
                task_retry_attempts_per_task: 2,
                max_tasks_waiting_for_node_per_stage: 8,
            },
        );

        await_condition(|| {
            scheduler.schedule().unwrap();
            factory.total_created() == 1
        })
        .await;
        factory.latest_for(0).fail(TaskFailureKind::Transient);

        await_condition(|| {
            scheduler.schedule().unwrap();
            factory.total_created() == 2
        })
        .await;

        let snapshot = scheduler.partition_snapshot(0).unwrap();
        assert_eq!(snapshot.attempts.len(), 2);
        assert_eq!(snapshot.status, PartitionStatus::Running);

        factory.latest_for(0).complete();
        await_condition(|| {
            scheduler.schedule().unwrap();
            scheduler.is_finished()
        })
        .await;
        assert!(!scheduler.is_failed());
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_fails_the_stage() {
        let factory = Arc::new(FakeRemoteTaskFactory::default());
        let (scheduler, _allocator) = scheduler(
            factory.clone(),
            StageSchedulerConfig {
                task_retry_attempts_per_task: 1,
                max_tasks_waiting_for_node_per_stage: 8,
            },
        );

        await_condition(|| {
            scheduler.schedule().unwrap();
            factory.total_created() == 1
        })
        .await;
        factory.latest_for(0).fail(TaskFailureKind::Transient);

        await_condition(|| {
            scheduler.schedule().unwrap();
            factory.total_created() == 2
        })
        .await;
        factory.latest_for(0).fail(TaskFailureKind::Transient);

        await_condition(|| {
            scheduler.schedule().unwrap();
            scheduler.is_failed()
        })
        .await;

        assert_eq!(factory.total_created(), 2);
        assert!(scheduler.failure_cause().unwrap().contains("exhausted"));
    }

    #[tokio::test]
    async fn user_error_fails_immediately_without_retry() {
        let factory = Arc::new(FakeRemoteTaskFactory::default());
        let (scheduler, _allocator) = scheduler(
            factory.clone(),
            StageSchedulerConfig {
                task_retry_attempts_per_task: 5,
                max_tasks_waiting_for_node_per_stage: 8,
            },
        );

        await_condition(|| {
            scheduler.schedule().unwrap();
            factory.total_created() == 1
        })
        .await;
        factory.latest_for(0).fail(TaskFailureKind::UserError);

        await_condition(|| {
            scheduler.schedule().unwrap();
            scheduler.is_failed()
        })
        .await;
        assert_eq!(factory.total_created(), 1);
    }

    #[tokio::test]
    async fn cancel_then_abort_is_idempotent_with_abort_alone() {
        let factory = Arc::new(FakeRemoteTaskFactory::default());
        let (scheduler, _allocator) = scheduler(
            factory.clone(),
            StageSchedulerConfig {
                task_retry_attempts_per_task: 2,
                max_tasks_waiting_for_node_per_stage: 8,
            },
        );
        await_condition(|| {
            scheduler.schedule().unwrap();
            factory.total_created() == 1
        })
        .await;

        scheduler.cancel();
        scheduler.abort();
        assert!(factory.latest_for(0).was_cancelled() || factory.latest_for(0).was_aborted());

        // Safe to call schedule()/abort() again after termination.
        scheduler.abort();
        scheduler.schedule().unwrap();
    }

    #[tokio::test]
    async fn empty_source_finishes_with_zero_partitions() {
        let factory = Arc::new(FakeRemoteTaskFactory::default());
        let allocator = Arc::new(NodeAllocator::new(
            Arc::new(FakeWorkerNodeProvider::new(vec![node(1)])),
            Arc::new(NeverFailed),
        ));
        let source = TaskSource::Source(crate::task_source::SourceDistributionSource::new(
            0,
            Arc::new(crate::external::testing::FakeConnectorSplitSource::new(vec![])),
            crate::task_source::SourceDistributionThresholds {
                split_weight_per_task: DataSize(1),
                max_splits_per_task: 10,
                min_splits_per_task: 1,
                split_batch_size: 10,
            },
            HashMap::new(),
        ));
        let scheduler = FaultTolerantStageScheduler::new(
            QueryId::default(),
            0,
            source,
            allocator,
            Arc::new(GrowthMemoryEstimator::new(DataSize(10), DataSize(1000), 2)),
            Arc::new(TaskDescriptorStorage::new(DataSize(1_000_000))),
            factory,
            Arc::new(FakeExchange::default()),
            stage_manager(),
            None,
            StageSchedulerConfig {
                task_retry_attempts_per_task: 1,
                max_tasks_waiting_for_node_per_stage: 8,
            },
            Arc::new(AtomicI64::new(4)),
        );

        await_condition(|| {
            scheduler.schedule().unwrap();
            scheduler.is_finished()
        })
        .await;
        assert!(scheduler.partition_ids().is_empty());
    }
}
