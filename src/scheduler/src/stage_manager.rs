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

//! Holds stages in topological order and aggregates their stats (`spec.md` §4.7). Transitions
//! stages on behalf of the query scheduler and ensures `finish`/`abort` are only ever broadcast
//! once per stage, so a retried notification after a stage has already terminated is a no-op.

use std::collections::HashSet;
use std::time::Duration;

use parking_lot::Mutex;
use sched_common::{DataSize, StageId};

use crate::plan::{Stage, StageGraph, StageLifecycle};

/// Aggregated bookkeeping for one stage (`spec.md` §4.7 "aggregated stats"). This is pure
/// bookkeeping — it never feeds back into retry budgets or task enumeration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StageStats {
    pub cpu_time: Duration,
    pub peak_memory: DataSize,
    pub tasks_scheduled: u32,
    pub tasks_failed: u32,
}

impl StageStats {
    fn record_cpu_time(&mut self, cpu_time: Duration) {
        self.cpu_time += cpu_time;
    }

    fn record_memory(&mut self, memory: DataSize) {
        self.peak_memory = self.peak_memory.max(memory);
    }
}

/// `StageStats` rolled up across every stage of a query (`spec.md` §4.9, SPEC_FULL).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueryStats {
    pub cpu_time: Duration,
    pub peak_memory: DataSize,
    pub tasks_scheduled: u32,
    pub tasks_failed: u32,
}

struct StageRuntime {
    lifecycle: StageLifecycle,
    stats: StageStats,
    terminated_broadcast: bool,
}

impl Default for StageRuntime {
    fn default() -> Self {
        Self {
            lifecycle: StageLifecycle::Planned,
            stats: StageStats::default(),
            terminated_broadcast: false,
        }
    }
}

/// Owns a [`StageGraph`] plus the mutable runtime state (lifecycle, stats) the query scheduler
/// drives it through.
pub struct StageManager {
    graph: StageGraph,
    runtime: Mutex<std::collections::HashMap<StageId, StageRuntime>>,
}

impl StageManager {
    pub fn new(graph: StageGraph) -> Self {
        let runtime = graph
            .stages
            .keys()
            .map(|id| (*id, StageRuntime::default()))
            .collect();
        Self {
            graph,
            runtime: Mutex::new(runtime),
        }
    }

    pub fn root_stage_id(&self) -> StageId {
        self.graph.root_stage_id
    }

    /// Stage ids in the order the query scheduler should construct exchanges and schedulers:
    /// children before parents (`spec.md` §4.8 step 1).
    pub fn stage_ids_by_topo_order(&self) -> Vec<StageId> {
        self.graph.stage_ids_by_topo_order()
    }

    pub fn get_stage(&self, stage_id: StageId) -> &Stage {
        self.graph.get_stage(stage_id)
    }

    pub fn children(&self, stage_id: StageId) -> &HashSet<StageId> {
        self.graph.children(stage_id)
    }

    pub fn parents(&self, stage_id: StageId) -> &HashSet<StageId> {
        self.graph.parents(stage_id)
    }

    pub fn lifecycle(&self, stage_id: StageId) -> StageLifecycle {
        self.runtime.lock().get(&stage_id).map(|r| r.lifecycle).unwrap_or(StageLifecycle::Planned)
    }

    /// Moves `stage_id` to `lifecycle`. A no-op once the stage has already reached a terminal
    /// state — terminal states never regress (`spec.md` §3 Lifecycles).
    pub fn transition(&self, stage_id: StageId, lifecycle: StageLifecycle) {
        let mut runtime = self.runtime.lock();
        let entry = runtime.entry(stage_id).or_default();
        if entry.lifecycle.is_terminal() {
            return;
        }
        tracing::info!(stage_id, ?lifecycle, "stage lifecycle transition");
        entry.lifecycle = lifecycle;
    }

    pub fn record_task_scheduled(&self, stage_id: StageId) {
        self.runtime.lock().entry(stage_id).or_default().stats.tasks_scheduled += 1;
    }

    pub fn record_task_failed(&self, stage_id: StageId) {
        self.runtime.lock().entry(stage_id).or_default().stats.tasks_failed += 1;
    }

    pub fn record_resource_usage(&self, stage_id: StageId, cpu_time: Duration, memory: DataSize) {
        let mut runtime = self.runtime.lock();
        let entry = runtime.entry(stage_id).or_default();
        entry.stats.record_cpu_time(cpu_time);
        entry.stats.record_memory(memory);
    }

    pub fn stats(&self, stage_id: StageId) -> StageStats {
        self.runtime.lock().get(&stage_id).map(|r| r.stats).unwrap_or_default()
    }

    pub fn query_stats(&self) -> QueryStats {
        let runtime = self.runtime.lock();
        let mut total = QueryStats::default();
        for r in runtime.values() {
            total.cpu_time += r.stats.cpu_time;
            total.peak_memory = total.peak_memory.max(r.stats.peak_memory);
            total.tasks_scheduled += r.stats.tasks_scheduled;
            total.tasks_failed += r.stats.tasks_failed;
        }
        total
    }

    /// True the first time this is called for a terminated stage; false on every call after,
    /// so callers can broadcast `finish`/`abort` exactly once (`spec.md` §4.7).
    pub fn mark_terminal_broadcast(&self, stage_id: StageId) -> bool {
        let mut runtime = self.runtime.lock();
        let entry = runtime.entry(stage_id).or_default();
        if entry.terminated_broadcast {
            false
        } else {
            entry.terminated_broadcast = true;
            true
        }
    }

    pub fn all_stage_ids(&self) -> Vec<StageId> {
        self.graph.stages.keys().copied().collect()
    }

    pub fn all_terminal(&self) -> bool {
        let runtime = self.runtime.lock();
        self.graph.stages.keys().all(|id| {
            runtime
                .get(id)
                .map(|r| r.lifecycle.is_terminal())
                .unwrap_or(false)
        })
    }

    pub fn any_failed(&self) -> bool {
        let runtime = self.runtime.lock();
        runtime.values().any(|r| r.lifecycle == StageLifecycle::Failed)
    }
}
