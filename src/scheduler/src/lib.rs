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

//! Fault-tolerant query scheduler core (`spec.md` §4 C1-C8): the task-source family, node
//! allocator, memory estimator, descriptor storage, per-stage scheduler, stage manager and the
//! top-level query scheduler. SQL parsing/planning, the exchange implementation, the worker
//! runtime, the catalog manager and connector split generation are external collaborators,
//! modeled as traits in [`external`].

pub mod config;
pub mod external;
pub mod memory_estimator;
pub mod node_allocator;
pub mod plan;
pub mod query_scheduler;
pub mod stage_manager;
pub mod stage_scheduler;
pub mod task;
pub mod task_descriptor_storage;
pub mod task_source;

pub use sched_common::{Result, SchedulerError, TaskFailureKind};
