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

//! Value types and error plumbing shared by every scheduler crate.

pub mod error;
pub mod ids;
pub mod size;

pub use error::{Result, SchedulerError, TaskFailureKind};
pub use ids::{AttemptId, BucketId, PartitionId, QueryId, StageId, TaskId};
pub use size::DataSize;
