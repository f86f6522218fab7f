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

//! Value types passed between the task source, the stage scheduler and the worker runtime.
//! Everything here is immutable after construction and compared by content, per `spec.md` §4.1.

use std::collections::{HashMap, HashSet};

use sched_common::{DataSize, PartitionId};

use crate::plan::PlanNodeId;

/// Opaque handle identifying a catalog (e.g. a connector instance). The scheduler never
/// inspects it beyond equality; the worker runtime and node-partitioning manager do.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct CatalogHandle(pub String);

/// Reserved catalog handle carried by synthetic remote splits (`spec.md` §4.2.5).
pub const REMOTE_CATALOG_HANDLE: &str = "$remote";

#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct HostAddress {
    pub host: String,
    pub port: u16,
}

/// Where a task is allowed to run. An empty `addresses` set means "any node"; a non-empty one
/// pins the task to one of those addresses. `catalog_handle` additionally requires the node to
/// host that catalog.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct NodeRequirement {
    pub catalog_handle: Option<CatalogHandle>,
    pub addresses: HashSet<HostAddress>,
}

impl NodeRequirement {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn pinned_to(address: HostAddress) -> Self {
        Self {
            catalog_handle: None,
            addresses: HashSet::from([address]),
        }
    }

    pub fn with_catalog(mut self, catalog_handle: CatalogHandle) -> Self {
        self.catalog_handle = Some(catalog_handle);
        self
    }
}

/// A unit of connector-backed input work.
#[derive(Clone, Debug, PartialEq)]
pub struct ConnectorSplit {
    pub catalog_handle: CatalogHandle,
    pub payload: Vec<u8>,
    pub weight: DataSize,
    pub address: Option<HostAddress>,
    pub bucket: Option<sched_common::BucketId>,
}

/// One already-produced handle from an upstream exchange, addressed to a specific downstream
/// partition.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ExchangeSourceHandle {
    pub id: u64,
    pub target_partition: PartitionId,
    pub size: DataSize,
}

/// A synthetic split wrapping one or more exchange handles, carried on the `REMOTE` catalog
/// handle per `spec.md` §4.2.5.
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteSplit {
    pub handles: Vec<ExchangeSourceHandle>,
}

impl RemoteSplit {
    pub fn size(&self) -> DataSize {
        self.handles.iter().map(|h| h.size).sum()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Split {
    Connector(ConnectorSplit),
    Remote(RemoteSplit),
}

impl Split {
    pub fn weight(&self) -> DataSize {
        match self {
            Split::Connector(c) => c.weight,
            Split::Remote(r) => r.size(),
        }
    }

    pub fn address(&self) -> Option<&HostAddress> {
        match self {
            Split::Connector(c) => c.address.as_ref(),
            Split::Remote(_) => None,
        }
    }

    pub fn catalog_handle(&self) -> Option<CatalogHandle> {
        match self {
            Split::Connector(c) => Some(c.catalog_handle.clone()),
            Split::Remote(_) => Some(CatalogHandle(REMOTE_CATALOG_HANDLE.to_string())),
        }
    }
}

/// One independently-retriable unit of work within a stage. Two descriptors with the same
/// `partition_id` in the same stage are successive attempts, never concurrent (`spec.md` §3).
#[derive(Clone, Debug, PartialEq)]
pub struct TaskDescriptor {
    pub partition_id: PartitionId,
    pub splits: HashMap<PlanNodeId, Vec<Split>>,
    pub node_requirement: NodeRequirement,
    pub memory_estimate: DataSize,
    pub attempt: u32,
}

impl TaskDescriptor {
    pub fn new(
        partition_id: PartitionId,
        splits: HashMap<PlanNodeId, Vec<Split>>,
        node_requirement: NodeRequirement,
        memory_estimate: DataSize,
    ) -> Self {
        Self {
            partition_id,
            splits,
            node_requirement,
            memory_estimate,
            attempt: 0,
        }
    }

    /// Build the next attempt at the same partition with a fresh memory estimate. The splits
    /// and node requirement are unchanged — only the worker placement and estimate evolve
    /// across attempts.
    pub fn next_attempt(&self, memory_estimate: DataSize) -> Self {
        Self {
            partition_id: self.partition_id,
            splits: self.splits.clone(),
            node_requirement: self.node_requirement.clone(),
            memory_estimate,
            attempt: self.attempt + 1,
        }
    }

    pub fn total_weight(&self) -> DataSize {
        self.splits
            .values()
            .flat_map(|v| v.iter())
            .map(Split::weight)
            .sum()
    }
}
