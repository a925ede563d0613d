//! Dependency resolution for pipeline definitions.
//!
//! [`StageGraph::build`] validates a [`PipelineDefinition`] statically (ids,
//! dependencies, cycles) and [`StageGraph::parallel_groups`] layers it with
//! Kahn's algorithm: level `k` holds exactly the stages whose dependencies all
//! sit in levels `< k`.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::stage::{PipelineDefinition, Stage};

/// Index into the stage list.
pub type StageIndex = usize;

/// Stages with no dependencies on each other, eligible to run concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelGroup {
    pub level: usize,
    pub stages: Vec<String>,
}

/// A validated directed acyclic graph of stages.
#[derive(Debug)]
pub struct StageGraph<'a> {
    stages: Vec<&'a Stage>,
    index_map: HashMap<&'a str, StageIndex>,
    /// index -> stages that depend on it
    forward_edges: Vec<Vec<StageIndex>>,
    /// index -> stages it depends on
    reverse_edges: Vec<Vec<StageIndex>>,
}

impl<'a> StageGraph<'a> {
    /// Build and validate the graph of `def`.
    ///
    /// Rejects empty, duplicate or path-like stage ids, duplicate task ids
    /// across the pipeline, dependencies on unknown stages, and cycles.
    pub fn build(def: &'a PipelineDefinition) -> Result<Self, ConfigError> {
        let mut index_map = HashMap::new();
        let mut task_ids = HashSet::new();
        for (i, stage) in def.stages.iter().enumerate() {
            if stage.id.trim().is_empty() {
                return Err(ConfigError::EmptyStageId);
            }
            if stage.id.contains(['/', '\\']) || stage.id.contains("..") {
                return Err(ConfigError::InvalidStageId {
                    id: stage.id.clone(),
                });
            }
            if index_map.insert(stage.id.as_str(), i).is_some() {
                return Err(ConfigError::DuplicateStage {
                    id: stage.id.clone(),
                });
            }
            for task in &stage.tasks {
                if !task_ids.insert(task.id.as_str()) {
                    return Err(ConfigError::DuplicateTask {
                        id: task.id.clone(),
                    });
                }
            }
        }

        let mut forward_edges: Vec<Vec<StageIndex>> = vec![Vec::new(); def.stages.len()];
        let mut reverse_edges: Vec<Vec<StageIndex>> = vec![Vec::new(); def.stages.len()];

        for (to_idx, stage) in def.stages.iter().enumerate() {
            for dep in &stage.depends_on {
                let from_idx = *index_map.get(dep.as_str()).ok_or_else(|| {
                    ConfigError::UnknownDependency {
                        stage: stage.id.clone(),
                        dependency: dep.clone(),
                    }
                })?;
                // Repeated entries in depends_on count once.
                if !reverse_edges[to_idx].contains(&from_idx) {
                    forward_edges[from_idx].push(to_idx);
                    reverse_edges[to_idx].push(from_idx);
                }
            }
        }

        let graph = Self {
            stages: def.stages.iter().collect(),
            index_map,
            forward_edges,
            reverse_edges,
        };
        // Layering doubles as cycle detection.
        graph.levels()?;
        Ok(graph)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage(&self, id: &str) -> Option<&'a Stage> {
        self.index_map.get(id).map(|&i| self.stages[i])
    }

    /// Stages that directly depend on `id`.
    pub fn dependents(&self, id: &str) -> Vec<&'a str> {
        self.index_map
            .get(id)
            .map(|&i| {
                self.forward_edges[i]
                    .iter()
                    .map(|&d| self.stages[d].id.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Stages `id` directly depends on.
    pub fn dependencies(&self, id: &str) -> Vec<&'a str> {
        self.index_map
            .get(id)
            .map(|&i| {
                self.reverse_edges[i]
                    .iter()
                    .map(|&d| self.stages[d].id.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Kahn's algorithm, one level per round. Stages keep their declaration
    /// order inside a level.
    fn levels(&self) -> Result<Vec<Vec<StageIndex>>, ConfigError> {
        let mut in_degree: Vec<usize> = self.reverse_edges.iter().map(Vec::len).collect();
        let mut current: Vec<StageIndex> = (0..self.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut levels = Vec::new();
        let mut processed = 0;

        while !current.is_empty() {
            processed += current.len();
            let mut next = Vec::new();
            for &node in &current {
                for &dependent in &self.forward_edges[node] {
                    in_degree[dependent] -= 1;
                    if in_degree[dependent] == 0 {
                        next.push(dependent);
                    }
                }
            }
            next.sort_unstable();
            levels.push(current);
            current = next;
        }

        if processed != self.len() {
            let stages = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .map(|(i, _)| self.stages[i].id.clone())
                .collect();
            return Err(ConfigError::CycleDetected { stages });
        }

        Ok(levels)
    }

    /// The parallel groups of the graph, level 0 first.
    pub fn parallel_groups(&self) -> Vec<ParallelGroup> {
        // build() already rejected cycles.
        self.levels()
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(level, indices)| ParallelGroup {
                level,
                stages: indices
                    .into_iter()
                    .map(|i| self.stages[i].id.clone())
                    .collect(),
            })
            .collect()
    }

    /// Stage ids flattened level by level: a valid topological order.
    pub fn topological_order(&self) -> Vec<String> {
        self.parallel_groups()
            .into_iter()
            .flat_map(|g| g.stages)
            .collect()
    }
}

/// Validate `def` and compute its parallel groups.
pub fn find_parallel_groups(def: &PipelineDefinition) -> Result<Vec<ParallelGroup>, ConfigError> {
    Ok(StageGraph::build(def)?.parallel_groups())
}
