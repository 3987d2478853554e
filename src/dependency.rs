//! Dependency-graph analysis over registered systems.
//!
//! Execution stays single-threaded in scheduler order; this module only
//! reports which systems *could* run together because their access sets
//! never conflict. A parallel executor may consume the grouping as long as
//! it preserves the scheduler's observable ordering.

use crate::system::{ExecutionStage, SystemDependencies};

/// Systems (by scheduler index) whose access sets are mutually disjoint.
#[derive(Debug, Clone, Default)]
pub struct CompatibilityGroup {
    pub systems: Vec<usize>,
}

impl CompatibilityGroup {
    fn accepts(&self, candidate: &SystemDependencies, all: &[SystemDependencies]) -> bool {
        self.systems
            .iter()
            .all(|&index| !candidate.conflicts_with(&all[index]))
    }
}

/// Conflict structure of one execution stage.
#[derive(Debug, Clone)]
pub struct StageAnalysis {
    pub stage: ExecutionStage,
    pub groups: Vec<CompatibilityGroup>,
}

/// Read/write conflict analysis across all registered systems.
pub struct DependencyGraph {
    stages: Vec<StageAnalysis>,
    system_count: usize,
}

impl DependencyGraph {
    /// Builds the analysis from each system's (stage, dependencies) pair,
    /// in registration order.
    pub fn new(systems: &[(ExecutionStage, SystemDependencies)]) -> Self {
        let mut stages: Vec<StageAnalysis> = Vec::new();
        let dependencies: Vec<SystemDependencies> =
            systems.iter().map(|(_, deps)| deps.clone()).collect();

        for (index, (stage, deps)) in systems.iter().enumerate() {
            let stage_slot = match stages.iter().position(|entry| entry.stage == *stage) {
                Some(position) => position,
                None => {
                    stages.push(StageAnalysis {
                        stage: *stage,
                        groups: Vec::new(),
                    });
                    stages.len() - 1
                }
            };
            let analysis = &mut stages[stage_slot];

            // Greedy packing: first group whose members never touch what
            // this system writes (and vice versa).
            match analysis
                .groups
                .iter_mut()
                .find(|group| group.accepts(deps, &dependencies))
            {
                Some(group) => group.systems.push(index),
                None => analysis.groups.push(CompatibilityGroup {
                    systems: vec![index],
                }),
            }
        }

        stages.sort_by_key(|entry| entry.stage);
        Self {
            stages,
            system_count: systems.len(),
        }
    }

    pub fn stages(&self) -> &[StageAnalysis] {
        &self.stages
    }

    pub fn system_count(&self) -> usize {
        self.system_count
    }

    /// Number of sequential steps a conflict-respecting executor needs.
    pub fn critical_path_len(&self) -> usize {
        self.stages.iter().map(|entry| entry.groups.len()).sum()
    }

    /// Largest set of systems that could run concurrently.
    pub fn max_parallelism(&self) -> usize {
        self.stages
            .iter()
            .flat_map(|entry| entry.groups.iter())
            .map(|group| group.systems.len())
            .max()
            .unwrap_or(0)
    }
}
