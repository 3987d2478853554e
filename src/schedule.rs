//! Single-threaded system scheduler.
//!
//! Builds a dependency graph (stage ordering plus access conflicts within a
//! stage), runs systems in topological order, and commits each system's
//! command buffer at its execution boundary. Modification tracking and the
//! frame scratch rewind between frames.

use std::collections::VecDeque;

use crate::command::CommandBuffer;
use crate::error::{EcsError, Result};
use crate::memory::FrameScratch;
use crate::system::{BoxedSystem, ExecutionStage, SystemContext, SystemDependencies};
use crate::world::EntityManager;

struct SystemEntry {
    system: BoxedSystem,
    dependencies: SystemDependencies,
    stage: ExecutionStage,
    started: bool,
}

pub struct SystemScheduler {
    systems: Vec<SystemEntry>,
    order: Option<Vec<usize>>,
}

impl SystemScheduler {
    pub fn new() -> Self {
        Self {
            systems: Vec::new(),
            order: None,
        }
    }

    /// Registers a system, running its `on_initialize` to collect
    /// dependencies. Invalidates the execution order.
    pub fn add_system(&mut self, mut system: BoxedSystem) -> usize {
        let mut dependencies = SystemDependencies::new();
        system.on_initialize(&mut SystemContext::new(&mut dependencies));
        let stage = system.stage();
        tracing::debug!(name = system.name(), ?stage, "registered system");
        self.systems.push(SystemEntry {
            system,
            dependencies,
            stage,
            started: false,
        });
        self.order = None;
        self.systems.len() - 1
    }

    pub fn system_count(&self) -> usize {
        self.systems.len()
    }

    pub fn dependencies(&self, index: usize) -> &SystemDependencies {
        &self.systems[index].dependencies
    }

    /// A must precede B when A's stage is earlier, or, within one stage,
    /// when A was registered first and their access sets conflict.
    fn build_order(&self) -> Result<Vec<usize>> {
        let count = self.systems.len();
        let mut edges: Vec<Vec<usize>> = vec![Vec::new(); count];
        let mut in_degree = vec![0usize; count];

        for i in 0..count {
            for j in (i + 1)..count {
                let (earlier, later) = match self.systems[i].stage.cmp(&self.systems[j].stage) {
                    std::cmp::Ordering::Less => (i, j),
                    std::cmp::Ordering::Greater => (j, i),
                    std::cmp::Ordering::Equal => {
                        if self.systems[i]
                            .dependencies
                            .conflicts_with(&self.systems[j].dependencies)
                        {
                            (i, j)
                        } else {
                            continue;
                        }
                    }
                };
                edges[earlier].push(later);
                in_degree[later] += 1;
            }
        }

        // Kahn's algorithm; seeding in index order keeps ties deterministic.
        let mut queue: VecDeque<usize> = (0..count).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(count);
        while let Some(current) = queue.pop_front() {
            order.push(current);
            for &next in &edges[current] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() != count {
            return Err(EcsError::SystemCycleDetected);
        }
        Ok(order)
    }

    /// Finalizes the execution order; called lazily by `update`.
    pub fn build(&mut self) -> Result<()> {
        if self.order.is_none() {
            self.order = Some(self.build_order()?);
        }
        Ok(())
    }

    pub fn execution_order(&mut self) -> Result<&[usize]> {
        self.build()?;
        Ok(self.order.as_deref().expect("order just built"))
    }

    /// Runs one frame: every system in dependency order, each followed by
    /// its command buffer's commit.
    pub fn update(&mut self, manager: &mut EntityManager, dt: f32) -> Result<()> {
        self.build()?;

        // Frame boundary: last frame's modification bits and scratch are done.
        manager.reset_all_modification_tracking();
        FrameScratch::reset_frame();

        let order = self.order.clone().expect("order built above");
        for index in order {
            let entry = &mut self.systems[index];
            if !entry.started {
                entry.system.on_start(manager);
                entry.started = true;
            }
            let mut commands = CommandBuffer::new();
            entry.system.on_update(manager, &mut commands, dt);
            commands.commit(manager)?;
        }
        Ok(())
    }

    /// Conflict analysis over the registered systems. Execution stays
    /// single-threaded; the grouping documents what a parallel executor
    /// could overlap without changing observable order.
    pub fn analyze_parallelization(&self) -> crate::dependency::DependencyGraph {
        let systems: Vec<_> = self
            .systems
            .iter()
            .map(|entry| (entry.stage, entry.dependencies.clone()))
            .collect();
        crate::dependency::DependencyGraph::new(&systems)
    }

    /// Tears all systems down in registration order.
    pub fn shutdown(&mut self, manager: &mut EntityManager) {
        for entry in &mut self.systems {
            entry.system.on_destroy(manager);
        }
        self.systems.clear();
        self.order = None;
    }
}

impl Default for SystemScheduler {
    fn default() -> Self {
        Self::new()
    }
}
