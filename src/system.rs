//! System trait, execution stages and dependency declarations.

use crate::aspect::Aspect;
use crate::command::CommandBuffer;
use crate::component::{self, Component};
use crate::query::QueryDescriptor;
use crate::world::EntityManager;

/// Fixed, ordered execution stages. Systems in a later stage never run
/// before systems in an earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ExecutionStage {
    PreUpdate,
    #[default]
    Update,
    PreRender,
    Render,
}

/// Component sets a system touches, plus the queries it registered.
#[derive(Debug, Clone, Default)]
pub struct SystemDependencies {
    pub reads: Aspect,
    pub writes: Aspect,
    pub queries: Vec<QueryDescriptor>,
}

impl SystemDependencies {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when one side writes something the other touches.
    pub fn conflicts_with(&self, other: &SystemDependencies) -> bool {
        self.writes.intersects(&other.writes)
            || self.writes.intersects(&other.reads)
            || self.reads.intersects(&other.writes)
    }
}

/// Handed to [`System::on_initialize`] to declare dependencies.
pub struct SystemContext<'a> {
    dependencies: &'a mut SystemDependencies,
}

impl<'a> SystemContext<'a> {
    pub fn new(dependencies: &'a mut SystemDependencies) -> Self {
        Self { dependencies }
    }

    pub fn reads<T: Component>(&mut self) {
        let id = component::register_component::<T>().expect("component id space exhausted");
        self.dependencies.reads = self.dependencies.reads.add(&[id]);
    }

    pub fn writes<T: Component>(&mut self) {
        let id = component::register_component::<T>().expect("component id space exhausted");
        self.dependencies.writes = self.dependencies.writes.add(&[id]);
    }

    /// Registers a query; its read/write aspects fold into the system's
    /// dependency sets.
    pub fn register_query(&mut self, descriptor: QueryDescriptor) {
        self.dependencies.reads = self
            .dependencies
            .reads
            .add(descriptor.reads.component_ids());
        self.dependencies.writes = self
            .dependencies
            .writes
            .add(descriptor.writes.component_ids());
        self.dependencies.queries.push(descriptor);
    }
}

/// A unit of frame logic. Runs to completion when scheduled.
pub trait System: Send {
    fn name(&self) -> &'static str;

    fn stage(&self) -> ExecutionStage {
        ExecutionStage::Update
    }

    /// Declare component reads/writes and queries. Called once at
    /// registration.
    fn on_initialize(&mut self, _ctx: &mut SystemContext<'_>) {}

    /// Called once, before the system's first update.
    fn on_start(&mut self, _manager: &mut EntityManager) {}

    /// Per-frame work. Structural changes go through `commands`; the
    /// scheduler commits the buffer at this system's execution boundary.
    fn on_update(&mut self, manager: &mut EntityManager, commands: &mut CommandBuffer, dt: f32);

    fn on_destroy(&mut self, _manager: &mut EntityManager) {}
}

/// Boxed system
pub type BoxedSystem = Box<dyn System>;
