// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Shared-component interning through the public API: refcount conservation
//! across structural changes, copy-on-write isolation, teardown.

use aspect_ecs::EntityManager;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Transform {
    x: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RenderMaterial {
    shader: &'static str,
    tint: u32,
}

const STEEL: RenderMaterial = RenderMaterial {
    shader: "pbr",
    tint: 0x888899,
};

#[test]
fn refcounts_are_conserved_across_archetype_moves() {
    let mut manager = EntityManager::new();
    let entities = manager.create_entities(8).unwrap();

    for &entity in &entities {
        manager.set_shared(entity, STEEL).unwrap();
    }
    assert_eq!(
        manager.shared_ref_count::<RenderMaterial>(entities[0]).unwrap(),
        8
    );

    // Structural churn relocates the handle column; no refcount drift.
    for &entity in &entities {
        manager.add_component(entity, Transform { x: 0.0 }).unwrap();
    }
    for &entity in &entities[..4] {
        manager.remove_component::<Transform>(entity).unwrap();
    }
    assert_eq!(
        manager.shared_ref_count::<RenderMaterial>(entities[0]).unwrap(),
        8
    );

    for &entity in &entities[..5] {
        manager.destroy_entity(entity).unwrap();
    }
    assert_eq!(
        manager.shared_ref_count::<RenderMaterial>(entities[5]).unwrap(),
        3
    );
}

#[test]
fn setting_the_same_value_twice_is_stable() {
    let mut manager = EntityManager::new();
    let entity = manager.create_entity().unwrap();

    manager.set_shared(entity, STEEL).unwrap();
    manager.set_shared(entity, STEEL).unwrap();
    assert_eq!(manager.shared_ref_count::<RenderMaterial>(entity).unwrap(), 1);
    assert_eq!(manager.get_shared::<RenderMaterial>(entity).unwrap(), STEEL);
}

#[test]
fn data_only_updates_swap_interned_values() {
    let mut manager = EntityManager::new();
    let a = manager.create_entity().unwrap();
    let b = manager.create_entity().unwrap();

    manager.set_shared(a, STEEL).unwrap();
    manager.set_shared(b, STEEL).unwrap();
    assert_eq!(manager.shared_ref_count::<RenderMaterial>(a).unwrap(), 2);

    let brass = RenderMaterial {
        shader: "pbr",
        tint: 0xAA8844,
    };
    manager.set_shared(a, brass.clone()).unwrap();

    assert_eq!(manager.get_shared::<RenderMaterial>(a).unwrap(), brass);
    assert_eq!(manager.get_shared::<RenderMaterial>(b).unwrap(), STEEL);
    assert_eq!(manager.shared_ref_count::<RenderMaterial>(a).unwrap(), 1);
    assert_eq!(manager.shared_ref_count::<RenderMaterial>(b).unwrap(), 1);
}

#[test]
fn copy_on_write_isolates_writers_from_readers() {
    let mut manager = EntityManager::new();
    let writer = manager.create_entity().unwrap();
    let reader = manager.create_entity().unwrap();
    manager.set_shared(writer, STEEL).unwrap();
    manager.set_shared(reader, STEEL).unwrap();

    manager
        .update_shared(writer, |material: &mut RenderMaterial| {
            material.tint = 0xFF0000;
        })
        .unwrap();

    assert_eq!(manager.get_shared::<RenderMaterial>(reader).unwrap(), STEEL);
    assert_eq!(
        manager.get_shared::<RenderMaterial>(writer).unwrap().tint,
        0xFF0000
    );
    assert_eq!(manager.shared_ref_count::<RenderMaterial>(writer).unwrap(), 1);
    assert_eq!(manager.shared_ref_count::<RenderMaterial>(reader).unwrap(), 1);
}

#[test]
fn with_shared_reads_under_the_pool_lock() {
    let mut manager = EntityManager::new();
    let entity = manager.create_entity().unwrap();
    manager.set_shared(entity, STEEL).unwrap();

    let tint = manager
        .with_shared(entity, |material: &RenderMaterial| material.tint)
        .unwrap();
    assert_eq!(tint, STEEL.tint);
}
