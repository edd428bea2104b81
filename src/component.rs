//! Component type registration and per-type packed storage.
//!
//! [`Registry`] assigns each Rust type a small integer id the first time it
//! is seen, following the same fast-path/slow-path split the rest of this
//! codebase uses for lazily-populated shared tables: a concurrent map is
//! checked first (wait-free on hit), and only a miss takes the heavier path
//! of allocating a new id and recording the type's layout.
//!
//! [`ComponentPool`] is deliberately untyped: it stores `element_size`-byte
//! records in a packed byte buffer, indexed by a [`SparseSet`], and treats
//! every component as plain-old-data (no destructors are run on removal or
//! overwrite). [`World`](crate::world::World) layers a typed `add`/`get` API
//! over this using `size_of`/`ptr::read`/`ptr::write`.

use std::any::TypeId;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::RwLock;

use dashmap::DashMap;

use crate::config::MAX_COMPONENTS;
use crate::entity::Entity;
use crate::sparse_set::SparseSet;

/// Small integer identifying a registered component type.
pub type ComponentId = usize;

#[derive(Clone, Copy)]
struct ComponentInfo {
    element_size: usize,
}

/// Maps Rust types to stable [`ComponentId`]s and records their layout.
///
/// Registration is append-only: once a type is registered its id never
/// changes for the lifetime of the registry.
pub struct Registry {
    type_map: DashMap<TypeId, ComponentId>,
    infos: RwLock<Vec<ComponentInfo>>,
    next_id: AtomicU32,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            type_map: DashMap::new(),
            infos: RwLock::new(Vec::new()),
            next_id: AtomicU32::new(0),
        }
    }

    /// Registers `T` if not already known, returning its stable id.
    pub fn register<T: 'static>(&self) -> ComponentId {
        let type_id = TypeId::of::<T>();
        if let Some(id) = self.type_map.get(&type_id) {
            return *id;
        }
        self.register_with_size(type_id, std::mem::size_of::<T>())
    }

    fn register_with_size(&self, key: TypeId, element_size: usize) -> ComponentId {
        let entry = self.type_map.entry(key).or_insert_with(|| {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed) as usize;
            assert!(id < MAX_COMPONENTS, "exceeded MAX_COMPONENTS ({MAX_COMPONENTS})");
            let mut infos = self.infos.write().unwrap();
            if infos.len() <= id {
                infos.resize(id + 1, ComponentInfo { element_size: 0 });
            }
            infos[id] = ComponentInfo { element_size };
            log::debug!("registered component id {id} (size {element_size})");
            id
        });
        *entry
    }

    /// Registers a component type with no Rust type behind it at all (a
    /// foreign or FFI-defined layout): always allocates a fresh id, since
    /// there is no `TypeId` to dedupe against.
    pub fn register_raw(&self, element_size: usize) -> ComponentId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) as usize;
        assert!(id < MAX_COMPONENTS, "exceeded MAX_COMPONENTS ({MAX_COMPONENTS})");
        let mut infos = self.infos.write().unwrap();
        if infos.len() <= id {
            infos.resize(id + 1, ComponentInfo { element_size: 0 });
        }
        infos[id] = ComponentInfo { element_size };
        log::debug!("registered raw component id {id} (size {element_size})");
        id
    }

    pub fn element_size(&self, id: ComponentId) -> usize {
        self.infos.read().unwrap()[id].element_size
    }

    pub fn count(&self) -> usize {
        self.infos.read().unwrap().len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Packed, type-erased storage for every instance of one component type.
pub struct ComponentPool {
    element_size: usize,
    index: SparseSet,
    data: Vec<u8>,
}

impl ComponentPool {
    pub fn new(element_size: usize) -> Self {
        Self { element_size, index: SparseSet::new(), data: Vec::new() }
    }

    fn ensure_data_capacity(&mut self, slots: usize) {
        let needed = slots * self.element_size;
        if self.data.len() < needed {
            self.data.resize(needed, 0);
        }
    }

    fn slot_range(&self, dense_idx: usize) -> std::ops::Range<usize> {
        let start = dense_idx * self.element_size;
        start..start + self.element_size
    }

    pub fn has(&self, entity: Entity) -> bool {
        self.index.has(entity)
    }

    /// Inserts a zeroed slot for `entity` if absent, returning a pointer to
    /// its (possibly pre-existing) storage.
    pub fn add_raw(&mut self, entity: Entity) -> *mut u8 {
        let dense_idx = self.index.insert(entity);
        self.ensure_data_capacity(self.index.len());
        let range = self.slot_range(dense_idx);
        self.data[range].as_mut_ptr()
    }

    pub fn get_raw(&self, entity: Entity) -> Option<*const u8> {
        let dense_idx = self.index.index_of(entity)?;
        let range = self.slot_range(dense_idx);
        Some(self.data[range].as_ptr())
    }

    pub fn get_raw_mut(&mut self, entity: Entity) -> Option<*mut u8> {
        let dense_idx = self.index.index_of(entity)?;
        let range = self.slot_range(dense_idx);
        Some(self.data[range].as_mut_ptr())
    }

    /// Removes `entity`'s component via swap-with-last. No destructor runs;
    /// components are treated as plain-old-data.
    pub fn remove(&mut self, entity: Entity) -> bool {
        let Some((removed_idx, moved)) = self.index.remove(entity) else {
            return false;
        };
        if let Some(moved_entity) = moved {
            let last_idx = self.index.index_of(moved_entity).unwrap();
            debug_assert_eq!(last_idx, removed_idx);
            let (elem_size, dst_start) = (self.element_size, removed_idx * self.element_size);
            let src_start = (self.index.len()) * elem_size;
            let (dst, src) = self.data.split_at_mut(src_start);
            dst[dst_start..dst_start + elem_size].copy_from_slice(&src[..elem_size]);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn entities(&self) -> &[Entity] {
        self.index.entities()
    }
}
