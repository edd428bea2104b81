//! Public entry point: entity lifecycle, component storage, system
//! registration, and stage-by-stage dispatch.
//!
//! `World` exposes everything through `&self`: entities, component pools,
//! and the schedule are each guarded by their own lock (or, for the entity
//! allocator, lock-free atomics). Concurrent callers, including system
//! callbacks running on task-pool workers, never need `&mut World`. The
//! one exception is structural mutation while a stage is executing
//! (`add`/`remove`/`destroy`), which is deferred into the calling task's
//! [`CommandBuffer`] rather than touching a pool directly; see
//! [`crate::command`] for why.
//!
//! Dispatch borrows `&World` for the lifetime of one `progress`/`run_system`
//! call and hands that borrow to task-pool workers as a raw pointer,
//! because the underlying [`crate::task_pool::TaskPool`] requires `'static`
//! jobs. This is sound only because `progress` always calls
//! [`crate::task_pool::TaskPool::wait`] before returning, so no worker can
//! observe the pointer after the borrow ends. It is the same discipline a
//! scoped-thread abstraction enforces, just without a named lifetime
//! parameter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crate::bitset::Bitset;
use crate::command::{self, Command, CommandBuffer};
use crate::component::{ComponentId, ComponentPool, Registry};
use crate::config::WorldConfig;
use crate::entity::{Allocator, Entity};
use crate::error::{ProgressError, SystemError};
use crate::scheduler::{self, Scheduler, SystemId};
use crate::task_pool::TaskPool;

struct StageOutcome {
    panicked: AtomicBool,
    error: Mutex<Option<SystemError>>,
}

impl StageOutcome {
    fn new() -> Self {
        Self { panicked: AtomicBool::new(false), error: Mutex::new(None) }
    }

    fn record_panic(&self) {
        self.panicked.store(true, Ordering::Release);
    }

    fn record_error(&self, err: SystemError) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn into_result(self) -> Result<(), ProgressError> {
        if self.panicked.load(Ordering::Acquire) {
            return Err(ProgressError::TaskPanicked { code: -1 });
        }
        if let Some(err) = self.error.into_inner().unwrap() {
            return Err(ProgressError::SystemFailed(err));
        }
        Ok(())
    }
}

/// The ECS runtime: entities, component pools, systems, and the scheduler
/// that dispatches them.
pub struct World {
    allocator: Allocator,
    registry: Registry,
    pools: RwLock<Vec<RwLock<ComponentPool>>>,
    entity_bits: RwLock<Vec<Bitset>>,
    scheduler: Mutex<Scheduler>,
    command_buffers: Vec<Mutex<CommandBuffer>>,
    task_pool: Option<Arc<TaskPool>>,
    task_count: usize,
    in_progress: AtomicBool,
}

impl World {
    /// A single-threaded world: `progress`/`run_system` dispatch serially
    /// on the calling thread.
    pub fn new() -> Self {
        Self::with_config(WorldConfig::default())
    }

    /// A world whose systems are sliced across `config.task_count` tasks
    /// and, when `task_count > 1`, run on a backing task pool.
    pub fn with_config(config: WorldConfig) -> Self {
        let task_count = config.task_count.max(1);
        let command_buffers = (0..task_count)
            .map(|_| {
                Mutex::new(CommandBuffer::new(
                    config.cmd_buffer_initial_commands,
                    config.cmd_buffer_initial_arena_bytes,
                ))
            })
            .collect();
        let task_pool = if task_count > 1 {
            Some(TaskPool::new(task_count, task_count * 4))
        } else {
            None
        };
        Self {
            allocator: Allocator::new(),
            registry: Registry::new(),
            pools: RwLock::new(Vec::new()),
            entity_bits: RwLock::new(Vec::new()),
            scheduler: Mutex::new(Scheduler::new()),
            command_buffers,
            task_pool,
            task_count,
            in_progress: AtomicBool::new(false),
        }
    }

    fn ensure_entity_bits(&self, entity: Entity) {
        let idx = entity as usize;
        let mut bits = self.entity_bits.write().unwrap();
        if idx >= bits.len() {
            bits.resize(idx + 1, Bitset::zero());
        }
    }

    // ---- entity lifecycle -------------------------------------------------

    /// Allocates a fresh or recycled entity id. Never deferred: the
    /// allocator is lock-free and safe to call from inside a running stage.
    pub fn create(&self) -> Entity {
        let e = self.allocator.create();
        self.ensure_entity_bits(e);
        e
    }

    /// Destroys `entity`. If a stage is running this is deferred until the
    /// stage boundary drain; otherwise it happens immediately.
    pub fn destroy(&self, entity: Entity) {
        if self.in_progress.load(Ordering::Acquire) {
            self.command_buffer_for_current_task()
                .lock()
                .unwrap()
                .push(Command::Destroy { entity });
            return;
        }
        self.destroy_immediate(entity);
    }

    fn destroy_immediate(&self, entity: Entity) {
        let pools = self.pools.read().unwrap();
        for pool in pools.iter() {
            pool.write().unwrap().remove(entity);
        }
        drop(pools);
        let idx = entity as usize;
        let mut bits = self.entity_bits.write().unwrap();
        if idx < bits.len() {
            bits[idx] = Bitset::zero();
        }
        drop(bits);
        self.allocator.destroy(entity);
    }

    // ---- component registration & storage ---------------------------------

    pub fn register_component<T: 'static>(&self) -> ComponentId {
        let id = self.registry.register::<T>();
        self.ensure_pool(id);
        id
    }

    /// Registers a component of dynamically-known size with no backing
    /// Rust type, for foreign or FFI-defined component layouts. Unlike
    /// [`World::register_component`], repeated calls always allocate a new
    /// id: there is no `TypeId` to deduplicate against.
    pub fn register_component_raw(&self, element_size: usize) -> ComponentId {
        let id = self.registry.register_raw(element_size);
        self.ensure_pool(id);
        id
    }

    fn ensure_pool(&self, id: ComponentId) {
        let mut pools = self.pools.write().unwrap();
        if id >= pools.len() {
            let size = self.registry.element_size(id);
            pools.resize_with(id + 1, || RwLock::new(ComponentPool::new(0)));
            pools[id] = RwLock::new(ComponentPool::new(size));
        }
    }

    fn command_buffer_for_current_task(&self) -> &Mutex<CommandBuffer> {
        let idx = command::current_task_index();
        self.command_buffers
            .get(idx)
            .unwrap_or(&self.command_buffers[0])
    }

    /// Adds `component` to `entity` with the given value. Deferred into the
    /// calling task's command buffer while a stage is running; applied
    /// immediately otherwise.
    pub fn add<T: Copy + 'static>(&self, entity: Entity, component: ComponentId, value: T) {
        let bytes = unsafe {
            std::slice::from_raw_parts((&value as *const T) as *const u8, std::mem::size_of::<T>())
        };
        if self.in_progress.load(Ordering::Acquire) {
            let buf = self.command_buffer_for_current_task();
            let mut buf = buf.lock().unwrap();
            let offset = buf.alloc_data(bytes.len());
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf.data_ptr_mut(offset), bytes.len());
            }
            buf.push(Command::AddComponent { entity, component, data_offset: offset, data_len: bytes.len() });
            return;
        }
        self.add_immediate(entity, component, bytes);
    }

    fn add_immediate(&self, entity: Entity, component: ComponentId, bytes: &[u8]) {
        let pools = self.pools.read().unwrap();
        let ptr = pools[component].write().unwrap().add_raw(entity);
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
        }
        drop(pools);
        self.ensure_entity_bits(entity);
        self.entity_bits.write().unwrap()[entity as usize].set(component);
    }

    /// Removes `component` from `entity`. Deferred while a stage is
    /// running, immediate otherwise.
    pub fn remove(&self, entity: Entity, component: ComponentId) {
        if self.in_progress.load(Ordering::Acquire) {
            self.command_buffer_for_current_task()
                .lock()
                .unwrap()
                .push(Command::RemoveComponent { entity, component });
            return;
        }
        self.remove_immediate(entity, component);
    }

    fn remove_immediate(&self, entity: Entity, component: ComponentId) {
        let pools = self.pools.read().unwrap();
        pools[component].write().unwrap().remove(entity);
        drop(pools);
        let idx = entity as usize;
        let mut bits = self.entity_bits.write().unwrap();
        if idx < bits.len() {
            bits[idx].clear(component);
        }
    }

    /// Reads `entity`'s `component`, if present. Never deferred: reads
    /// always see the latest drained state.
    pub fn get<T: Copy + 'static>(&self, entity: Entity, component: ComponentId) -> Option<T> {
        let pools = self.pools.read().unwrap();
        let pool = pools[component].read().unwrap();
        let ptr = pool.get_raw(entity)? as *const T;
        Some(unsafe { std::ptr::read(ptr) })
    }

    pub fn has(&self, entity: Entity, component: ComponentId) -> bool {
        let pools = self.pools.read().unwrap();
        let result = pools[component].read().unwrap().has(entity);
        result
    }

    /// Returns a pointer to `entity`'s `component` storage for in-place
    /// mutation from inside a running system, or `None` if `entity` lacks
    /// the component.
    ///
    /// The caller must have declared `component` as a write with
    /// [`World::sys_write`]; the scheduler never runs two systems with
    /// conflicting access in the same stage, so the returned pointer is the
    /// only live writer for as long as the stage runs, and no pool is
    /// resized or swap-removed from until the stage drains. Outside a
    /// stage (the thread driving `progress` itself, or a test) the world is
    /// single-threaded and the check does not apply.
    ///
    /// Panics in debug builds if `component` was not declared as a write by
    /// the currently dispatching system; this mirrors the hard assertions
    /// [`crate::error`] documents for other contract violations.
    pub fn get_mut<T: Copy + 'static>(&self, entity: Entity, component: ComponentId) -> Option<*mut T> {
        if self.in_progress.load(Ordering::Acquire) {
            debug_assert!(
                command::can_write(component),
                "get_mut({component}) called by a system that did not declare it as write"
            );
        }
        let pools = self.pools.read().unwrap();
        let mut pool = pools[component].write().unwrap();
        let ptr = pool.get_raw_mut(entity)?;
        Some(ptr as *mut T)
    }

    // ---- system registration ------------------------------------------------

    pub fn sys_create(
        &self,
        callback: impl Fn(&World, &[Entity], usize) -> Result<(), SystemError> + Send + Sync + 'static,
        udata: usize,
    ) -> SystemId {
        self.scheduler.lock().unwrap().create(Arc::new(callback), udata)
    }

    pub fn sys_require(&self, id: SystemId, component: ComponentId) {
        self.scheduler.lock().unwrap().require(id, component);
    }

    pub fn sys_exclude(&self, id: SystemId, component: ComponentId) {
        self.scheduler.lock().unwrap().exclude(id, component);
    }

    pub fn sys_read(&self, id: SystemId, component: ComponentId) {
        self.scheduler.lock().unwrap().read(id, component);
    }

    pub fn sys_write(&self, id: SystemId, component: ComponentId) {
        self.scheduler.lock().unwrap().write(id, component);
    }

    pub fn sys_after(&self, id: SystemId, predecessor: SystemId) {
        self.scheduler.lock().unwrap().after(id, predecessor);
    }

    pub fn sys_enable(&self, id: SystemId) {
        self.scheduler.lock().unwrap().set_enabled(id, true);
    }

    pub fn sys_disable(&self, id: SystemId) {
        self.scheduler.lock().unwrap().set_enabled(id, false);
    }

    pub fn sys_set_group(&self, id: SystemId, group: u32) {
        self.scheduler.lock().unwrap().set_group(id, group);
    }

    pub fn sys_set_udata(&self, id: SystemId, udata: usize) {
        self.scheduler.lock().unwrap().set_udata(id, udata);
    }

    pub fn dump_schedule(&self) {
        let mut sched = self.scheduler.lock().unwrap();
        sched.rebuild_if_dirty();
        sched.dump();
    }

    // ---- dispatch -------------------------------------------------------

    /// Runs a single system as its own one-stage schedule, ignoring the
    /// cached multi-system schedule.
    pub fn run_system(&self, id: SystemId) -> Result<(), ProgressError> {
        self.run_stage(&[id])
    }

    /// Rebuilds the schedule if dirty and dispatches every enabled system
    /// whose group matches `phase_mask`, stage by stage.
    pub fn progress(&self, phase_mask: u32) -> Result<(), ProgressError> {
        let stages = {
            let mut sched = self.scheduler.lock().unwrap();
            sched.rebuild_if_dirty();
            sched.stages().to_vec()
        };
        for stage in &stages {
            let active: Vec<SystemId> = {
                let sched = self.scheduler.lock().unwrap();
                stage
                    .iter()
                    .copied()
                    .filter(|&id| {
                        let sys = sched.system(id);
                        sys.enabled && scheduler::group_matches(sys.group, phase_mask)
                    })
                    .collect()
            };
            if active.is_empty() {
                continue;
            }
            self.run_stage(&active)?;
        }
        Ok(())
    }

    fn run_stage(&self, systems: &[SystemId]) -> Result<(), ProgressError> {
        self.in_progress.store(true, Ordering::Release);
        let outcome = Arc::new(StageOutcome::new());

        let world_ptr = self as *const World as usize;
        let slice_count = self.task_count;

        if let Some(pool) = &self.task_pool {
            for &sys_id in systems {
                for slice_index in 0..slice_count {
                    let outcome = Arc::clone(&outcome);
                    pool.enqueue(Box::new(move || {
                        let world = unsafe { &*(world_ptr as *const World) };
                        run_system_task(world, sys_id, slice_index, slice_count, &outcome);
                    }));
                }
            }
            pool.wait();
        } else {
            for &sys_id in systems {
                run_system_task(self, sys_id, 0, 1, &outcome);
            }
        }

        self.drain_commands();
        self.in_progress.store(false, Ordering::Release);

        // Every job that cloned `outcome` has returned by the time
        // `pool.wait()` completes (and `pool` is never touched in the
        // serial branch at all), so this is always the sole owner.
        Arc::try_unwrap(outcome)
            .unwrap_or_else(|_| unreachable!("stage outcome still shared after drain"))
            .into_result()
    }

    fn drain_commands(&self) {
        for buf in &self.command_buffers {
            let mut buf = buf.lock().unwrap();
            for cmd in buf.commands() {
                match *cmd {
                    Command::Destroy { entity } => self.destroy_immediate(entity),
                    Command::AddComponent { entity, component, data_offset, data_len } => {
                        let bytes = buf.data_slice(data_offset, data_len).to_vec();
                        self.add_immediate(entity, component, &bytes);
                    }
                    Command::RemoveComponent { entity, component } => {
                        self.remove_immediate(entity, component);
                    }
                }
            }
            buf.reset();
        }
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

/// Executes one (system, slice) task: pick the driver pool, compute this
/// slice's entity range over it, filter by `all_of`/`none_of`, and invoke
/// the callback if anything matched.
fn run_system_task(
    world: &World,
    sys_id: SystemId,
    slice_index: usize,
    slice_count: usize,
    outcome: &StageOutcome,
) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        command::with_task_index(slice_index, || {
            dispatch_one(world, sys_id, slice_index, slice_count)
        })
    }));
    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => outcome.record_error(err),
        Err(_) => outcome.record_panic(),
    }
}

fn dispatch_one(world: &World, sys_id: SystemId, slice_index: usize, slice_count: usize) -> Result<(), SystemError> {
    let (all_of, none_of, write, udata) = {
        let sched = world.scheduler.lock().unwrap();
        let sys = sched.system(sys_id);
        (sys.all_of, sys.none_of, sys.write, sys.udata)
    };

    if all_of.none() {
        return Ok(());
    }

    let driver = {
        let pools = world.pools.read().unwrap();
        all_of
            .iter_set()
            .min_by_key(|&cid| pools[cid].read().unwrap().len())
    };
    let Some(driver_id) = driver else {
        return Ok(());
    };

    let driver_entities: Vec<Entity> = {
        let pools = world.pools.read().unwrap();
        let result = pools[driver_id].read().unwrap().entities().to_vec();
        result
    };
    let count = driver_entities.len();
    let start = count * slice_index / slice_count;
    let end = count * (slice_index + 1) / slice_count;

    let entity_bits = world.entity_bits.read().unwrap();
    let mut matched = Vec::with_capacity(end - start);
    for &entity in &driver_entities[start..end] {
        let bits = entity_bits.get(entity as usize).copied().unwrap_or_default();
        if bits.and(&all_of) == all_of && bits.andnot(&none_of) == bits {
            matched.push(entity);
        }
    }
    drop(entity_bits);

    if matched.is_empty() {
        return Ok(());
    }

    // Clone the callback out before releasing the scheduler lock: it may
    // itself call `sys_*` registration methods, which would deadlock if
    // called while this thread still held the lock.
    let callback = {
        let sched = world.scheduler.lock().unwrap();
        Arc::clone(&sched.system(sys_id).callback)
    };
    command::with_write_set(write, || callback(world, &matched, udata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn create_destroy_recycles_ids() {
        let w = World::new();
        let a = w.create();
        let b = w.create();
        assert_eq!((a, b), (1, 2));
        w.destroy(a);
        let c = w.create();
        assert_eq!(c, a);
    }

    #[test]
    fn add_get_remove_round_trip() {
        let w = World::new();
        let pos = w.register_component::<(f64, f64)>();
        let e = w.create();
        w.add(e, pos, (3.0, 4.0));
        assert!(w.has(e, pos));
        assert_eq!(w.get::<(f64, f64)>(e, pos), Some((3.0, 4.0)));
        w.remove(e, pos);
        assert!(!w.has(e, pos));
        assert_eq!(w.get::<(f64, f64)>(e, pos), None);
    }

    #[test]
    fn two_stage_pipeline_with_deferred_add() {
        let w = World::new();
        let pos = w.register_component::<f32>();
        let vel = w.register_component::<(f32, f32)>();
        for _ in 0..8 {
            let e = w.create();
            w.add(e, pos, 0.0f32);
        }

        let added = Arc::new(AtomicU32::new(0));
        let seen = Arc::new(AtomicU32::new(0));

        let added_a = Arc::clone(&added);
        let sys_a = w.sys_create(
            move |world, entities, _udata| {
                for &e in entities {
                    world.add(e, vel, (3.0f32, 7.0f32));
                    added_a.fetch_add(1, Ordering::Relaxed);
                }
                Ok(())
            },
            0,
        );
        w.sys_require(sys_a, pos);
        w.sys_exclude(sys_a, vel);
        w.sys_write(sys_a, vel);

        let seen_b = Arc::clone(&seen);
        let sys_b = w.sys_create(
            move |_world, entities, _udata| {
                seen_b.fetch_add(entities.len() as u32, Ordering::Relaxed);
                Ok(())
            },
            0,
        );
        w.sys_require(sys_b, pos);
        w.sys_require(sys_b, vel);
        w.sys_read(sys_b, vel);

        w.progress(0).unwrap();
        assert_eq!(added.load(Ordering::Relaxed), 8);
        assert_eq!(seen.load(Ordering::Relaxed), 8);

        added.store(0, Ordering::Relaxed);
        w.progress(0).unwrap();
        assert_eq!(added.load(Ordering::Relaxed), 0);
        assert_eq!(seen.load(Ordering::Relaxed), 16);
    }

    #[test]
    fn selective_group_execution() {
        let w = World::new();
        let pos = w.register_component::<u32>();
        for _ in 0..10 {
            let e = w.create();
            w.add(e, pos, 0u32);
        }
        let a_count = Arc::new(AtomicU32::new(0));
        let b_count = Arc::new(AtomicU32::new(0));
        let d_count = Arc::new(AtomicU32::new(0));

        let a = w.sys_create({
            let c = Arc::clone(&a_count);
            move |_w, ents, _| { c.fetch_add(ents.len() as u32, Ordering::Relaxed); Ok(()) }
        }, 0);
        w.sys_require(a, pos);
        w.sys_set_group(a, 1);

        let b = w.sys_create({
            let c = Arc::clone(&b_count);
            move |_w, ents, _| { c.fetch_add(ents.len() as u32, Ordering::Relaxed); Ok(()) }
        }, 0);
        w.sys_require(b, pos);
        w.sys_set_group(b, 2);

        let d = w.sys_create({
            let c = Arc::clone(&d_count);
            move |_w, ents, _| { c.fetch_add(ents.len() as u32, Ordering::Relaxed); Ok(()) }
        }, 0);
        w.sys_require(d, pos);

        w.progress(1).unwrap();
        assert_eq!(a_count.load(Ordering::Relaxed), 10);
        assert_eq!(b_count.load(Ordering::Relaxed), 0);
        assert_eq!(d_count.load(Ordering::Relaxed), 0);

        w.progress(2).unwrap();
        assert_eq!(b_count.load(Ordering::Relaxed), 10);

        w.progress(0).unwrap();
        assert_eq!(d_count.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn empty_all_of_never_invokes_callback() {
        let w = World::new();
        let invoked = Arc::new(AtomicU32::new(0));
        let invoked2 = Arc::clone(&invoked);
        let sys = w.sys_create(move |_w, _e, _u| { invoked2.fetch_add(1, Ordering::Relaxed); Ok(()) }, 0);
        w.run_system(sys).unwrap();
        assert_eq!(invoked.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn register_component_raw_allocates_a_usable_foreign_pool() {
        let w = World::new();
        let a = w.register_component_raw(std::mem::size_of::<u32>());
        let b = w.register_component_raw(std::mem::size_of::<u32>());
        assert_ne!(a, b);

        let e = w.create();
        w.add(e, a, 42u32);
        assert_eq!(w.get::<u32>(e, a), Some(42));
        assert!(!w.has(e, b));
    }

    #[test]
    fn get_mut_writes_position_in_place_from_a_system() {
        let w = World::new();
        let pos = w.register_component::<(f32, f32)>();
        let vel = w.register_component::<(f32, f32)>();
        let e = w.create();
        w.add(e, pos, (0.0f32, 0.0f32));
        w.add(e, vel, (1.0f32, 2.0f32));

        let mover = w.sys_create(
            move |world, entities, _udata| {
                for &e in entities {
                    let v = world.get::<(f32, f32)>(e, vel).unwrap();
                    let p = world.get_mut::<(f32, f32)>(e, pos).unwrap();
                    unsafe {
                        (*p).0 += v.0;
                        (*p).1 += v.1;
                    }
                }
                Ok(())
            },
            0,
        );
        w.sys_require(mover, pos);
        w.sys_require(mover, vel);
        w.sys_read(mover, vel);
        w.sys_write(mover, pos);

        w.progress(0).unwrap();
        assert_eq!(w.get::<(f32, f32)>(e, pos), Some((1.0, 2.0)));

        w.progress(0).unwrap();
        assert_eq!(w.get::<(f32, f32)>(e, pos), Some((2.0, 4.0)));
    }

    #[test]
    fn get_mut_trips_the_write_guard_when_not_declared_as_write() {
        // The debug_assert! inside `get_mut` fires on a worker task, which
        // `run_system_task` catches and reports as a task panic rather than
        // letting it unwind onto this thread.
        let w = World::new();
        let pos = w.register_component::<f32>();
        let e = w.create();
        w.add(e, pos, 1.0f32);

        let careless = w.sys_create(
            move |world, entities, _udata| {
                for &e in entities {
                    world.get_mut::<f32>(e, pos).unwrap();
                }
                Ok(())
            },
            0,
        );
        w.sys_require(careless, pos);
        w.sys_read(careless, pos);

        let result = w.progress(0);
        assert!(matches!(result, Err(ProgressError::TaskPanicked { .. })));
    }

    #[test]
    fn system_failure_short_circuits_progress() {
        let w = World::new();
        let pos = w.register_component::<u32>();
        let e = w.create();
        w.add(e, pos, 1u32);

        let failing = w.sys_create(|_w, _e, _u| Err(SystemError::new(0, "boom")), 0);
        w.sys_require(failing, pos);

        let result = w.progress(0);
        assert!(matches!(result, Err(ProgressError::SystemFailed(_))));
    }
}
