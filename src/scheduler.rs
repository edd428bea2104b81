//! System registration, conflict analysis, and stage construction.
//!
//! Two systems conflict when either one's declared writes overlap the
//! other's declared reads-or-writes. The schedule is a sequence of stages,
//! each a maximal set of mutually non-conflicting systems, built with a
//! single forward pass: every conflicting pair `(i, j)` with `i` registered
//! before `j` contributes `i` as a predecessor of `j`, which makes the
//! predecessor graph a DAG by construction and lets stage assignment fall
//! out of one pass rather than a general topological sort. This is
//! equivalent to Kahn's algorithm with ties broken by registration order.
//!
//! [`Scheduler`] only owns the systems and the derived stage grouping; it
//! has no notion of pools, tasks, or entities. [`crate::world::World`]
//! drives dispatch, calling back into a system's callback with the world
//! and a matched entity slice.

use std::sync::Arc;

use crate::bitset::Bitset;
use crate::entity::Entity;
use crate::error::SystemError;

pub type SystemId = usize;

/// A system's callback: given the world, the entity slice this task
/// matched, and its user data, runs the system's logic.
pub type SystemCallback = Arc<dyn Fn(&crate::world::World, &[Entity], usize) -> Result<(), SystemError> + Send + Sync>;

/// A registered system: its component filter, declared access, ordering
/// constraints, and callback.
///
/// The callback is reference-counted rather than boxed so a dispatching
/// task can clone it and release the scheduler lock before invoking it.
/// The callback may itself call back into `sys_*` registration methods.
pub struct System {
    pub all_of: Bitset,
    pub none_of: Bitset,
    pub read: Bitset,
    pub write: Bitset,
    pub after: Bitset,
    pub group: u32,
    pub enabled: bool,
    pub udata: usize,
    pub callback: SystemCallback,
}

impl System {
    pub fn rw(&self) -> Bitset {
        self.read.or(&self.write)
    }
}

/// Returns whether `a` and `b` declare conflicting component access.
pub fn conflicts(a: &System, b: &System) -> bool {
    a.write.intersects(&b.rw()) || b.write.intersects(&a.rw())
}

/// Returns whether a system in `group` should run for `phase_mask`: group
/// `0` runs only when the mask is exactly `0`, any other group runs when it
/// shares a set bit with the mask.
pub fn group_matches(group: u32, phase_mask: u32) -> bool {
    if group == 0 {
        phase_mask == 0
    } else {
        group & phase_mask != 0
    }
}

/// Owns the registered systems and the cached stage schedule derived from
/// their declared access.
pub struct Scheduler {
    systems: Vec<System>,
    stages: Vec<Vec<SystemId>>,
    dirty: bool,
}

impl Scheduler {
    pub fn new() -> Self {
        Self { systems: Vec::new(), stages: Vec::new(), dirty: true }
    }

    pub fn create(&mut self, callback: SystemCallback, udata: usize) -> SystemId {
        let id = self.systems.len();
        assert!(id < crate::config::MAX_SYSTEMS, "exceeded MAX_SYSTEMS ({})", crate::config::MAX_SYSTEMS);
        self.systems.push(System {
            all_of: Bitset::zero(),
            none_of: Bitset::zero(),
            read: Bitset::zero(),
            write: Bitset::zero(),
            after: Bitset::zero(),
            group: 0,
            enabled: true,
            udata,
            callback,
        });
        self.dirty = true;
        id
    }

    pub fn system(&self, id: SystemId) -> &System {
        &self.systems[id]
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn require(&mut self, id: SystemId, component: usize) {
        self.systems[id].all_of.set(component);
        self.mark_dirty();
    }

    pub fn exclude(&mut self, id: SystemId, component: usize) {
        self.systems[id].none_of.set(component);
        self.mark_dirty();
    }

    pub fn read(&mut self, id: SystemId, component: usize) {
        self.systems[id].read.set(component);
        self.mark_dirty();
    }

    pub fn write(&mut self, id: SystemId, component: usize) {
        self.systems[id].write.set(component);
        self.mark_dirty();
    }

    pub fn after(&mut self, id: SystemId, predecessor: SystemId) {
        assert_ne!(id, predecessor, "a system cannot depend on itself");
        self.systems[id].after.set(predecessor);
        self.mark_dirty();
    }

    pub fn set_enabled(&mut self, id: SystemId, enabled: bool) {
        self.systems[id].enabled = enabled;
        self.mark_dirty();
    }

    pub fn set_group(&mut self, id: SystemId, group: u32) {
        self.systems[id].group = group;
        self.mark_dirty();
    }

    pub fn set_udata(&mut self, id: SystemId, udata: usize) {
        self.systems[id].udata = udata;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Rebuilds the cached stage grouping if dirty. No-op otherwise.
    pub fn rebuild_if_dirty(&mut self) {
        if !self.dirty {
            return;
        }
        let n = self.systems.len();
        let mut stage_of = vec![0usize; n];
        for j in 0..n {
            let mut pred = self.systems[j].after;
            for i in 0..j {
                if conflicts(&self.systems[i], &self.systems[j]) {
                    pred.set(i);
                }
            }
            stage_of[j] = pred.iter_set().map(|i| stage_of[i] + 1).max().unwrap_or(0);
        }
        let stage_count = stage_of.iter().copied().max().map(|m| m + 1).unwrap_or(0);
        let mut stages = vec![Vec::new(); stage_count];
        for (id, stage) in stage_of.into_iter().enumerate() {
            stages[stage].push(id);
        }
        log::debug!("rebuilt schedule: {} systems across {} stages", n, stages.len());
        self.stages = stages;
        self.dirty = false;
    }

    pub fn stages(&self) -> &[Vec<SystemId>] {
        &self.stages
    }

    pub fn dump(&self) {
        log::debug!("schedule: {} stages", self.stages.len());
        for (i, stage) in self.stages.iter().enumerate() {
            log::debug!(
                "  stage {i}: {:?}",
                stage
                    .iter()
                    .map(|&id| (id, self.systems[id].group, self.systems[id].enabled))
                    .collect::<Vec<_>>()
            );
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_system() -> SystemCallback {
        Arc::new(|_world, _entities, _udata| Ok(()))
    }

    #[test]
    fn independent_readers_share_a_stage() {
        let mut sched = Scheduler::new();
        let a = sched.create(noop_system(), 0);
        let b = sched.create(noop_system(), 0);
        sched.read(a, 0);
        sched.read(b, 0);
        sched.rebuild_if_dirty();
        assert_eq!(sched.stages().len(), 1);
        assert_eq!(sched.stages()[0].len(), 2);
    }

    #[test]
    fn writer_then_reader_separate_stages_in_registration_order() {
        let mut sched = Scheduler::new();
        let writer = sched.create(noop_system(), 0);
        let reader = sched.create(noop_system(), 0);
        sched.write(writer, 0);
        sched.read(reader, 0);
        sched.rebuild_if_dirty();
        assert_eq!(sched.stages().len(), 2);
        assert_eq!(sched.stages()[0], vec![writer]);
        assert_eq!(sched.stages()[1], vec![reader]);
    }

    #[test]
    fn explicit_after_edge_orders_non_conflicting_systems() {
        let mut sched = Scheduler::new();
        let a = sched.create(noop_system(), 0);
        let b = sched.create(noop_system(), 0);
        sched.read(a, 5);
        sched.read(b, 9); // disjoint components: would not conflict
        sched.after(b, a);
        sched.rebuild_if_dirty();
        assert_eq!(sched.stages().len(), 2);
        assert_eq!(sched.stages()[0], vec![a]);
        assert_eq!(sched.stages()[1], vec![b]);
    }

    #[test]
    fn group_matches_zero_only_on_exact_zero_mask() {
        assert!(group_matches(0, 0));
        assert!(!group_matches(0, 1));
        assert!(group_matches(1, 1));
        assert!(group_matches(0b110, 0b010));
        assert!(!group_matches(0b100, 0b011));
    }

    #[test]
    fn rebuild_is_noop_when_not_dirty() {
        let mut sched = Scheduler::new();
        sched.create(noop_system(), 0);
        sched.rebuild_if_dirty();
        assert!(!sched.is_dirty());
        sched.rebuild_if_dirty(); // should not panic or change anything
        assert_eq!(sched.stages().len(), 1);
    }
}
