//! Deferred structural mutations.
//!
//! While a stage is running, [`crate::world::World::add`],
//! [`crate::world::World::remove`], and [`crate::world::World::destroy`] do
//! not touch the pools directly: they append a [`Command`] to the calling
//! task's [`CommandBuffer`] and, for `add`, return a pointer into that
//! buffer's bump-allocated data arena for the caller to write into. Nothing
//! lands in a pool until the stage boundary drain (see
//! [`crate::world::World`]'s `drain_commands`) replays every buffer in
//! task-slot order.
//!
//! The "which buffer is this?" question is answered by a thread-local
//! holding the index of the task slot currently executing on this thread,
//! set by the scheduler immediately before invoking a system callback and
//! cleared immediately after. Code running outside a dispatched task (the
//! thread driving `progress` itself, or a test calling `add` directly) has
//! no such slot and falls back to slot 0.
//!
//! A second thread-local tracks the declared `write` bitset of whatever
//! system is currently running on this thread. [`crate::world::World::
//! get_mut`] checks it before handing out a raw pointer into a pool: the
//! scheduler only ever runs one writer of a given component at a time, so
//! the check is what makes that pointer safe to mutate through without
//! taking a lock for the duration of the write.

use std::cell::Cell;

use crate::bitset::Bitset;
use crate::component::ComponentId;
use crate::entity::Entity;

thread_local! {
    static CURRENT_TASK: Cell<Option<usize>> = const { Cell::new(None) };
    static CURRENT_WRITE_SET: Cell<Bitset> = const { Cell::new(Bitset::zero()) };
}

/// Runs `f` with the thread-local current-task-index set to `task_index`,
/// restoring the previous value afterward. Called by the scheduler around
/// each system invocation.
pub fn with_task_index<R>(task_index: usize, f: impl FnOnce() -> R) -> R {
    let previous = CURRENT_TASK.with(|c| c.replace(Some(task_index)));
    let result = f();
    CURRENT_TASK.with(|c| c.set(previous));
    result
}

/// Returns the task slot the calling thread should buffer commands into:
/// the thread-local current task index if set, else `0`.
pub fn current_task_index() -> usize {
    CURRENT_TASK.with(|c| c.get()).unwrap_or(0)
}

/// Runs `f` with the thread-local current-write-set set to `write`,
/// restoring the previous value afterward. Called around each system
/// invocation with that system's declared write access.
pub fn with_write_set<R>(write: Bitset, f: impl FnOnce() -> R) -> R {
    let previous = CURRENT_WRITE_SET.with(|c| c.replace(write));
    let result = f();
    CURRENT_WRITE_SET.with(|c| c.set(previous));
    result
}

/// Returns the declared write set of whatever system is currently
/// dispatching on this thread, or the empty set outside dispatch.
pub fn current_write_set() -> Bitset {
    CURRENT_WRITE_SET.with(|c| c.get())
}

/// Returns whether `component` is in the current thread's write set.
pub fn can_write(component: ComponentId) -> bool {
    current_write_set().test(component)
}

/// One deferred structural mutation.
#[derive(Debug, Clone, Copy)]
pub enum Command {
    Destroy { entity: Entity },
    AddComponent { entity: Entity, component: ComponentId, data_offset: usize, data_len: usize },
    RemoveComponent { entity: Entity, component: ComponentId },
}

/// Per-task append-only command log plus a bump-allocated payload arena.
///
/// Both regions grow by doubling and are reset, not freed, after each
/// drain: the buffer is reused for the next stage rather than reallocated.
pub struct CommandBuffer {
    commands: Vec<Command>,
    data: Vec<u8>,
    data_len: usize,
}

impl CommandBuffer {
    pub fn new(initial_commands: usize, initial_arena_bytes: usize) -> Self {
        Self {
            commands: Vec::with_capacity(initial_commands),
            data: vec![0u8; initial_arena_bytes.max(1)],
            data_len: 0,
        }
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    /// Bump-allocates `size` bytes in the payload arena, growing it by
    /// doubling if needed, and returns the offset of the reserved region.
    pub fn alloc_data(&mut self, size: usize) -> usize {
        let needed = self.data_len + size;
        if needed > self.data.len() {
            let mut new_cap = self.data.len().max(1);
            while new_cap < needed {
                new_cap *= 2;
            }
            self.data.resize(new_cap, 0);
        }
        let offset = self.data_len;
        self.data_len += size;
        offset
    }

    pub fn data_slice(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    pub fn data_ptr_mut(&mut self, offset: usize) -> *mut u8 {
        self.data[offset..].as_mut_ptr()
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Clears the log and rewinds the arena bump pointer. Backing storage
    /// is retained for reuse by the next stage.
    pub fn reset(&mut self) {
        self.commands.clear();
        self.data_len = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_index_defaults_to_zero_outside_dispatch() {
        assert_eq!(current_task_index(), 0);
    }

    #[test]
    fn with_task_index_scopes_and_restores() {
        assert_eq!(current_task_index(), 0);
        with_task_index(5, || {
            assert_eq!(current_task_index(), 5);
            with_task_index(9, || {
                assert_eq!(current_task_index(), 9);
            });
            assert_eq!(current_task_index(), 5);
        });
        assert_eq!(current_task_index(), 0);
    }

    #[test]
    fn write_set_defaults_to_empty_outside_dispatch() {
        assert!(!can_write(0));
    }

    #[test]
    fn with_write_set_scopes_and_restores() {
        let mut velocity = Bitset::zero();
        velocity.set(3);
        assert!(!can_write(3));
        with_write_set(velocity, || {
            assert!(can_write(3));
            assert!(!can_write(4));
        });
        assert!(!can_write(3));
    }

    #[test]
    fn alloc_data_bump_allocates_without_overlap() {
        let mut buf = CommandBuffer::new(4, 8);
        let a = buf.alloc_data(4);
        let b = buf.alloc_data(4);
        assert_eq!(a, 0);
        assert_eq!(b, 4);
    }

    #[test]
    fn alloc_data_grows_arena_past_initial_capacity() {
        let mut buf = CommandBuffer::new(4, 4);
        let off = buf.alloc_data(100);
        assert_eq!(off, 0);
        buf.data_slice(off, 100); // does not panic
    }

    #[test]
    fn reset_clears_log_and_rewinds_arena() {
        let mut buf = CommandBuffer::new(4, 8);
        buf.push(Command::Destroy { entity: 1 });
        buf.alloc_data(4);
        buf.reset();
        assert!(buf.is_empty());
        assert_eq!(buf.alloc_data(4), 0);
    }
}
