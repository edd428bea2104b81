//! Compile-time limits and the small set of knobs a host may tune at
//! world-construction time.
//!
//! The limits below bound fixed-size arrays used on hot paths (component
//! bitsets, system tables). They are `const` rather than runtime values
//! because the bitset word count is derived from `MAX_COMPONENTS` at
//! compile time.

/// Maximum number of distinct component types a [`crate::world::World`] can
/// register. Bounds the width of every [`crate::bitset::Bitset`].
pub const MAX_COMPONENTS: usize = 256;

/// Maximum number of systems a single world can hold.
pub const MAX_SYSTEMS: usize = 256;

/// Default number of parallel task slices used when no explicit task count
/// is configured.
pub const DEFAULT_TASK_COUNT: usize = 64;

/// Upper bound accepted by [`WorldConfig::task_count`].
pub const MAX_TASKS: usize = 1024;

/// Cache line size used to pad hot atomics against false sharing.
pub const CACHE_LINE: usize = 64;

/// Initial capacity, in commands, of a per-task command buffer.
pub const CMD_BUFFER_INITIAL_COMMANDS: usize = 1024;

/// Initial capacity, in bytes, of a per-task command payload arena.
pub const CMD_BUFFER_INITIAL_ARENA_BYTES: usize = 1 << 20;

/// Initial capacity, in bytes, of a per-task entity-match scratch buffer.
pub const SCRATCH_BUFFER_INITIAL_BYTES: usize = 1 << 20;

/// Runtime-tunable knobs for a [`crate::world::World`].
///
/// Mirrors the override-constructor pattern used throughout this codebase
/// (an explicit `with_*` constructor layered over a sane zero-config
/// default) rather than a god-object of every possible setting.
#[derive(Debug, Clone)]
pub struct WorldConfig {
    /// Number of slices each system's matching entity set is divided into
    /// when dispatched onto the task pool. `1` disables slicing.
    pub task_count: usize,
    /// Initial command capacity for each per-task command buffer.
    pub cmd_buffer_initial_commands: usize,
    /// Initial arena capacity, in bytes, for each per-task command buffer.
    pub cmd_buffer_initial_arena_bytes: usize,
    /// Initial scratch-buffer capacity, in bytes, for each task slot.
    pub scratch_buffer_initial_bytes: usize,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            task_count: 1,
            cmd_buffer_initial_commands: CMD_BUFFER_INITIAL_COMMANDS,
            cmd_buffer_initial_arena_bytes: CMD_BUFFER_INITIAL_ARENA_BYTES,
            scratch_buffer_initial_bytes: SCRATCH_BUFFER_INITIAL_BYTES,
        }
    }
}

impl WorldConfig {
    /// Starts from the default config with `task_count` workers, clamped to
    /// `[1, MAX_TASKS]`.
    pub fn with_task_count(task_count: usize) -> Self {
        Self {
            task_count: task_count.clamp(1, MAX_TASKS),
            ..Self::default()
        }
    }
}
