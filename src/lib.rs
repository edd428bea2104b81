//! A data-oriented entity-component-system runtime with automatic,
//! dependency-aware parallel scheduling.
//!
//! Components live in per-type sparse-set-indexed pools (`component`), not
//! archetype tables: adding or removing a component touches only that
//! component's pool. Systems declare the components they read and write;
//! [`scheduler`] derives a conflict graph from those declarations and
//! groups systems into stages that can run concurrently without data races,
//! dispatching each stage's systems onto the [`task_pool`]'s worker threads
//! with the matching entity set sliced across them.
//!
//! Structural changes made from inside a running system (adding or
//! removing a component, destroying an entity) never touch a pool
//! directly. They're appended to the calling task's [`command`] buffer and
//! replayed once every task in the stage has finished, so a system never
//! observes a structural change made by another system in the same stage.
//! A system that only mutates the data of a component it already declared
//! as `write`, in place, does not need this: see [`world::World::get_mut`].
//!
//! ```ignore
//! use ecs_core::world::World;
//!
//! let world = World::new();
//! let position = world.register_component::<(f32, f32)>();
//! let e = world.create();
//! world.add(e, position, (0.0, 0.0));
//!
//! let mover = world.sys_create(
//!     |world, entities, _udata| {
//!         for &e in entities {
//!             let pos = world.get_mut::<(f32, f32)>(e, position).unwrap();
//!             unsafe { (*pos).0 += 1.0 };
//!         }
//!         Ok(())
//!     },
//!     0,
//! );
//! world.sys_require(mover, position);
//! world.sys_write(mover, position);
//!
//! world.progress(0).unwrap();
//! ```

pub mod bitset;
pub mod command;
pub mod component;
pub mod config;
pub mod entity;
pub mod error;
pub mod scheduler;
pub mod sparse_set;
pub mod task_pool;
pub mod world;

pub use config::WorldConfig;
pub use entity::Entity;
pub use error::{ProgressError, SystemError};
pub use world::World;
