//! # porto-container
//!
//! The container entity, the tree holder that owns every container by
//! name, the property/data schema tables, and the volume holder.
//!
//! Containers form a tree through dotted names (`parent.child.leaf`);
//! the implicit root `/` exists from daemon start. The holder is the
//! only owner of container values — parent/child relations are names
//! resolved against the registry on demand, so there are no ownership
//! cycles.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod container;
pub mod cred;
pub mod data;
pub mod holder;
pub mod name;
pub mod property;
pub mod spawn;
pub mod state;
pub mod volume;

pub use container::Container;
pub use cred::Cred;
pub use holder::{ContainerHolder, StateEvent};
pub use spawn::{MockSpawner, ProcessSpawner, SpawnSpec, Spawner};
pub use state::ContainerState;
pub use volume::{LocalVolumeBackend, Volume, VolumeBackend, VolumeHolder, VolumeLink};

/// Name of the implicit root container.
pub const ROOT_NAME: &str = "/";

/// Default grace period before a stubborn container is killed.
pub const DEFAULT_STOP_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
