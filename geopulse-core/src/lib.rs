//! Core engine of the geopulse server: geometry, the hybrid quad-tree
//! index, the world registry, the move dispatcher and the persistence
//! boundary.
//!
//! This crate is runtime-agnostic; sessions, webhooks and storage backends
//! plug in through the [`events::EventSink`], [`events::BeaconNotifier`]
//! and [`persist::Persister`] traits.

pub mod dispatch;
pub mod entity;
pub mod events;
pub mod geo;
pub mod persist;
pub mod quad;
pub mod registry;

pub use dispatch::Dispatcher;
pub use entity::{PointRef, PublicData, RectRef};
pub use events::{BeaconNotifier, EventMessage, EventSink};
pub use geo::{Point, Rect, WORLD};
pub use persist::{JsonFilePersister, NullPersister, Persister};
pub use registry::{World, WorldError};
