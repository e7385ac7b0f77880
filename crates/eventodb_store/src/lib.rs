//! Storage layer for EventoDB.
//!
//! The [`Store`] and [`NamespaceStore`] contracts are implemented by three
//! drivers: an embedded sled backend (one database per namespace under a
//! data directory), a relational Postgres backend (one schema per
//! namespace), and a time-partitioned flavor of the relational backend.
//! The [`StoreFacade`] sits on top of whichever driver is configured: it
//! verifies namespaces against the registry, lazily opens and caches
//! per-namespace handles, serializes appends through per-namespace write
//! latches, validates inputs, and owns namespace administration.

mod facade;
pub mod migrate;
mod postgres;
mod registry;
mod sled_store;
mod store;
pub mod token;

pub use facade::{NamespaceDetails, StoreFacade, DEFAULT_NAMESPACE};
pub use postgres::{PgFlavor, PgStore};
pub use registry::{validate_namespace_id, NamespaceRecord};
pub use sled_store::SledStore;
pub use store::{
    CategoryInfo, CategoryReadOpts, ListStreamsOpts, NamespaceStore, Store, StreamInfo,
    StreamReadOpts, WriteMessage, WrittenPosition,
};
