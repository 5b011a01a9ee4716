//! Embedded document store on the plain file system.
//!
//! Every node is a file named by its id and every schema is a directory.
//! Relationships, full-text indexes, ordered lists and per-schema counters
//! are stored as nodes too, so the whole database can be inspected, copied
//! or versioned with ordinary tools.

pub mod codec;
pub mod config;
pub mod document;
pub mod error;
pub mod index;
pub mod lock;
pub mod order;
pub mod query;
pub mod reference;
pub mod schema;
pub mod session;
pub mod stats;
pub mod store;
pub mod trigger;

pub use codec::Codec;
pub use config::StoreConfig;
pub use document::Document;
pub use error::{Result, StoreError};
pub use index::{DefaultExtractor, Extractor, IndexSpec, SearchHit};
pub use lock::{Clock, ManualClock, SystemClock};
pub use order::{OrderEntry, Walk};
pub use query::{Found, NodeQuery, Visit};
pub use reference::Reference;
pub use schema::SchemaWalk;
pub use stats::StatsRecord;
pub use store::{Collection, Outcome, Store};
pub use trigger::{TriggerArgs, TriggerEvent, TriggerResult};
