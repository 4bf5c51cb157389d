//! The embedded CRDT object store.

pub mod assoc;
pub mod crdt;
pub mod entry;
pub mod query;
pub mod schema;
pub mod store;
pub mod ttl;

pub use crdt::MergeOutcome;
pub use entry::ModelEntry;
pub use query::{Condition, Query, SortDir};
pub use schema::{FieldSpec, FieldType, ModelSchema, SyncKind};
pub use store::{BroadcastTargets, ModelOutbox, ModelStore};
