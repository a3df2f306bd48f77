//! Storage for policies, applications and findings.
//!
//! The traits define the backend contract; `memory` provides the
//! thread-safe in-memory implementation.

mod memory;
mod traits;

pub use memory::{
    InMemoryApplicationStore, InMemoryConflictStore, InMemoryInconsistencyStore, InMemoryPolicyStore, InMemoryStores,
};
pub use traits::{
    ApplicationStore, ConflictFilter, ConflictStore, InconsistencyFilter, InconsistencyStore, PolicyStore,
    StorageError,
};
