pub mod conflict;
pub mod hydration;
pub mod manager;
pub mod queue;
pub mod types;

pub use hydration::{HydrationReport, Hydrator};
pub use manager::SyncManager;
pub use queue::SyncQueue;
pub use types::{Conflict, ConflictStrategy, Mutation, OnConflict, OnHydrate, StatePatch};
