pub mod client;
pub mod memory;
pub mod remote;
pub mod retry;

pub use client::{
    AuthToken, ConnectionState, KvClient, KvError, KvNotification, KvSubscription,
};
pub use memory::{MemoryKvClient, MemoryKvService};
pub use remote::{RemoteChange, RemoteStore};
pub use retry::{RetryConfig, RetryPolicy};
