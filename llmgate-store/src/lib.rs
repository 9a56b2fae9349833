//! KV + set + pub/sub + atomic scripting store abstraction.

pub mod memory;
pub mod redis_store;
pub mod scripts;
pub mod store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use store::{Store, Subscription};
