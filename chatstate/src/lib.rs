//! Durable conversation state: checkpoint history per thread, user profiles
//! shared across threads, and the TTL policy that stamps checkpoint data.
//!
//! Everything from [`chatstate_core`] is re-exported at the root. The Redis
//! backend lives under [`redis`] behind the `redis` feature (on by default).
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use chatstate::{CheckpointMetadata, CheckpointSaver, StoreConfig, ThreadKey};
//!
//! let database = chatstate::redis::RedisDatabase::connect(StoreConfig::from_env()?).await?;
//! let saver = database.checkpoint_saver();
//! let stored = saver
//!     .put(
//!         &ThreadKey::new("user-42"),
//!         serde_json::json!({"messages": []}),
//!         CheckpointMetadata::default(),
//!     )
//!     .await?;
//! assert!(saver.get_tuple(&stored).await?.is_some());
//! # Ok(())
//! # }
//! ```

pub use chatstate_core::*;

#[cfg(feature = "redis")]
pub mod redis {
    pub use chatstate_redis::*;
}
