pub mod cancel;
pub mod checkpoint;
pub mod config;
mod error;
mod filter;
pub mod id;
mod in_memory;
pub mod namespace;
pub mod page;
pub mod profile;
pub mod sweeper;
pub mod ttl;
mod value;

pub use cancel::{cancellable, with_timeout};
pub use checkpoint::{
    CheckpointMetadata, CheckpointSaver, CheckpointSource, CheckpointStream, CheckpointTuple,
    ListOptions, PartitionRecord, PendingWrite, ThreadKey, RESERVED_METADATA_KEYS,
};
pub use config::{StoreConfig, StoreConfigBuilder};
pub use error::{ErrorKind, StoreError};
pub use filter::ValueFilter;
pub use id::CheckpointIdGenerator;
pub use in_memory::{InMemoryCheckpointSaver, InMemoryProfileStore};
pub use namespace::Namespace;
pub use page::Page;
pub use profile::{NamespaceQuery, ProfileItem, ProfileStore, ProfileStream, SearchQuery};
pub use sweeper::{ExpirySweep, SweepReport, SweeperHandle, TtlSweeper};
pub use tokio_util::sync::CancellationToken;
pub use ttl::{ExpiryMode, Stamp, TtlPolicy};
pub use value::{decode_json, encode_json, format_timestamp, parse_timestamp, ProfileValue, Value};
