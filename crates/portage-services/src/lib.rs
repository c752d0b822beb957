//! portage-services — storage, transfer bookkeeping, and shared registries
//! used by the node runtime.

pub mod descriptor;
pub mod events;
pub mod index;
pub mod peer;
pub mod store;

pub use descriptor::{Direction, TransferDescriptor, TransferKey, TransferStatus};
pub use events::{LogObserver, NodeObserver, NullObserver};
pub use index::AvailabilityIndex;
pub use peer::{new_registry, PeerRecord, PeerRegistry, PeerState};
pub use store::{ChunkStore, StoreError};
