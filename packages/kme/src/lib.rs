//! Key management entity core
//!
//! Issues QKD key material exactly once under optimistic concurrency. Raw key
//! bytes arrive as epochs, are claimed through a per-channel status index,
//! carved into keys and recorded in a ledger that the peer KME uses to rebuild
//! the same keys by id.

#![forbid(unsafe_code)]

pub mod allocator;
pub mod api;
pub mod cli;
pub mod config;
pub mod digest;
pub mod epoch;
pub mod error;
pub mod key_builder;
pub mod ledger;
pub mod manager;
pub mod paths;
pub mod producer;
pub mod retrieval;
pub mod status_index;
pub mod types;

pub use allocator::{Allocator, Claim, ClaimPlan};
pub use config::KmeConfig;
pub use digest::{DigestCache, Digester, FileDigestCache, IntegrityChecker, MemoryDigestCache};
pub use epoch::{EpochRecord, EpochStore};
pub use error::{KmeError, Result};
pub use key_builder::{derive_key_id, BuildOutput, BuiltKey, KeyBuilder};
pub use ledger::{
    ByteRange, HttpLedgerPeer, KeyIdList, LedgerBatch, LedgerEntry, LedgerPeer, LedgerReceiver,
    LedgerStatus, LedgerStore, LedgerSync,
};
pub use manager::{KeyManager, PoolStatus};
pub use paths::StorePaths;
pub use producer::Producer;
pub use retrieval::RetrievalEngine;
pub use status_index::{ClaimToken, Reservation, SlotState, StatusIndex};
pub use types::{EpochId, KeyId, KeyRecord, SaeId};
