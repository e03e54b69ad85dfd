//! Network engine abstraction
//!
//! The resolution and collection machinery does not talk to the overlay
//! directly. Everything goes through [`NetworkEngine`], which a node embeds
//! with its real DHT transport and tests replace with a scripted engine.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::protocol::types::Key;

/// Length of the header prepended to data stored inline at a targeted
/// address. Resolution strips it before handing data to callers.
pub const INLINE_HEADER_LEN: usize = 64;

#[derive(Debug)]
pub enum NetworkError {
    /// The overlay lookup completed but no node held the requested data.
    NotFound,
    /// Retrieved bytes failed validation against the requested address.
    InvalidData(String),
    /// Transport-level failure (timeouts, dropped peers, closed channels).
    Transport(String),
}

impl std::fmt::Display for NetworkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkError::NotFound => write!(f, "not found on the overlay"),
            NetworkError::InvalidData(msg) => write!(f, "invalid data: {}", msg),
            NetworkError::Transport(msg) => write!(f, "transport error: {}", msg),
        }
    }
}

impl std::error::Error for NetworkError {}

/// A signed reference object linking a source data block to a target
/// address. The overlay stores these under both `ref_key` and `proof_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceObject {
    pub ref_key: Key,
    pub proof_key: Key,
    pub source_key: Key,
    pub target_key: Key,
    pub signer_key: Option<Key>,
    pub timestamp: i64,
}

/// A data block stored directly at a targeted address, header still attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineBlock {
    pub target_key: Key,
    pub raw: Vec<u8>,
}

/// What a targeted fetch found at an address.
#[derive(Debug, Clone)]
pub enum RetrievedObject {
    Inline(InlineBlock),
    Reference(ReferenceObject),
}

/// Result of a targeted fetch. `data` is present when the node could hand
/// back the payload in the same round trip, `object` describes what was
/// stored at the address.
#[derive(Debug, Clone, Default)]
pub struct TargetedData {
    pub data: Option<Vec<u8>>,
    pub object: Option<RetrievedObject>,
}

/// Overlay operations the protocol needs. Implementations must be safe to
/// call concurrently from many tasks.
#[async_trait]
pub trait NetworkEngine: Send + Sync {
    /// Fetch the data block stored at `key`. Returns `Ok(None)` when the
    /// lookup completes without finding the block.
    async fn fetch(&self, key: &Key) -> Result<Option<Vec<u8>>, NetworkError>;

    /// Fetch whatever is stored at `key`, validating it against
    /// `target_key`. Used for addresses that may hold either an inline
    /// block or a reference object.
    async fn fetch_targeted(
        &self,
        key: &Key,
        target_key: &Key,
    ) -> Result<TargetedData, NetworkError>;

    /// Stream reference objects attached to `target_key` into `sink` in
    /// batches. Returns once the lookup is exhausted. `retry_factor`
    /// widens the lookup on the overlay.
    async fn stream_references(
        &self,
        target_key: &Key,
        sink: mpsc::Sender<Vec<ReferenceObject>>,
        retry_factor: u32,
    ) -> Result<(), NetworkError>;

    /// Probe the keyspace region derived from `target_key` for candidate
    /// addresses, sending each into `sink`. `probe_width` bounds how many
    /// addresses are derived.
    async fn probe(
        &self,
        target_key: &Key,
        probe_width: usize,
        sink: mpsc::Sender<Key>,
    ) -> Result<(), NetworkError>;

    /// Store `data` on the overlay. The content key is sent on `key_tx` as
    /// soon as it is computed, before any node has confirmed storage.
    /// Returns the number of nodes that confirmed.
    async fn store(
        &self,
        data: Vec<u8>,
        key_tx: oneshot::Sender<Key>,
        retry_factor: u32,
    ) -> Result<usize, NetworkError>;

    /// Build, sign and store a reference object attaching `source_key` to
    /// `target_key`. The engine computes the addresses and proof.
    async fn store_reference(
        &self,
        target_key: &Key,
        source_key: &Key,
        signer_key: Option<Key>,
        retry_factor: u32,
    ) -> Result<ReferenceObject, NetworkError>;
}
