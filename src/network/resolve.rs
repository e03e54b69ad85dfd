//! Post resolution
//!
//! Turns an address into a cached post: check the store first, fetch from
//! the overlay on a miss, persist what came back. Concurrent resolutions of
//! the same address are coalesced so the overlay sees at most one fetch and
//! the store at most one write per address.

use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::{watch, Mutex};
use tracing::{debug, warn};

use crate::data::{
    current_timestamp, find_post_by_any_alias, find_post_by_key, upsert_post, NewPost, Post,
};
use crate::network::engine::{
    NetworkEngine, NetworkError, ReferenceObject, RetrievedObject, INLINE_HEADER_LEN,
};
use crate::protocol::error::ProtocolError;
use crate::protocol::types::Key;

enum Flight {
    Leader(watch::Sender<()>),
    Waiter(watch::Receiver<()>),
}

/// Cache-or-fetch resolution of posts by address
pub struct PostResolver {
    db: Arc<Mutex<Connection>>,
    engine: Arc<dyn NetworkEngine>,
    inflight: std::sync::Mutex<HashMap<Key, watch::Receiver<()>>>,
}

impl PostResolver {
    pub fn new(db: Arc<Mutex<Connection>>, engine: Arc<dyn NetworkEngine>) -> Self {
        Self {
            db,
            engine,
            inflight: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a plain content address
    ///
    /// Returns the cached post when the store already holds a payload for
    /// `key`, otherwise fetches the block, persists it and returns the
    /// merged record. `Ok(None)` means the overlay lookup completed without
    /// finding anything; nothing is persisted in that case.
    pub async fn resolve(&self, key: &Key) -> Result<Option<Post>, ProtocolError> {
        if let Some(post) = self.cached(&[*key]).await? {
            debug!(key = %hex::encode(key), "resolve: cache hit");
            return Ok(Some(post));
        }

        match self.begin_flight(*key) {
            Flight::Leader(sender) => {
                let result = self.fetch_block(key).await;
                self.end_flight(key, sender);
                result
            }
            Flight::Waiter(receiver) => self.await_flight(*key, receiver).await,
        }
    }

    /// Resolve a targeted address, which may hold an inline block or a
    /// reference object
    pub async fn resolve_targeted(
        &self,
        key: &Key,
        target_key: &Key,
    ) -> Result<Option<Post>, ProtocolError> {
        if let Some(post) = self.cached(&[*key]).await? {
            debug!(key = %hex::encode(key), "resolve_targeted: cache hit");
            return Ok(Some(post));
        }

        match self.begin_flight(*key) {
            Flight::Leader(sender) => {
                let result = self.fetch_targeted(key, target_key).await;
                self.end_flight(key, sender);
                result
            }
            Flight::Waiter(receiver) => self.await_flight(*key, receiver).await,
        }
    }

    /// Resolve a reference object already retrieved from the overlay
    ///
    /// Fetches the source block the reference points at and persists the
    /// record under the full alias set. The declared timestamp comes from
    /// the reference, not from the local clock.
    pub async fn resolve_reference(
        &self,
        reference: &ReferenceObject,
    ) -> Result<Option<Post>, ProtocolError> {
        let aliases = [reference.ref_key, reference.proof_key, reference.source_key];
        if let Some(post) = self.cached(&aliases).await? {
            debug!(
                ref_key = %hex::encode(reference.ref_key),
                "resolve_reference: cache hit"
            );
            return Ok(Some(post));
        }

        match self.begin_flight(reference.ref_key) {
            Flight::Leader(sender) => {
                let result = self.fetch_reference_source(reference, None).await;
                self.end_flight(&reference.ref_key, sender);
                result
            }
            Flight::Waiter(receiver) => self.await_flight(reference.ref_key, receiver).await,
        }
    }

    /// Look up a post with a payload under any of the given aliases
    async fn cached(&self, aliases: &[Key]) -> Result<Option<Post>, ProtocolError> {
        let db = self.db.lock().await;
        let post = find_post_by_any_alias(&db, aliases)?;
        Ok(post.filter(|p| p.data.is_some()))
    }

    /// Join or lead the in-flight fetch for `key`
    fn begin_flight(&self, key: Key) -> Flight {
        let mut inflight = self
            .inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(receiver) = inflight.get(&key) {
            return Flight::Waiter(receiver.clone());
        }
        let (sender, receiver) = watch::channel(());
        inflight.insert(key, receiver);
        Flight::Leader(sender)
    }

    /// Leader is done: drop the map entry, then the sender wakes waiters
    fn end_flight(&self, key: &Key, sender: watch::Sender<()>) {
        let mut inflight = self
            .inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inflight.remove(key);
        drop(inflight);
        drop(sender);
    }

    /// Wait for the leading fetch to finish, then re-read the store
    async fn await_flight(
        &self,
        key: Key,
        mut receiver: watch::Receiver<()>,
    ) -> Result<Option<Post>, ProtocolError> {
        // Unblocks when the leader drops its sender
        let _ = receiver.changed().await;
        let db = self.db.lock().await;
        let post = find_post_by_key(&db, &key)?;
        Ok(post.filter(|p| p.data.is_some()))
    }

    async fn fetch_block(&self, key: &Key) -> Result<Option<Post>, ProtocolError> {
        let data = match self.engine.fetch(key).await {
            Ok(Some(data)) => data,
            Ok(None) | Err(NetworkError::NotFound) => {
                debug!(key = %hex::encode(key), "resolve: not found on overlay");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let new = NewPost {
            data_key: Some(*key),
            data: Some(data),
            timestamp: current_timestamp(),
            ..Default::default()
        };
        let mut db = self.db.lock().await;
        let post = upsert_post(&mut db, &new)?;
        Ok(Some(post))
    }

    async fn fetch_targeted(
        &self,
        key: &Key,
        target_key: &Key,
    ) -> Result<Option<Post>, ProtocolError> {
        let retrieved = match self.engine.fetch_targeted(key, target_key).await {
            Ok(retrieved) => retrieved,
            Err(NetworkError::NotFound) => {
                debug!(key = %hex::encode(key), "resolve_targeted: not found on overlay");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        match retrieved.object {
            Some(RetrievedObject::Inline(block)) => {
                let payload = match retrieved.data {
                    Some(data) => data,
                    None => match block.raw.get(INLINE_HEADER_LEN..) {
                        Some(payload) => payload.to_vec(),
                        None => {
                            warn!(
                                key = %hex::encode(key),
                                len = block.raw.len(),
                                "resolve_targeted: inline block shorter than header"
                            );
                            return Ok(None);
                        }
                    },
                };

                let new = NewPost {
                    data_key: Some(*key),
                    proof_key: Some(*key),
                    target_key: Some(block.target_key),
                    data: Some(payload),
                    timestamp: current_timestamp(),
                    ..Default::default()
                };
                let mut db = self.db.lock().await;
                let post = upsert_post(&mut db, &new)?;
                Ok(Some(post))
            }
            Some(RetrievedObject::Reference(reference)) => {
                self.fetch_reference_source(&reference, retrieved.data).await
            }
            None => Ok(None),
        }
    }

    /// Fetch the source block of a reference and persist under the full
    /// alias set. `prefetched` skips the fetch when the targeted lookup
    /// already returned the payload.
    async fn fetch_reference_source(
        &self,
        reference: &ReferenceObject,
        prefetched: Option<Vec<u8>>,
    ) -> Result<Option<Post>, ProtocolError> {
        let data = match prefetched {
            Some(data) => data,
            None => match self.engine.fetch(&reference.source_key).await {
                Ok(Some(data)) => data,
                Ok(None) | Err(NetworkError::NotFound) => {
                    debug!(
                        source_key = %hex::encode(reference.source_key),
                        "resolve_reference: source block not found"
                    );
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            },
        };

        let new = NewPost {
            data_key: Some(reference.source_key),
            ref_key: Some(reference.ref_key),
            proof_key: Some(reference.proof_key),
            target_key: Some(reference.target_key),
            signer_key: reference.signer_key,
            data: Some(data),
            timestamp: reference.timestamp,
            ..Default::default()
        };
        let mut db = self.db.lock().await;
        let post = upsert_post(&mut db, &new)?;
        Ok(Some(post))
    }
}
