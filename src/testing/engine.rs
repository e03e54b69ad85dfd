//! Scripted network engine
//!
//! An in-memory [`NetworkEngine`] for tests: blocks, reference batches and
//! probe candidates are scripted up front, fetches are counted per key, and
//! failures or latency can be injected.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::data::current_timestamp;
use crate::network::engine::{
    InlineBlock, NetworkEngine, NetworkError, ReferenceObject, RetrievedObject, TargetedData,
};
use crate::protocol::types::Key;

#[derive(Default)]
struct Inner {
    blocks: HashMap<Key, Vec<u8>>,
    targeted: HashMap<Key, RetrievedObject>,
    references: HashMap<Key, Vec<ReferenceObject>>,
    probes: HashMap<Key, Vec<Key>>,
    fetch_counts: HashMap<Key, usize>,
    fetch_delay: Option<Duration>,
    fail_probes: bool,
    fail_references: bool,
    store_confirmations: VecDeque<usize>,
    store_retry_factors: Vec<u32>,
    stored_references: Vec<ReferenceObject>,
}

/// Scripted [`NetworkEngine`] backed by in-memory maps
pub struct MockEngine {
    inner: Mutex<Inner>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Make a data block fetchable at `key`
    pub async fn put_block(&self, key: Key, data: Vec<u8>) {
        self.inner.lock().await.blocks.insert(key, data);
    }

    /// Make an inline block (header still attached) retrievable at `key`
    pub async fn put_inline(&self, key: Key, target_key: Key, raw: Vec<u8>) {
        self.inner.lock().await.targeted.insert(
            key,
            RetrievedObject::Inline(InlineBlock { target_key, raw }),
        );
    }

    /// Attach reference objects to a target; they are streamed by
    /// `stream_references` and retrievable at their own addresses
    pub async fn put_references(&self, target_key: Key, references: Vec<ReferenceObject>) {
        let mut inner = self.inner.lock().await;
        for reference in &references {
            inner
                .targeted
                .insert(reference.ref_key, RetrievedObject::Reference(reference.clone()));
            inner
                .targeted
                .insert(reference.proof_key, RetrievedObject::Reference(reference.clone()));
        }
        inner
            .references
            .entry(target_key)
            .or_default()
            .extend(references);
    }

    /// Script the addresses a probe of `target_key` discovers
    pub async fn put_probe_candidates(&self, target_key: Key, candidates: Vec<Key>) {
        self.inner.lock().await.probes.insert(target_key, candidates);
    }

    /// Delay every fetch, so tests can pile up concurrent callers
    pub async fn set_fetch_delay(&self, delay: Duration) {
        self.inner.lock().await.fetch_delay = Some(delay);
    }

    /// Make every probe call fail with a transport error
    pub async fn fail_probes(&self) {
        self.inner.lock().await.fail_probes = true;
    }

    /// Make every reference stream fail with a transport error
    pub async fn fail_references(&self) {
        self.inner.lock().await.fail_references = true;
    }

    /// Script the confirming-node counts of successive store calls. Once
    /// the script runs out, stores confirm on 10 nodes.
    pub async fn set_store_confirmations(&self, counts: Vec<usize>) {
        self.inner.lock().await.store_confirmations = counts.into();
    }

    /// How often `key` was fetched (plain and targeted)
    pub async fn fetch_count(&self, key: &Key) -> usize {
        self.inner
            .lock()
            .await
            .fetch_counts
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Retry factors of all store calls so far, in order
    pub async fn store_retry_factors(&self) -> Vec<u32> {
        self.inner.lock().await.store_retry_factors.clone()
    }

    /// Reference objects created through `store_reference`
    pub async fn stored_references(&self) -> Vec<ReferenceObject> {
        self.inner.lock().await.stored_references.clone()
    }

    async fn note_fetch(&self, key: &Key) -> Option<Duration> {
        let mut inner = self.inner.lock().await;
        *inner.fetch_counts.entry(*key).or_insert(0) += 1;
        inner.fetch_delay
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkEngine for MockEngine {
    async fn fetch(&self, key: &Key) -> Result<Option<Vec<u8>>, NetworkError> {
        let delay = self.note_fetch(key).await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.inner.lock().await.blocks.get(key).cloned())
    }

    async fn fetch_targeted(
        &self,
        key: &Key,
        _target_key: &Key,
    ) -> Result<TargetedData, NetworkError> {
        let delay = self.note_fetch(key).await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let inner = self.inner.lock().await;
        match inner.targeted.get(key) {
            Some(object) => Ok(TargetedData {
                data: None,
                object: Some(object.clone()),
            }),
            None => Err(NetworkError::NotFound),
        }
    }

    async fn stream_references(
        &self,
        target_key: &Key,
        sink: mpsc::Sender<Vec<ReferenceObject>>,
        _retry_factor: u32,
    ) -> Result<(), NetworkError> {
        let batches = {
            let inner = self.inner.lock().await;
            if inner.fail_references {
                return Err(NetworkError::Transport("reference stream failed".into()));
            }
            inner.references.get(target_key).cloned().unwrap_or_default()
        };
        // Delivered in small batches the way a real lookup would
        for chunk in batches.chunks(2) {
            if sink.send(chunk.to_vec()).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn probe(
        &self,
        target_key: &Key,
        probe_width: usize,
        sink: mpsc::Sender<Key>,
    ) -> Result<(), NetworkError> {
        let candidates = {
            let inner = self.inner.lock().await;
            if inner.fail_probes {
                return Err(NetworkError::Transport("probe failed".into()));
            }
            inner.probes.get(target_key).cloned().unwrap_or_default()
        };
        for key in candidates.into_iter().take(probe_width) {
            if sink.send(key).await.is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn store(
        &self,
        data: Vec<u8>,
        key_tx: oneshot::Sender<Key>,
        retry_factor: u32,
    ) -> Result<usize, NetworkError> {
        let key = *blake3::hash(&data).as_bytes();
        let _ = key_tx.send(key);

        let mut inner = self.inner.lock().await;
        inner.store_retry_factors.push(retry_factor);
        inner.blocks.insert(key, data);
        let confirmations = inner.store_confirmations.pop_front().unwrap_or(10);
        Ok(confirmations)
    }

    async fn store_reference(
        &self,
        target_key: &Key,
        source_key: &Key,
        signer_key: Option<Key>,
        _retry_factor: u32,
    ) -> Result<ReferenceObject, NetworkError> {
        let mut material = Vec::with_capacity(65);
        material.extend_from_slice(target_key);
        material.extend_from_slice(source_key);
        material.push(0);
        let ref_key = *blake3::hash(&material).as_bytes();
        material.pop();
        material.push(1);
        let proof_key = *blake3::hash(&material).as_bytes();

        let reference = ReferenceObject {
            ref_key,
            proof_key,
            source_key: *source_key,
            target_key: *target_key,
            signer_key,
            timestamp: current_timestamp(),
        };

        let mut inner = self.inner.lock().await;
        inner
            .targeted
            .insert(ref_key, RetrievedObject::Reference(reference.clone()));
        inner
            .targeted
            .insert(proof_key, RetrievedObject::Reference(reference.clone()));
        inner
            .references
            .entry(*target_key)
            .or_default()
            .push(reference.clone());
        inner.stored_references.push(reference.clone());
        Ok(reference)
    }
}
