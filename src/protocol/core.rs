//! Core protocol
//!
//! [`Protocol`] ties the pieces together: it owns the database, the network
//! engine, the post resolver and the autoscan manager, and exposes the
//! operations a node embeds: resolving posts, scanning channels, publishing,
//! and managing watched channels and mailboxes.

use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::Connection;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{info, warn};

use crate::data::{
    self, current_timestamp, start_db, start_memory_db, upsert_post, NewPost, Post,
};
use crate::network::{
    collect_posts, NetworkEngine, PostResolver, ReferenceObject, ScanEvent, ScanOutcome,
};
use crate::protocol::config::ProtocolConfig;
use crate::protocol::error::ProtocolError;
use crate::protocol::types::Key;
use crate::tasks::{AutoscanManager, MailboxScanner};

/// What a publish accomplished
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    /// Address of the stored payload block
    pub data_key: Key,
    /// How many nodes confirmed storing the payload
    pub confirming_nodes: usize,
    /// The reference object attaching the post to its channel, when one
    /// was requested
    pub reference: Option<ReferenceObject>,
}

/// Scans one mailbox by running a full channel collection against it,
/// discarding the event stream; everything found lands in the store.
struct ChannelScanner {
    db: Arc<Mutex<Connection>>,
    engine: Arc<dyn NetworkEngine>,
    resolver: Arc<PostResolver>,
    probe_width: usize,
    reference_retry_factor: u32,
}

#[async_trait]
impl MailboxScanner for ChannelScanner {
    async fn scan(&self, mailbox_key: &Key) -> Result<ScanOutcome, ProtocolError> {
        let (tx, mut rx) = mpsc::channel(64);
        let drain = tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let outcome = collect_posts(
            self.db.clone(),
            self.engine.clone(),
            self.resolver.clone(),
            *mailbox_key,
            tx,
            self.probe_width,
            self.reference_retry_factor,
        )
        .await?;
        let _ = drain.await;
        Ok(outcome)
    }
}

/// The main protocol handle
pub struct Protocol {
    config: ProtocolConfig,
    db: Arc<Mutex<Connection>>,
    engine: Arc<dyn NetworkEngine>,
    resolver: Arc<PostResolver>,
    autoscan: Arc<AutoscanManager>,
    running: Arc<RwLock<bool>>,
}

impl Protocol {
    /// Open the database, wire up the resolver and autoscan manager, and
    /// restart autoscan for every stored mailbox that has it enabled
    pub async fn start(
        config: ProtocolConfig,
        engine: Arc<dyn NetworkEngine>,
    ) -> Result<Protocol, ProtocolError> {
        let conn = match &config.db_path {
            Some(path) => start_db(&path.to_string_lossy())
                .map_err(|e| ProtocolError::Database(e.to_string()))?,
            None => start_memory_db()?,
        };
        let db = Arc::new(Mutex::new(conn));

        let resolver = Arc::new(PostResolver::new(db.clone(), engine.clone()));
        let scanner = Arc::new(ChannelScanner {
            db: db.clone(),
            engine: engine.clone(),
            resolver: resolver.clone(),
            probe_width: config.probe_width,
            reference_retry_factor: config.reference_retry_factor,
        });
        let autoscan = Arc::new(AutoscanManager::new(scanner));

        let restarted = autoscan.start_from_store(&db).await?;
        info!(autoscan_mailboxes = restarted, "protocol started");

        Ok(Protocol {
            config,
            db,
            engine,
            resolver,
            autoscan,
            running: Arc::new(RwLock::new(true)),
        })
    }

    /// Stop the protocol and every autoscan process
    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        if !*running {
            return;
        }
        *running = false;
        drop(running);

        self.autoscan.stop_all().await;
        info!("protocol stopped");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    async fn ensure_running(&self) -> Result<(), ProtocolError> {
        if *self.running.read().await {
            Ok(())
        } else {
            Err(ProtocolError::NotRunning)
        }
    }

    /// Resolve a post by address: cached copy if the store has one, overlay
    /// fetch otherwise. `Ok(None)` means the address holds nothing.
    pub async fn resolve_post(&self, key: &Key) -> Result<Option<Post>, ProtocolError> {
        self.ensure_running().await?;
        self.resolver.resolve(key).await
    }

    /// Resolve a post by its hex-encoded address
    pub async fn resolve_post_by_address(
        &self,
        address: &str,
    ) -> Result<Option<Post>, ProtocolError> {
        let key = crate::protocol::types::decode_key(address)?;
        self.resolve_post(&key).await
    }

    /// Collect every post attached to a channel into `sink`; cached posts
    /// first, then overlay discoveries, then a single `Complete`
    pub async fn collect_channel_posts(
        &self,
        channel_key: &Key,
        sink: mpsc::Sender<ScanEvent>,
    ) -> Result<ScanOutcome, ProtocolError> {
        self.ensure_running().await?;
        collect_posts(
            self.db.clone(),
            self.engine.clone(),
            self.resolver.clone(),
            *channel_key,
            sink,
            self.config.probe_width,
            self.config.reference_retry_factor,
        )
        .await
    }

    /// Publish a post, optionally attaching it to a channel
    ///
    /// The payload is stored with an escalating retry factor until at least
    /// `publish_min_nodes` nodes confirm or the factor reaches
    /// `publish_retry_limit`. The content key goes out on `early_key` as
    /// soon as the first store attempt computes it. A publish that ends
    /// below the node minimum is returned with a warning; one that no node
    /// confirmed at all is an error.
    pub async fn publish_post(
        &self,
        data: Vec<u8>,
        channel_key: Option<Key>,
        signer_key: Option<Key>,
        early_key: Option<oneshot::Sender<Key>>,
    ) -> Result<PublishReceipt, ProtocolError> {
        self.ensure_running().await?;

        let mut early_key = early_key;
        let mut data_key: Option<Key> = None;
        let mut confirming_nodes = 0usize;
        let mut retry_factor = self.config.publish_retry_start;

        loop {
            let (key_tx, key_rx) = oneshot::channel();
            let early = early_key.take();
            let forward = tokio::spawn(async move {
                match key_rx.await {
                    Ok(key) => {
                        if let Some(early) = early {
                            let _ = early.send(key);
                        }
                        Some(key)
                    }
                    Err(_) => None,
                }
            });

            let stored = self.engine.store(data.clone(), key_tx, retry_factor).await;
            if let Ok(Some(key)) = forward.await {
                data_key = Some(key);
            }

            match stored {
                Ok(nodes) => {
                    confirming_nodes = confirming_nodes.max(nodes);
                    if confirming_nodes >= self.config.publish_min_nodes {
                        break;
                    }
                }
                Err(e) => {
                    warn!(retry_factor, error = %e, "store attempt failed");
                }
            }

            retry_factor += self.config.publish_retry_step;
            if retry_factor >= self.config.publish_retry_limit {
                break;
            }
        }

        let data_key = data_key
            .ok_or_else(|| ProtocolError::Network("store produced no content key".to_string()))?;
        if confirming_nodes == 0 {
            return Err(ProtocolError::Network(
                "no node confirmed storing the post".to_string(),
            ));
        }
        if confirming_nodes < self.config.publish_min_nodes {
            warn!(
                data_key = %hex::encode(data_key),
                confirming_nodes,
                min_nodes = self.config.publish_min_nodes,
                "post stored on fewer nodes than wanted"
            );
        }

        let reference = match channel_key {
            Some(target_key) => Some(
                self.engine
                    .store_reference(
                        &target_key,
                        &data_key,
                        signer_key,
                        self.config.reference_retry_factor,
                    )
                    .await?,
            ),
            None => None,
        };

        // The publisher's own copy goes straight into the store
        let new = NewPost {
            data_key: Some(data_key),
            ref_key: reference.as_ref().map(|r| r.ref_key),
            proof_key: reference.as_ref().map(|r| r.proof_key),
            target_key: reference.as_ref().map(|r| r.target_key),
            signer_key: reference.as_ref().and_then(|r| r.signer_key),
            data: Some(data),
            timestamp: reference
                .as_ref()
                .map(|r| r.timestamp)
                .unwrap_or_else(current_timestamp),
        };
        {
            let mut db = self.db.lock().await;
            upsert_post(&mut db, &new)?;
        }

        info!(
            data_key = %hex::encode(data_key),
            confirming_nodes,
            attached = reference.is_some(),
            "post published"
        );

        Ok(PublishReceipt {
            data_key,
            confirming_nodes,
            reference,
        })
    }

    /// Start following a channel
    pub async fn watch_channel(&self, channel_key: &Key) -> Result<(), ProtocolError> {
        self.ensure_running().await?;
        let db = self.db.lock().await;
        data::watch_channel(&db, channel_key)?;
        Ok(())
    }

    /// Stop following a channel; returns whether it was watched
    pub async fn unwatch_channel(&self, channel_key: &Key) -> Result<bool, ProtocolError> {
        self.ensure_running().await?;
        let db = self.db.lock().await;
        Ok(data::unwatch_channel(&db, channel_key)?)
    }

    pub async fn watched_channels(&self) -> Result<Vec<Key>, ProtocolError> {
        self.ensure_running().await?;
        let db = self.db.lock().await;
        Ok(data::get_watched_channels(&db)?)
    }

    /// Set a mailbox's autoscan interval in seconds; zero disables autoscan.
    /// Persists the interval and retunes the running scan process.
    pub async fn set_mailbox_scan_interval(
        &self,
        mailbox_key: &Key,
        interval_secs: u64,
    ) -> Result<(), ProtocolError> {
        self.ensure_running().await?;
        {
            let db = self.db.lock().await;
            data::upsert_mailbox(&db, mailbox_key, interval_secs)?;
        }
        self.autoscan.update(*mailbox_key, interval_secs).await;
        Ok(())
    }

    /// Scan a mailbox right now. Returns whether a recurring autoscan
    /// process was running for it; without one a single one-off scan pass
    /// is run instead.
    pub async fn trigger_mailbox_scan(&self, mailbox_key: &Key) -> Result<bool, ProtocolError> {
        self.ensure_running().await?;
        Ok(self.autoscan.trigger(mailbox_key).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{count_posts, get_mailbox};
    use crate::testing::MockEngine;

    fn test_key(seed: u8) -> Key {
        [seed; 32]
    }

    async fn start_protocol() -> (Protocol, Arc<MockEngine>) {
        let engine = Arc::new(MockEngine::new());
        let protocol = Protocol::start(ProtocolConfig::for_testing(), engine.clone())
            .await
            .unwrap();
        (protocol, engine)
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let (protocol, _engine) = start_protocol().await;
        assert!(protocol.is_running().await);

        protocol.stop().await;
        assert!(!protocol.is_running().await);

        let result = protocol.resolve_post(&test_key(1)).await;
        assert!(matches!(result, Err(ProtocolError::NotRunning)));
    }

    #[tokio::test]
    async fn test_resolve_post_from_overlay() {
        let (protocol, engine) = start_protocol().await;
        let key = test_key(1);
        engine.put_block(key, b"content".to_vec()).await;

        let post = protocol.resolve_post(&key).await.unwrap().unwrap();
        assert_eq!(post.data.as_deref(), Some(b"content".as_slice()));

        assert!(protocol.resolve_post(&test_key(9)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resolve_post_by_address() {
        let (protocol, engine) = start_protocol().await;
        let key = test_key(1);
        engine.put_block(key, b"content".to_vec()).await;

        let post = protocol
            .resolve_post_by_address(&hex::encode(key))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(post.data_key, Some(key));

        let result = protocol.resolve_post_by_address("not hex").await;
        assert!(matches!(result, Err(ProtocolError::InvalidAddress(_))));
    }

    #[tokio::test]
    async fn test_publish_post_to_channel() {
        let (protocol, engine) = start_protocol().await;
        let channel = test_key(50);

        let (early_tx, early_rx) = oneshot::channel();
        let receipt = protocol
            .publish_post(b"hello".to_vec(), Some(channel), None, Some(early_tx))
            .await
            .unwrap();

        assert_eq!(receipt.data_key, *blake3::hash(b"hello").as_bytes());
        assert_eq!(early_rx.await.unwrap(), receipt.data_key);

        let reference = receipt.reference.unwrap();
        assert_eq!(reference.target_key, channel);
        assert_eq!(reference.source_key, receipt.data_key);
        assert_eq!(engine.stored_references().await.len(), 1);

        // The local store holds the publisher's copy
        let db = protocol.db.lock().await;
        assert_eq!(count_posts(&db).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_publish_escalates_retry_factor() {
        let (protocol, engine) = start_protocol().await;
        engine.set_store_confirmations(vec![0, 0, 1]).await;

        let receipt = protocol
            .publish_post(b"stubborn".to_vec(), None, None, None)
            .await
            .unwrap();

        assert_eq!(receipt.confirming_nodes, 1);
        // for_testing: retries start at 2 and step by 2
        assert_eq!(engine.store_retry_factors().await, vec![2, 4, 6]);
    }

    #[tokio::test]
    async fn test_publish_fails_when_no_node_confirms() {
        let (protocol, engine) = start_protocol().await;
        engine.set_store_confirmations(vec![0, 0, 0]).await;

        let result = protocol.publish_post(b"lost".to_vec(), None, None, None).await;
        assert!(matches!(result, Err(ProtocolError::Network(_))));
    }

    #[tokio::test]
    async fn test_publish_below_minimum_still_succeeds() {
        let engine = Arc::new(MockEngine::new());
        let config = ProtocolConfig::for_testing().with_publish_min_nodes(5);
        let protocol = Protocol::start(config, engine.clone()).await.unwrap();
        engine.set_store_confirmations(vec![2, 2, 2]).await;

        let receipt = protocol
            .publish_post(b"thin".to_vec(), None, None, None)
            .await
            .unwrap();
        assert_eq!(receipt.confirming_nodes, 2);
    }

    #[tokio::test]
    async fn test_published_post_shows_up_in_channel_scan() {
        let (protocol, _engine) = start_protocol().await;
        let channel = test_key(50);

        protocol
            .publish_post(b"first post".to_vec(), Some(channel), None, None)
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let outcome = protocol.collect_channel_posts(&channel, tx).await.unwrap();
        assert_eq!(outcome.old_count, 1);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert!(matches!(&events[0], ScanEvent::Post(p) if p.data.as_deref() == Some(b"first post".as_slice())));
        assert!(matches!(events.last(), Some(ScanEvent::Complete)));
    }

    #[tokio::test]
    async fn test_watch_and_unwatch_channels() {
        let (protocol, _engine) = start_protocol().await;
        let channel = test_key(50);

        protocol.watch_channel(&channel).await.unwrap();
        assert_eq!(protocol.watched_channels().await.unwrap(), vec![channel]);

        assert!(protocol.unwatch_channel(&channel).await.unwrap());
        assert!(protocol.watched_channels().await.unwrap().is_empty());
        assert!(!protocol.unwatch_channel(&channel).await.unwrap());
    }

    #[tokio::test]
    async fn test_mailbox_scan_interval_persists_and_spawns() {
        let (protocol, _engine) = start_protocol().await;
        let mailbox = test_key(60);

        protocol
            .set_mailbox_scan_interval(&mailbox, 300)
            .await
            .unwrap();

        {
            let db = protocol.db.lock().await;
            let stored = get_mailbox(&db, &mailbox).unwrap().unwrap();
            assert_eq!(stored.scan_interval, 300);
        }
        assert!(protocol.trigger_mailbox_scan(&mailbox).await.unwrap());

        protocol
            .set_mailbox_scan_interval(&mailbox, 0)
            .await
            .unwrap();
        assert!(!protocol.trigger_mailbox_scan(&mailbox).await.unwrap());

        protocol.stop().await;
    }

    #[tokio::test]
    async fn test_autoscan_restarts_from_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agora.db");
        let engine = Arc::new(MockEngine::new());
        let config = ProtocolConfig::for_testing().with_db_path(path.clone());

        let protocol = Protocol::start(config.clone(), engine.clone()).await.unwrap();
        let mailbox = test_key(60);
        protocol
            .set_mailbox_scan_interval(&mailbox, 300)
            .await
            .unwrap();
        protocol.stop().await;
        drop(protocol);

        let protocol = Protocol::start(config, engine).await.unwrap();
        assert!(protocol.trigger_mailbox_scan(&mailbox).await.unwrap());
        protocol.stop().await;
    }
}
