//! Channel post collection
//!
//! Collects every post attached to a target address: cached records are
//! surfaced first, then two overlay strategies run concurrently (streaming
//! attached reference objects and probing derived addresses). Each candidate
//! is resolved at most once per scan and surfaced as it lands. A single
//! `Complete` event follows once every resolution has finished.

use std::collections::HashSet;
use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::data::{find_posts_by_target, Post};
use crate::network::engine::{NetworkEngine, ReferenceObject};
use crate::network::resolve::PostResolver;
use crate::protocol::error::ProtocolError;
use crate::protocol::types::Key;

/// Event stream of a single scan
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// A post attached to the scanned target, cached or freshly resolved
    Post(Post),
    /// The scan is over; no further events follow
    Complete,
}

/// Tally of a finished scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Posts resolved from the overlay during this scan
    pub new_count: usize,
    /// Posts surfaced from the local store
    pub old_count: usize,
    /// Candidates that failed to resolve or were gone by fetch time
    pub err_count: usize,
}

enum Candidate {
    Key(Key),
    Reference(ReferenceObject),
}

enum Resolved {
    New,
    Gone,
    Failed,
}

/// Collect all posts attached to `target_key` into `sink`
///
/// Cached posts are sent before any overlay traffic. The two discovery
/// strategies run to exhaustion; a strategy error is logged and treated as
/// that strategy being exhausted, it does not abort the scan. Exactly one
/// `Complete` is sent, after every spawned resolution has finished.
pub async fn collect_posts(
    db: Arc<Mutex<Connection>>,
    engine: Arc<dyn NetworkEngine>,
    resolver: Arc<PostResolver>,
    target_key: Key,
    sink: mpsc::Sender<ScanEvent>,
    probe_width: usize,
    reference_retry_factor: u32,
) -> Result<ScanOutcome, ProtocolError> {
    let mut outcome = ScanOutcome::default();
    let mut seen: HashSet<Key> = HashSet::new();

    // Seed phase: everything already attached to the target locally
    let cached = {
        let conn = db.lock().await;
        find_posts_by_target(&conn, &target_key)?
    };
    for post in cached {
        for alias in post.aliases() {
            seen.insert(alias);
        }
        outcome.old_count += 1;
        if sink.send(ScanEvent::Post(post)).await.is_err() {
            return Err(ProtocolError::SinkClosed);
        }
    }
    debug!(
        target_key = %hex::encode(target_key),
        cached = outcome.old_count,
        "scan seeded from store"
    );

    // Both strategies feed one merged candidate stream. The merged receiver
    // closes once the last strategy task drops its sender.
    let (candidate_tx, mut candidate_rx) = mpsc::channel::<Candidate>(64);

    let references = {
        let engine = engine.clone();
        let candidate_tx = candidate_tx.clone();
        tokio::spawn(async move {
            let (batch_tx, mut batch_rx) = mpsc::channel::<Vec<ReferenceObject>>(16);
            let forward = async {
                while let Some(batch) = batch_rx.recv().await {
                    for reference in batch {
                        if candidate_tx
                            .send(Candidate::Reference(reference))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
            };
            let (stream_result, _) = tokio::join!(
                engine.stream_references(&target_key, batch_tx, reference_retry_factor),
                forward,
            );
            if let Err(e) = stream_result {
                warn!(
                    target_key = %hex::encode(target_key),
                    error = %e,
                    "reference stream ended with error"
                );
            }
        })
    };

    let probes = {
        let engine = engine.clone();
        let candidate_tx = candidate_tx;
        tokio::spawn(async move {
            let (key_tx, mut key_rx) = mpsc::channel::<Key>(16);
            let forward = async {
                while let Some(key) = key_rx.recv().await {
                    if candidate_tx.send(Candidate::Key(key)).await.is_err() {
                        return;
                    }
                }
            };
            let (probe_result, _) =
                tokio::join!(engine.probe(&target_key, probe_width, key_tx), forward);
            if let Err(e) = probe_result {
                warn!(
                    target_key = %hex::encode(target_key),
                    error = %e,
                    "address probe ended with error"
                );
            }
        })
    };

    // Fan out resolutions; each task surfaces its post directly so results
    // stream while discovery is still running
    let mut resolutions: JoinSet<Resolved> = JoinSet::new();

    while let Some(candidate) = candidate_rx.recv().await {
        let aliases = match &candidate {
            Candidate::Key(key) => vec![*key],
            Candidate::Reference(r) => vec![r.ref_key, r.proof_key, r.source_key],
        };
        let already_seen = aliases.iter().any(|alias| seen.contains(alias));
        // Record the whole alias set either way: a skipped candidate may
        // carry aliases the store row lacks, and a later candidate keyed on
        // one of them must not be re-processed
        for alias in aliases {
            seen.insert(alias);
        }
        if already_seen {
            continue;
        }

        let resolver = resolver.clone();
        let sink = sink.clone();
        resolutions.spawn(async move {
            let result = match candidate {
                Candidate::Key(key) => resolver.resolve_targeted(&key, &target_key).await,
                Candidate::Reference(reference) => resolver.resolve_reference(&reference).await,
            };
            match result {
                Ok(Some(post)) => {
                    let _ = sink.send(ScanEvent::Post(post)).await;
                    Resolved::New
                }
                Ok(None) => Resolved::Gone,
                Err(e) => {
                    debug!(error = %e, "candidate resolution failed");
                    Resolved::Failed
                }
            }
        });
    }

    // Join barrier: every resolution lands before Complete goes out
    while let Some(joined) = resolutions.join_next().await {
        match joined {
            Ok(Resolved::New) => outcome.new_count += 1,
            Ok(Resolved::Gone) | Ok(Resolved::Failed) => outcome.err_count += 1,
            Err(e) => {
                warn!(error = %e, "resolution task panicked");
                outcome.err_count += 1;
            }
        }
    }

    let _ = references.await;
    let _ = probes.await;

    if sink.send(ScanEvent::Complete).await.is_err() {
        return Err(ProtocolError::SinkClosed);
    }

    debug!(
        target_key = %hex::encode(target_key),
        new = outcome.new_count,
        old = outcome.old_count,
        err = outcome.err_count,
        "scan complete"
    );

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{count_posts, start_memory_db, upsert_post, NewPost};
    use crate::testing::MockEngine;

    fn test_key(seed: u8) -> Key {
        [seed; 32]
    }

    fn reference(seed: u8, source: Key, target: Key, timestamp: i64) -> ReferenceObject {
        ReferenceObject {
            ref_key: test_key(seed),
            proof_key: test_key(seed + 100),
            source_key: source,
            target_key: target,
            signer_key: None,
            timestamp,
        }
    }

    async fn run_scan(
        db: Arc<Mutex<Connection>>,
        engine: Arc<MockEngine>,
        target: Key,
    ) -> (Vec<ScanEvent>, ScanOutcome) {
        let resolver = Arc::new(PostResolver::new(db.clone(), engine.clone()));
        let (tx, mut rx) = mpsc::channel(64);

        let outcome = collect_posts(db, engine, resolver, target, tx, 20, 25)
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        (events, outcome)
    }

    #[tokio::test]
    async fn test_scan_surfaces_cached_posts_first() {
        let conn = start_memory_db().unwrap();
        let target = test_key(50);
        let mut conn = conn;
        upsert_post(
            &mut conn,
            &NewPost {
                data_key: Some(test_key(1)),
                target_key: Some(target),
                data: Some(b"cached".to_vec()),
                timestamp: 100,
                ..Default::default()
            },
        )
        .unwrap();

        let db = Arc::new(Mutex::new(conn));
        let engine = Arc::new(MockEngine::new());
        let (events, outcome) = run_scan(db, engine, target).await;

        assert_eq!(outcome.old_count, 1);
        assert_eq!(outcome.new_count, 0);
        assert!(matches!(events.first(), Some(ScanEvent::Post(p)) if p.data.as_deref() == Some(b"cached".as_slice())));
        assert!(matches!(events.last(), Some(ScanEvent::Complete)));
    }

    #[tokio::test]
    async fn test_scan_resolves_streamed_references() {
        let conn = start_memory_db().unwrap();
        let target = test_key(50);
        let db = Arc::new(Mutex::new(conn));
        let engine = Arc::new(MockEngine::new());

        let source_a = test_key(1);
        let source_b = test_key(2);
        engine.put_block(source_a, b"post a".to_vec()).await;
        engine.put_block(source_b, b"post b".to_vec()).await;
        engine
            .put_references(
                target,
                vec![
                    reference(10, source_a, target, 100),
                    reference(11, source_b, target, 200),
                ],
            )
            .await;

        let (events, outcome) = run_scan(db.clone(), engine, target).await;

        assert_eq!(outcome.new_count, 2);
        assert_eq!(outcome.err_count, 0);
        let posts: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, ScanEvent::Post(_)))
            .collect();
        assert_eq!(posts.len(), 2);
        assert!(matches!(events.last(), Some(ScanEvent::Complete)));

        let conn = db.lock().await;
        assert_eq!(count_posts(&conn).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_scan_resolves_probed_addresses() {
        let conn = start_memory_db().unwrap();
        let target = test_key(50);
        let db = Arc::new(Mutex::new(conn));
        let engine = Arc::new(MockEngine::new());

        let addr = test_key(1);
        let mut raw = vec![0u8; crate::network::engine::INLINE_HEADER_LEN];
        raw.extend_from_slice(b"probed");
        engine.put_inline(addr, target, raw).await;
        engine.put_probe_candidates(target, vec![addr]).await;

        let (events, outcome) = run_scan(db, engine, target).await;

        assert_eq!(outcome.new_count, 1);
        assert!(events
            .iter()
            .any(|e| matches!(e, ScanEvent::Post(p) if p.data.as_deref() == Some(b"probed".as_slice()))));
    }

    #[tokio::test]
    async fn test_scan_deduplicates_across_strategies() {
        let conn = start_memory_db().unwrap();
        let target = test_key(50);
        let db = Arc::new(Mutex::new(conn));
        let engine = Arc::new(MockEngine::new());

        // The same identity arrives as a reference and as a probed address
        let source = test_key(1);
        let r = reference(10, source, target, 100);
        engine.put_block(source, b"once".to_vec()).await;
        engine.put_references(target, vec![r.clone(), r.clone()]).await;
        engine.put_probe_candidates(target, vec![r.ref_key]).await;

        let (events, outcome) = run_scan(db.clone(), engine, target).await;

        let posts = events
            .iter()
            .filter(|e| matches!(e, ScanEvent::Post(_)))
            .count();
        assert_eq!(posts, 1);
        assert_eq!(outcome.new_count, 1);

        let conn = db.lock().await;
        assert_eq!(count_posts(&conn).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_scan_skips_candidates_already_cached() {
        let mut conn = start_memory_db().unwrap();
        let target = test_key(50);
        let source = test_key(1);
        let r = reference(10, source, target, 100);

        upsert_post(
            &mut conn,
            &NewPost {
                data_key: Some(source),
                ref_key: Some(r.ref_key),
                proof_key: Some(r.proof_key),
                target_key: Some(target),
                data: Some(b"cached".to_vec()),
                timestamp: 100,
                ..Default::default()
            },
        )
        .unwrap();

        let db = Arc::new(Mutex::new(conn));
        let engine = Arc::new(MockEngine::new());
        engine.put_references(target, vec![r]).await;

        let (events, outcome) = run_scan(db, engine.clone(), target).await;

        assert_eq!(outcome.old_count, 1);
        assert_eq!(outcome.new_count, 0);
        let posts = events
            .iter()
            .filter(|e| matches!(e, ScanEvent::Post(_)))
            .count();
        assert_eq!(posts, 1);
        // The cached identity never hit the overlay
        assert_eq!(engine.fetch_count(&source).await, 0);
    }

    #[tokio::test]
    async fn test_skipped_candidate_still_records_its_aliases() {
        let mut conn = start_memory_db().unwrap();
        let target = test_key(50);
        let source = test_key(1);
        let r = reference(10, source, target, 100);

        // The store knows this post only by its data key
        upsert_post(
            &mut conn,
            &NewPost {
                data_key: Some(source),
                target_key: Some(target),
                data: Some(b"cached".to_vec()),
                timestamp: 100,
                ..Default::default()
            },
        )
        .unwrap();

        let db = Arc::new(Mutex::new(conn));
        let engine = Arc::new(MockEngine::new());
        // The reference is skipped (its source key is cached) but brings
        // the ref/proof aliases with it; the probe then surfaces one of
        // those aliases on its own
        engine.put_references(target, vec![r.clone()]).await;
        engine.put_probe_candidates(target, vec![r.proof_key]).await;

        let (events, outcome) = run_scan(db, engine.clone(), target).await;

        let posts = events
            .iter()
            .filter(|e| matches!(e, ScanEvent::Post(_)))
            .count();
        assert_eq!(posts, 1, "cached post must not be emitted twice");
        assert_eq!(outcome.new_count, 0);
        // The probed alias never reached the overlay
        assert_eq!(engine.fetch_count(&r.proof_key).await, 0);
    }

    #[tokio::test]
    async fn test_scan_counts_unresolvable_candidates() {
        let conn = start_memory_db().unwrap();
        let target = test_key(50);
        let db = Arc::new(Mutex::new(conn));
        let engine = Arc::new(MockEngine::new());

        // Reference whose source block is nowhere to be found
        engine
            .put_references(target, vec![reference(10, test_key(1), target, 100)])
            .await;

        let (events, outcome) = run_scan(db, engine, target).await;

        assert_eq!(outcome.new_count, 0);
        assert_eq!(outcome.err_count, 1);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ScanEvent::Complete));
    }

    #[tokio::test]
    async fn test_scan_survives_strategy_failure() {
        let conn = start_memory_db().unwrap();
        let target = test_key(50);
        let db = Arc::new(Mutex::new(conn));
        let engine = Arc::new(MockEngine::new());

        let source = test_key(1);
        engine.put_block(source, b"still found".to_vec()).await;
        engine
            .put_references(target, vec![reference(10, source, target, 100)])
            .await;
        engine.fail_probes().await;

        let (events, outcome) = run_scan(db, engine, target).await;

        // The failing probe strategy does not abort the scan
        assert_eq!(outcome.new_count, 1);
        assert!(matches!(events.last(), Some(ScanEvent::Complete)));
    }

    #[tokio::test]
    async fn test_scan_survives_reference_stream_failure() {
        let conn = start_memory_db().unwrap();
        let target = test_key(50);
        let db = Arc::new(Mutex::new(conn));
        let engine = Arc::new(MockEngine::new());

        let addr = test_key(1);
        let mut raw = vec![0u8; crate::network::engine::INLINE_HEADER_LEN];
        raw.extend_from_slice(b"via probe");
        engine.put_inline(addr, target, raw).await;
        engine.put_probe_candidates(target, vec![addr]).await;
        engine.fail_references().await;

        let (events, outcome) = run_scan(db, engine, target).await;

        assert_eq!(outcome.new_count, 1);
        assert!(matches!(events.last(), Some(ScanEvent::Complete)));
    }

    #[tokio::test]
    async fn test_empty_scan_sends_complete_only() {
        let conn = start_memory_db().unwrap();
        let db = Arc::new(Mutex::new(conn));
        let engine = Arc::new(MockEngine::new());

        let (events, outcome) = run_scan(db, engine, test_key(50)).await;

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ScanEvent::Complete));
        assert_eq!(outcome, ScanOutcome::default());
    }
}
