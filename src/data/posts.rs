//! Post data layer
//!
//! A post is a locally cached content record. Its identity is the set of
//! its non-null alias keys (`data_key`, `ref_key`, `proof_key`): two
//! records are the same entity iff any alias matches. The store never holds
//! two rows whose alias sets intersect; `upsert_post` merges by any-alias
//! match, keeping the latest payload and the union of all aliases ever
//! observed.

use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};

use crate::protocol::Key;

/// Current UNIX timestamp in seconds
pub fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// A cached content record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Post {
    /// Database row id
    pub id: i64,
    /// Address of the payload block
    pub data_key: Option<Key>,
    /// Address of the reference object that pointed at the payload
    pub ref_key: Option<Key>,
    /// Proof address of the reference object
    pub proof_key: Option<Key>,
    /// Channel/entity this post is attached to
    pub target_key: Option<Key>,
    /// Signer of the reference object, if signed
    pub signer_key: Option<Key>,
    /// Payload bytes (None until resolved)
    pub data: Option<Vec<u8>>,
    /// Declared timestamp (from the reference object, else local fetch time)
    pub timestamp: i64,
    /// When this node first saw the record
    pub first_seen: i64,
}

impl Post {
    /// All non-null alias keys of this record
    pub fn aliases(&self) -> Vec<Key> {
        [self.data_key, self.ref_key, self.proof_key]
            .into_iter()
            .flatten()
            .collect()
    }

    /// The key this post is best known by (ref_key wins over data_key)
    pub fn display_key(&self) -> Option<Key> {
        self.ref_key.or(self.proof_key).or(self.data_key)
    }
}

/// A record about to be written; `first_seen` is assigned on insert
#[derive(Debug, Clone, Default)]
pub struct NewPost {
    pub data_key: Option<Key>,
    pub ref_key: Option<Key>,
    pub proof_key: Option<Key>,
    pub target_key: Option<Key>,
    pub signer_key: Option<Key>,
    pub data: Option<Vec<u8>>,
    pub timestamp: i64,
}

impl NewPost {
    /// All non-null alias keys of this record
    pub fn aliases(&self) -> Vec<Key> {
        [self.data_key, self.ref_key, self.proof_key]
            .into_iter()
            .flatten()
            .collect()
    }
}

/// Parse a 32-byte key from a database blob
fn parse_key(vec: &[u8], column_name: &str) -> rusqlite::Result<Key> {
    if vec.len() != 32 {
        return Err(rusqlite::Error::InvalidColumnType(
            0,
            column_name.to_string(),
            rusqlite::types::Type::Blob,
        ));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(vec);
    Ok(key)
}

fn parse_opt_key(vec: Option<Vec<u8>>, column_name: &str) -> rusqlite::Result<Option<Key>> {
    vec.map(|v| parse_key(&v, column_name)).transpose()
}

/// Parse a Post from a database row
fn parse_post_row(row: &rusqlite::Row) -> rusqlite::Result<Post> {
    Ok(Post {
        id: row.get(0)?,
        data_key: parse_opt_key(row.get(1)?, "data_key")?,
        ref_key: parse_opt_key(row.get(2)?, "ref_key")?,
        proof_key: parse_opt_key(row.get(3)?, "proof_key")?,
        target_key: parse_opt_key(row.get(4)?, "target_key")?,
        signer_key: parse_opt_key(row.get(5)?, "signer_key")?,
        data: row.get(6)?,
        timestamp: row.get(7)?,
        first_seen: row.get(8)?,
    })
}

const POST_COLUMNS: &str =
    "id, data_key, ref_key, proof_key, target_key, signer_key, data, timestamp, first_seen";

/// Look up a post by a single key matched against any alias column
pub fn find_post_by_key(conn: &Connection, key: &Key) -> rusqlite::Result<Option<Post>> {
    conn.query_row(
        &format!(
            "SELECT {} FROM posts
             WHERE data_key = ?1 OR ref_key = ?1 OR proof_key = ?1",
            POST_COLUMNS
        ),
        [key.as_slice()],
        parse_post_row,
    )
    .optional()
}

/// Look up a post by any of the supplied alias keys
pub fn find_post_by_any_alias(
    conn: &Connection,
    aliases: &[Key],
) -> rusqlite::Result<Option<Post>> {
    for alias in aliases {
        if let Some(post) = find_post_by_key(conn, alias)? {
            return Ok(Some(post));
        }
    }
    Ok(None)
}

/// Get all posts attached to a target, declared timestamp ascending
pub fn find_posts_by_target(conn: &Connection, target_key: &Key) -> rusqlite::Result<Vec<Post>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM posts WHERE target_key = ?1 ORDER BY timestamp ASC, id ASC",
        POST_COLUMNS
    ))?;

    let posts = stmt
        .query_map([target_key.as_slice()], parse_post_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(posts)
}

/// Insert or merge a post record
///
/// Looks up an existing row by any alias of `new`. If one exists, the
/// payload is overwritten (last write wins) and any alias, target or signer
/// the existing row was missing is filled in (the stored alias set is the
/// union ever observed). The declared timestamp and first_seen of the
/// existing row are kept. The whole operation runs in one transaction.
pub fn upsert_post(conn: &mut Connection, new: &NewPost) -> rusqlite::Result<Post> {
    debug_assert!(!new.aliases().is_empty(), "post must carry at least one alias");

    let tx = conn.transaction()?;

    let existing = find_post_by_any_alias(&tx, &new.aliases())?;

    let id = match existing {
        Some(post) => {
            tx.execute(
                "UPDATE posts SET
                    data_key = COALESCE(data_key, ?1),
                    ref_key = COALESCE(ref_key, ?2),
                    proof_key = COALESCE(proof_key, ?3),
                    target_key = COALESCE(target_key, ?4),
                    signer_key = COALESCE(signer_key, ?5),
                    data = COALESCE(?6, data)
                 WHERE id = ?7",
                params![
                    new.data_key.as_ref().map(|k| k.as_slice()),
                    new.ref_key.as_ref().map(|k| k.as_slice()),
                    new.proof_key.as_ref().map(|k| k.as_slice()),
                    new.target_key.as_ref().map(|k| k.as_slice()),
                    new.signer_key.as_ref().map(|k| k.as_slice()),
                    new.data.as_deref(),
                    post.id,
                ],
            )?;
            post.id
        }
        None => {
            tx.execute(
                "INSERT INTO posts
                    (data_key, ref_key, proof_key, target_key, signer_key,
                     data, timestamp, first_seen)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    new.data_key.as_ref().map(|k| k.as_slice()),
                    new.ref_key.as_ref().map(|k| k.as_slice()),
                    new.proof_key.as_ref().map(|k| k.as_slice()),
                    new.target_key.as_ref().map(|k| k.as_slice()),
                    new.signer_key.as_ref().map(|k| k.as_slice()),
                    new.data.as_deref(),
                    new.timestamp,
                    current_timestamp(),
                ],
            )?;
            tx.last_insert_rowid()
        }
    };

    let post = tx.query_row(
        &format!("SELECT {} FROM posts WHERE id = ?1", POST_COLUMNS),
        [id],
        parse_post_row,
    )?;

    tx.commit()?;

    Ok(post)
}

/// Count all cached posts
pub fn count_posts(conn: &Connection) -> rusqlite::Result<usize> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM posts", [], |row| row.get(0))?;
    Ok(count as usize)
}
