//! Watched-channel registry
//!
//! Channels the user follows; the channel view scans these addresses for
//! new posts. Unwatching disables the row rather than deleting it so a
//! re-watch keeps the original created_at.

use rusqlite::{params, Connection, OptionalExtension};

use crate::protocol::Key;

use super::posts::current_timestamp;

fn parse_key_row(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Key> {
    let vec: Vec<u8> = row.get(idx)?;
    if vec.len() != 32 {
        return Err(rusqlite::Error::InvalidColumnType(
            idx,
            "channel_key".to_string(),
            rusqlite::types::Type::Blob,
        ));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&vec);
    Ok(key)
}

/// Start watching a channel (idempotent; re-enables a disabled row)
pub fn watch_channel(conn: &Connection, channel_key: &Key) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO channels (channel_key, disabled, created_at)
         VALUES (?1, 0, ?2)
         ON CONFLICT(channel_key) DO UPDATE SET disabled = 0",
        params![channel_key.as_slice(), current_timestamp()],
    )?;
    Ok(())
}

/// Stop watching a channel
pub fn unwatch_channel(conn: &Connection, channel_key: &Key) -> rusqlite::Result<bool> {
    let rows = conn.execute(
        "UPDATE channels SET disabled = 1 WHERE channel_key = ?1 AND disabled = 0",
        [channel_key.as_slice()],
    )?;
    Ok(rows > 0)
}

/// Is this channel currently watched?
pub fn is_channel_watched(conn: &Connection, channel_key: &Key) -> rusqlite::Result<bool> {
    let watched: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM channels WHERE channel_key = ?1 AND disabled = 0",
            [channel_key.as_slice()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(watched.is_some())
}

/// All currently watched channel keys
pub fn get_watched_channels(conn: &Connection) -> rusqlite::Result<Vec<Key>> {
    let mut stmt = conn.prepare(
        "SELECT channel_key FROM channels WHERE disabled = 0 ORDER BY created_at ASC",
    )?;

    let keys = stmt
        .query_map([], |row| parse_key_row(row, 0))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(keys)
}
