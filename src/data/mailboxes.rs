//! Mailbox registry
//!
//! Mailboxes are addresses scanned for incoming messages. Each carries a
//! `scan_interval` in seconds driving the autoscan scheduler; 0 disables
//! autoscan for that mailbox.

use rusqlite::{params, Connection, OptionalExtension};

use crate::protocol::Key;

use super::posts::current_timestamp;

/// A registered mailbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub mailbox_key: Key,
    /// Autoscan interval in seconds (0 = disabled)
    pub scan_interval: u64,
    pub created_at: i64,
}

fn parse_mailbox_row(row: &rusqlite::Row) -> rusqlite::Result<Mailbox> {
    let key_vec: Vec<u8> = row.get(0)?;
    if key_vec.len() != 32 {
        return Err(rusqlite::Error::InvalidColumnType(
            0,
            "mailbox_key".to_string(),
            rusqlite::types::Type::Blob,
        ));
    }
    let mut mailbox_key = [0u8; 32];
    mailbox_key.copy_from_slice(&key_vec);

    let interval: i64 = row.get(1)?;

    Ok(Mailbox {
        mailbox_key,
        scan_interval: interval.max(0) as u64,
        created_at: row.get(2)?,
    })
}

/// Register a mailbox, or update its scan interval if already present
pub fn upsert_mailbox(
    conn: &Connection,
    mailbox_key: &Key,
    scan_interval: u64,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO mailboxes (mailbox_key, scan_interval, created_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(mailbox_key) DO UPDATE SET scan_interval = excluded.scan_interval",
        params![
            mailbox_key.as_slice(),
            scan_interval as i64,
            current_timestamp()
        ],
    )?;
    Ok(())
}

/// Get a single mailbox
pub fn get_mailbox(conn: &Connection, mailbox_key: &Key) -> rusqlite::Result<Option<Mailbox>> {
    conn.query_row(
        "SELECT mailbox_key, scan_interval, created_at FROM mailboxes WHERE mailbox_key = ?1",
        [mailbox_key.as_slice()],
        parse_mailbox_row,
    )
    .optional()
}

/// All mailboxes with autoscan enabled (scan_interval > 0)
pub fn get_autoscan_mailboxes(conn: &Connection) -> rusqlite::Result<Vec<Mailbox>> {
    let mut stmt = conn.prepare(
        "SELECT mailbox_key, scan_interval, created_at FROM mailboxes
         WHERE scan_interval > 0 ORDER BY created_at ASC",
    )?;

    let mailboxes = stmt
        .query_map([], parse_mailbox_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(mailboxes)
}

/// Remove a mailbox entirely
pub fn delete_mailbox(conn: &Connection, mailbox_key: &Key) -> rusqlite::Result<bool> {
    let rows = conn.execute(
        "DELETE FROM mailboxes WHERE mailbox_key = ?1",
        [mailbox_key.as_slice()],
    )?;
    Ok(rows > 0)
}
