//! Database schema definitions
//!
//! # Tables
//!
//! - `posts`: cached content records, identified by up to three alias keys
//! - `channels`: channel addresses this node watches
//! - `mailboxes`: mailbox addresses with their autoscan interval

use rusqlite::Connection;

/// Creates all required database tables
pub fn create_all_tables(conn: &Connection) -> rusqlite::Result<()> {
    create_post_table(conn)?;
    create_channel_table(conn)?;
    create_mailbox_table(conn)?;
    Ok(())
}

/// Post table: locally cached content records
///
/// A post's identity is the set of its non-null alias keys:
/// - `data_key`: address of the payload block itself
/// - `ref_key`: address of the reference object that pointed at the payload
/// - `proof_key`: proof address of that reference object
///
/// At least one alias must be set. No two rows may share an alias value;
/// the partial UNIQUE indexes below enforce that per column. All key
/// columns are 32-byte BLOBs.
pub fn create_post_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS posts (
            id INTEGER PRIMARY KEY,
            data_key BLOB CHECK (length(data_key) = 32),
            ref_key BLOB CHECK (length(ref_key) = 32),
            proof_key BLOB CHECK (length(proof_key) = 32),
            target_key BLOB CHECK (length(target_key) = 32),
            signer_key BLOB CHECK (length(signer_key) = 32),
            data BLOB,
            timestamp INTEGER NOT NULL,
            first_seen INTEGER NOT NULL,
            CHECK (data_key IS NOT NULL
                OR ref_key IS NOT NULL
                OR proof_key IS NOT NULL)
        )",
        [],
    )?;

    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_posts_data_key
         ON posts(data_key) WHERE data_key IS NOT NULL",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_posts_ref_key
         ON posts(ref_key) WHERE ref_key IS NOT NULL",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_posts_proof_key
         ON posts(proof_key) WHERE proof_key IS NOT NULL",
        [],
    )?;

    // Ordered channel reads: all posts for a target, timestamp ascending
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_posts_target
         ON posts(target_key, timestamp)",
        [],
    )?;

    Ok(())
}

/// Channel table: channel addresses this node watches
pub fn create_channel_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS channels (
            channel_key BLOB PRIMARY KEY NOT NULL CHECK (length(channel_key) = 32),
            disabled INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        )",
        [],
    )?;
    Ok(())
}

/// Mailbox table: mailbox addresses with their autoscan interval
///
/// `scan_interval` is in seconds; 0 means autoscan is disabled for that
/// mailbox.
pub fn create_mailbox_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS mailboxes (
            mailbox_key BLOB PRIMARY KEY NOT NULL CHECK (length(mailbox_key) = 32),
            scan_interval INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_mailboxes_scan
         ON mailboxes(scan_interval) WHERE scan_interval > 0",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn in_memory_db() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn test_create_all_tables() {
        let conn = in_memory_db();
        create_all_tables(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"posts".to_string()));
        assert!(tables.contains(&"channels".to_string()));
        assert!(tables.contains(&"mailboxes".to_string()));
    }

    #[test]
    fn test_post_requires_at_least_one_alias() {
        let conn = in_memory_db();
        create_post_table(&conn).unwrap();

        let result = conn.execute(
            "INSERT INTO posts (data, timestamp, first_seen) VALUES (?1, ?2, ?3)",
            rusqlite::params![b"orphan".as_slice(), 0i64, 0i64],
        );

        assert!(result.is_err(), "post with no alias should be rejected");
    }

    #[test]
    fn test_post_alias_uniqueness() {
        let conn = in_memory_db();
        create_post_table(&conn).unwrap();

        let key = [7u8; 32];
        conn.execute(
            "INSERT INTO posts (data_key, timestamp, first_seen) VALUES (?1, 0, 0)",
            [key.as_slice()],
        )
        .unwrap();

        // Same data_key again must violate the partial unique index
        let result = conn.execute(
            "INSERT INTO posts (data_key, timestamp, first_seen) VALUES (?1, 0, 0)",
            [key.as_slice()],
        );
        assert!(result.is_err(), "duplicate data_key should be rejected");
    }

    #[test]
    fn test_post_null_aliases_do_not_collide() {
        let conn = in_memory_db();
        create_post_table(&conn).unwrap();

        // Two rows with NULL ref_key are fine; the unique index is partial
        conn.execute(
            "INSERT INTO posts (data_key, timestamp, first_seen) VALUES (?1, 0, 0)",
            [[1u8; 32].as_slice()],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO posts (data_key, timestamp, first_seen) VALUES (?1, 0, 0)",
            [[2u8; 32].as_slice()],
        )
        .unwrap();
    }

    #[test]
    fn test_post_key_size_check() {
        let conn = in_memory_db();
        create_post_table(&conn).unwrap();

        let short = [0u8; 16];
        let result = conn.execute(
            "INSERT INTO posts (data_key, timestamp, first_seen) VALUES (?1, 0, 0)",
            [short.as_slice()],
        );
        assert!(result.is_err(), "should reject key with wrong size");
    }

    #[test]
    fn test_posts_target_index_exists() {
        let conn = in_memory_db();
        create_post_table(&conn).unwrap();

        let indexes: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='index' AND tbl_name='posts'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert!(indexes.contains(&"idx_posts_target".to_string()));
        assert!(indexes.contains(&"idx_posts_data_key".to_string()));
        assert!(indexes.contains(&"idx_posts_ref_key".to_string()));
        assert!(indexes.contains(&"idx_posts_proof_key".to_string()));
    }
}
