//! Data layer
//!
//! SQLite persistence for:
//! - Cached posts (content records keyed by their alias sets)
//! - Watched channels
//! - Mailboxes and their autoscan intervals

pub mod channels;
pub mod mailboxes;
pub mod posts;
pub mod schema;
pub mod start;

pub use channels::{get_watched_channels, is_channel_watched, unwatch_channel, watch_channel};
pub use mailboxes::{
    delete_mailbox, get_autoscan_mailboxes, get_mailbox, upsert_mailbox, Mailbox,
};
pub use posts::{
    count_posts, current_timestamp, find_post_by_any_alias, find_post_by_key,
    find_posts_by_target, upsert_post, NewPost, Post,
};
pub use schema::create_all_tables;
pub use start::{start_db, start_memory_db, StartError};
