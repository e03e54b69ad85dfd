//! Protocol layer

pub mod config;
pub mod core;
pub mod error;
pub mod types;

pub use config::ProtocolConfig;
pub use core::{Protocol, PublishReceipt};
pub use error::ProtocolError;
pub use types::{channel_key_for_name, decode_key, encode_key, Key, KEY_HEX_LEN};
