//! # agora-core
//!
//! Post resolution, channel scanning and publish plumbing for a
//! content-addressed overlay. Posts are addressed by 32-byte keys and may
//! be attached to channels through signed reference objects; this crate
//! caches everything it resolves, collects whole channels with concurrent
//! discovery strategies, and keeps mailboxes fresh with recurring
//! background scans.
//!
//! The overlay transport itself is pluggable: embedders implement
//! [`NetworkEngine`] and hand it to [`Protocol::start`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use agora_core::{Protocol, ProtocolConfig, channel_key_for_name};
//! use agora_core::testing::MockEngine;
//!
//! # async fn run() -> Result<(), agora_core::ProtocolError> {
//! let engine = Arc::new(MockEngine::new());
//! let protocol = Protocol::start(ProtocolConfig::new(), engine).await?;
//!
//! let channel = channel_key_for_name("rust");
//! protocol.publish_post(b"hello".to_vec(), Some(channel), None, None).await?;
//! # Ok(())
//! # }
//! ```

pub mod data;
pub mod network;
pub mod protocol;
pub mod tasks;
pub mod testing;

pub use network::{
    NetworkEngine, NetworkError, PostResolver, ReferenceObject, ScanEvent, ScanOutcome,
};
pub use protocol::{
    channel_key_for_name, decode_key, encode_key, Key, Protocol, ProtocolConfig, ProtocolError,
    PublishReceipt,
};
