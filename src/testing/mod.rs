//! Test utilities

use rand::RngCore;

use crate::protocol::Key;

pub mod engine;

pub use engine::MockEngine;

/// A fresh random 32-byte key
pub fn random_key() -> Key {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    key
}
