//! Network layer
//!
//! The overlay transport is abstracted behind [`NetworkEngine`]; on top of
//! it sit post resolution ([`PostResolver`]) and channel scanning
//! ([`collect_posts`]).

pub mod collect;
pub mod engine;
pub mod resolve;

pub use collect::{collect_posts, ScanEvent, ScanOutcome};
pub use engine::{
    InlineBlock, NetworkEngine, NetworkError, ReferenceObject, RetrievedObject, TargetedData,
    INLINE_HEADER_LEN,
};
pub use resolve::PostResolver;
