//! Protocol configuration

use std::path::PathBuf;

/// Configuration for the protocol
///
/// Built with defaults and customized through the `with_*` methods:
///
/// ```
/// use agora_core::ProtocolConfig;
///
/// let config = ProtocolConfig::new()
///     .with_db_path("/tmp/agora.db")
///     .with_probe_width(32);
/// ```
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Where the database lives; `None` keeps it in memory
    pub db_path: Option<PathBuf>,
    /// How many derived addresses a channel scan probes
    pub probe_width: usize,
    /// Overlay retry factor for reference streaming during scans
    pub reference_retry_factor: u32,
    /// First retry factor of the publish escalation
    pub publish_retry_start: u32,
    /// Retry factor increase per publish attempt
    pub publish_retry_step: u32,
    /// Publish gives up when the retry factor reaches this
    pub publish_retry_limit: u32,
    /// A publish is solid once this many nodes confirmed storage
    pub publish_min_nodes: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            probe_width: 20,
            reference_retry_factor: 25,
            publish_retry_start: 10,
            publish_retry_step: 5,
            publish_retry_limit: 50,
            publish_min_nodes: 5,
        }
    }
}

impl ProtocolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// In-memory database, small overlay factors, quick publishes
    pub fn for_testing() -> Self {
        Self {
            db_path: None,
            probe_width: 4,
            reference_retry_factor: 2,
            publish_retry_start: 2,
            publish_retry_step: 2,
            publish_retry_limit: 8,
            publish_min_nodes: 1,
        }
    }

    pub fn with_db_path(mut self, db_path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(db_path.into());
        self
    }

    pub fn with_probe_width(mut self, probe_width: usize) -> Self {
        self.probe_width = probe_width;
        self
    }

    pub fn with_reference_retry_factor(mut self, retry_factor: u32) -> Self {
        self.reference_retry_factor = retry_factor;
        self
    }

    pub fn with_publish_retries(mut self, start: u32, step: u32, limit: u32) -> Self {
        self.publish_retry_start = start;
        self.publish_retry_step = step;
        self.publish_retry_limit = limit;
        self
    }

    pub fn with_publish_min_nodes(mut self, min_nodes: usize) -> Self {
        self.publish_min_nodes = min_nodes;
        self
    }
}
