use thiserror::Error;

/// Errors surfaced by the membership runtime.
///
/// Suspected peers, stale heartbeats and foreign-cluster traffic are not errors; they are
/// handled inside the core and show up only as notifications or statistics.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Socket failure while binding, sending or receiving gossip.
    #[error("gossip socket error: {0}")]
    Io(#[from] std::io::Error),
    /// A gossip datagram could not be encoded or decoded.
    #[error("gossip codec error: {0}")]
    Serialization(String),
    /// An encoded gossip message exceeds `gossip.max_message_size`.
    #[error("gossip message of {0} bytes exceeds the datagram budget")]
    MessageTooLarge(usize),
    /// Configuration rejected during validation.
    #[error("cluster configuration error: {0}")]
    Configuration(String),
    /// A new peer connection could not be established because the table is full.
    #[error("connection limit reached ({limit} peers); refusing new peer")]
    ConnectionLimit {
        /// Configured maximum number of concurrent peer connections.
        limit: usize,
    },
    /// Seed entry could not be parsed or resolved.
    #[error("invalid seed node '{addr}': {source}")]
    InvalidSeed {
        /// Original string provided in configuration.
        addr: String,
        /// Resolver error.
        #[source]
        source: std::io::Error,
    },
    /// The manager was terminated and no longer accepts input.
    #[error("connection manager has been terminated")]
    Shutdown,
}
