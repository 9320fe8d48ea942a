//! Error types for murmur.

use thiserror::Error;

/// Error type for graph, path, voice and buffer operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Error parsing path: {path}. Segment '{segment}' could not be resolved")]
    Unresolved { path: String, segment: String },

    #[error("A non-container value was found at segment '{segment}' of path {path}")]
    NotAContainer { path: String, segment: String },

    #[error("Path '{path}' does not resolve to a function")]
    NotCallable { path: String },

    #[error("Unknown unit generator: {0}")]
    UnknownUnitGenerator(String),

    #[error("Invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("Node is not in the list")]
    NotInList,

    #[error("Unknown node")]
    UnknownNode,

    #[error("All {max} voices are in use")]
    VoicesExhausted { max: usize },

    #[error("Buffer decode failed: {0}")]
    Decode(String),

    #[error("No buffer named '{0}' is loaded")]
    UnknownBuffer(String),

    #[error("Encoding output failed: {0}")]
    Encode(String),
}

pub type Result<T> = std::result::Result<T, Error>;
