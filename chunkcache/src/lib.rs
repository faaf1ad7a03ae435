//! Chunked, disk-backed read-through cache for byte ranges of remote objects.
//!
//! Consumers acquire an [`ObjectBuffer`] for a remote object from a
//! [`Registry`], read arbitrary byte ranges from it, and release it when done.
//! Each read is resolved to a fixed-size, aligned chunk. Chunks are served from
//! a per-object directory on local disk when present, and otherwise fetched
//! from the backend with an HTTP range request, persisted, and followed by a
//! background prefetch of the next chunk.
//!
//! Disk usage under the cache root can be bounded by a quota, in which case the
//! least recently touched chunk file is deleted before a new one is written.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::io;
use std::sync::Arc;

use hyper::StatusCode;
use thiserror::Error;

pub use crate::buffer::{ObjectBuffer, ReadKind};
pub use crate::config::{CacheConfig, CacheConfigBuilder, DEFAULT_CHUNK_SIZE};
pub use crate::registry::{BufferHandle, Registry, RegistryStats};
pub use crate::transport::Transport;

mod buffer;
mod config;
pub mod eviction;
mod registry;
pub mod statsd;
pub mod store;
pub mod test_transport;
pub mod transport;
mod utils;

pub use crate::utils::chunk_window;

/// Error type for results returned from the cache.
///
/// Errors are cheap to clone so that the result of one shared chunk fetch can
/// be handed to every caller waiting on it.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// The object identifier cannot be used as a directory name.
    #[error("invalid object identifier {0:?}")]
    InvalidObjectId(String),

    /// The requested range is empty.
    #[error("invalid read of {size} bytes at {start} for object {object_id}")]
    BadRange {
        /// Identifier of the object being read.
        object_id: String,
        /// Requested start offset.
        start: u64,
        /// Requested length.
        size: u64,
    },

    /// The chunk directory for an object could not be created.
    #[error("could not create chunk directory for object {object_id}")]
    CreateDir {
        /// Identifier of the object being acquired.
        object_id: String,
        /// Underlying filesystem error.
        #[source]
        source: Arc<io::Error>,
    },

    /// Making room under the disk quota failed, so the chunk was not written.
    #[error("could not make room for object {object_id} bytes {offset}-{offset_end}")]
    Quota {
        /// Identifier of the object being read.
        object_id: String,
        /// Start of the chunk window.
        offset: u64,
        /// End of the chunk window.
        offset_end: u64,
        /// Underlying filesystem error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The range request could not be constructed.
    #[error("could not build request for object {object_id} bytes {offset}-{offset_end}")]
    Request {
        /// Identifier of the object being read.
        object_id: String,
        /// Start of the chunk window.
        offset: u64,
        /// End of the chunk window.
        offset_end: u64,
        /// Underlying request builder error.
        #[source]
        source: Arc<hyper::http::Error>,
    },

    /// The backend could not be reached or the request failed in flight.
    #[error("request for object {object_id} bytes {offset}-{offset_end} failed")]
    Transport {
        /// Identifier of the object being read.
        object_id: String,
        /// Start of the chunk window.
        offset: u64,
        /// End of the chunk window.
        offset_end: u64,
        /// Underlying transport error.
        #[source]
        source: Arc<hyper::Error>,
    },

    /// The backend answered with something other than `206 Partial Content`.
    #[error("wrong status code {status} for object {object_id} bytes {offset}-{offset_end}")]
    Status {
        /// Identifier of the object being read.
        object_id: String,
        /// Start of the chunk window.
        offset: u64,
        /// End of the chunk window.
        offset_end: u64,
        /// Status returned by the backend.
        status: StatusCode,
    },

    /// The response body could not be read to the end.
    #[error("could not read body for object {object_id} bytes {offset}-{offset_end}")]
    Body {
        /// Identifier of the object being read.
        object_id: String,
        /// Start of the chunk window.
        offset: u64,
        /// End of the chunk window.
        offset_end: u64,
        /// Underlying transport error.
        #[source]
        source: Arc<hyper::Error>,
    },

    /// The fetched chunk could not be written to disk.
    #[error("could not write chunk for object {object_id} bytes {offset}-{offset_end}")]
    Io {
        /// Identifier of the object being read.
        object_id: String,
        /// Start of the chunk window.
        offset: u64,
        /// End of the chunk window.
        offset_end: u64,
        /// Underlying filesystem error.
        #[source]
        source: Arc<io::Error>,
    },

    /// A buffer handle was released after its registry entry was removed.
    #[error("buffer for object {0} is not registered")]
    NotRegistered(String),

    /// An unexpected internal failure, such as a panicked background task.
    #[error("internal error: {0}")]
    Internal(Arc<anyhow::Error>),
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Internal(Arc::new(err))
    }
}

/// Descriptor of a remote object, as supplied by the metadata collaborator.
///
/// The identifier doubles as the chunk directory name and registry key, so it
/// must be safe to use as a single path component.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Object {
    /// Globally unique identifier of the object.
    pub id: String,

    /// Human readable name, only used for logging.
    pub name: String,

    /// URL that serves HTTP range requests for the object's content.
    pub url: String,

    /// Total size of the object in bytes.
    pub size: u64,
}

impl Object {
    /// Create a new object descriptor.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        url: impl Into<String>,
        size: u64,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            url: url.into(),
            size,
        }
    }
}
