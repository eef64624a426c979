/// The domain error taxonomy for build provisioning.
///
/// Mirrors the error kinds a caller must distinguish: configuration problems,
/// malformed bucket-path state, transport/archive failures, and disk
/// exhaustion are all surfaced as `Err` variants of this enum; `provisioner-core`'s
/// `Build::setup` implementations and `dispatch` entry points return
/// `Result<ProvisionedBuild, ProvisionError>` throughout rather than the
/// original's truthy-build-or-none contract (see `DESIGN.md`'s resolved
/// open question on this collapse).
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// A required bucket path, job attribute, or tool path was not configured.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The requested revision or fuzz target does not exist upstream.
    #[error("not found: {0}")]
    NotFound(String),

    /// Listing, HEAD, download, or streaming against the object store failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The archive was malformed or extraction failed.
    #[error("archive error: {0}")]
    Archive(String),

    /// The disk budget manager could not free enough space after the eviction loop.
    #[error("disk exhausted: could not free {requested_bytes} bytes under {builds_root}")]
    DiskExhausted {
        /// Bytes the caller requested to make space for.
        requested_bytes: u64,
        /// The builds root directory that ran out of evictable space.
        builds_root: String,
    },

    /// A build subtree could not be cleared, typically because a file inside it is in use.
    #[error("unrecoverable: unable to clear directory {0}")]
    Unrecoverable(String),

    /// Duplicate revisions in a listing, or a bucket path that fails to parse.
    #[error("bad state: {0}")]
    BadState(String),

    /// Wrapped I/O failure with no more specific domain meaning.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Wrapped JSON (de)serialization failure, e.g. from the URL-listing cache.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}
