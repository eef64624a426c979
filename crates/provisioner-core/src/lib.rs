//! Build provisioning core.
//!
//! Materializes the correct build artifacts for a fuzzing job on local disk
//! and produces a [`ProvisionedBuild`] describing where everything landed,
//! without ever touching a process-global environment store: every entry
//! point here takes an explicit [`config::ProvisioningConfig`] and returns an
//! explicit [`ProvisionedBuild`], leaving the decision to publish those
//! paths into the environment to the caller.

/// External object-store and blob-store collaborators.
pub mod archive;
/// The five build variants and the seven-phase pipeline they share.
pub mod build;
/// Explicit configuration, replacing the original's global environment store.
pub mod config;
/// `setup_build` and friends: chooses and drives the correct build variant.
pub mod dispatch;
/// Free-space enforcement via LRU eviction of sibling build directories.
pub mod disk_budget;
/// Walks a materialized build tree and assigns well-known path variables.
pub mod env_publisher;
/// Build-retrieval metrics collaborator.
pub mod metrics;
/// Key/value blob store and secondary-bucket object store collaborators.
pub mod object_store;
/// Rewrites dynamic-linker search paths of extracted binaries.
pub mod rpath;
/// Bucket-path listing, revision sorting, and the local URL-listing cache.
pub mod resolver;
/// `targets.list` reading and target-name filtering.
pub mod targets;

pub use config::ProvisioningConfig;
pub use dispatch::ProvisionedBuild;

/// Wall-clock limit (seconds) after which a slow unpack is logged as a
/// warning rather than aborted. Purely observational; the core never
/// cancels an in-flight unpack on its own.
pub const UNPACK_TIME_LIMIT_SECS: u64 = 20 * 60;

/// Binary size above which RPATH rewriting switches from `patchelf` (which
/// loads the whole binary into memory) to `chrpath` (which edits in place).
pub const PATCHELF_SIZE_LIMIT_BYTES: u64 = (1.5 * 1024.0 * 1024.0 * 1024.0) as u64;

/// Maximum number of LRU evictions attempted per disk-budget call.
pub const MAX_EVICTIONS: u32 = 100;
