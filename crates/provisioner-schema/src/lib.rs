//! Shared types for the build provisioning core.
//!
//! This crate defines the data structures that cross every boundary in the
//! provisioner: the templated [`BucketPath`], the [`Revision`] identifier,
//! the three-state [`SentinelState`] machine persisted alongside every build
//! subtree, and the [`ProvisionError`] taxonomy returned by the core.

/// Templated object-store prefixes and the local directory they map to.
pub mod bucket_path;
/// Build error taxonomy shared by the core and the CLI.
pub mod error;
/// Platform identification used for bucket-path overrides and tree-walk filters.
pub mod platform;
/// Revision parsing, ordering, and pattern extraction.
pub mod revision;
/// The `REVISION` / `.timestamp` / `.partial_build` sentinel state machine.
pub mod sentinel;

pub use bucket_path::BucketPath;
pub use error::ProvisionError;
pub use platform::Platform;
pub use revision::Revision;
pub use sentinel::SentinelState;

/// Build-type substrings stripped from a bucket path's filename segment when
/// deriving the base build directory name.
pub const BUILD_TYPE_SUBSTRINGS: &[&str] = &[
    "-beta",
    "-stable",
    "-debug",
    "-release",
    "-symbolized",
    "-extended_stable",
];

/// Name of the sentinel file recording the materialized revision.
pub const REVISION_FILE_NAME: &str = "REVISION";
/// Name of the sentinel file recording last-use time for LRU eviction.
pub const TIMESTAMP_FILE_NAME: &str = ".timestamp";
/// Name of the sentinel marker indicating a partial (single-target) extraction.
pub const PARTIAL_BUILD_FILE_NAME: &str = ".partial_build";

/// Name of the text file listing valid fuzz targets for a split-target build.
pub const TARGETS_LIST_FILENAME: &str = "targets.list";
