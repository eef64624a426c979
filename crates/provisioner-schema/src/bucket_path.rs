use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use regex::Regex;

use crate::ProvisionError;

/// A templated object-store prefix of the form
/// `<scheme>://<bucket>/<prefix>/<file-pattern>`, where `<file-pattern>`
/// contains exactly one capture group identifying the revision within a
/// filename (e.g. `build-([0-9]+).zip`).
///
/// May contain the literal token `%TARGET%`, substituted with a fuzz
/// target's base name (the text before its first `@`) before use.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct BucketPath(String);

impl BucketPath {
    /// Parse and validate a bucket path. The only structural invariant
    /// enforced here is the presence of a `scheme://` separator; the
    /// file-pattern capture group is validated lazily by
    /// [`BucketPath::revision_pattern`].
    pub fn parse(raw: impl Into<String>) -> Result<Self, ProvisionError> {
        let raw = raw.into();
        if !raw.contains("://") {
            return Err(ProvisionError::BadState(format!(
                "bucket path missing scheme separator: {raw}"
            )));
        }
        Ok(Self(raw))
    }

    /// The raw bucket path string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Substitute `%TARGET%` with the given fuzz target's base name (the
    /// text before its first `@`). A no-op if the token is absent.
    pub fn with_target(&self, fuzz_target: &str) -> Self {
        let base = fuzz_target.split('@').next().unwrap_or(fuzz_target);
        Self(self.0.replace("%TARGET%", base))
    }

    fn without_scheme(&self) -> &str {
        self.0.splitn(2, "://").nth(1).unwrap_or(&self.0)
    }

    /// Everything before the last `/`: the prefix under which objects are listed.
    pub fn listing_prefix(&self) -> &str {
        let rest = self.without_scheme();
        rest.rfind('/').map_or("", |idx| &rest[..idx])
    }

    /// The filename template: everything after the last `/`.
    pub fn file_pattern(&self) -> &str {
        let rest = self.without_scheme();
        rest.rfind('/').map_or(rest, |idx| &rest[idx + 1..])
    }

    /// Compile the file-pattern segment as the regex used to extract a
    /// revision capture group from a listed object's basename.
    pub fn revision_pattern(&self) -> Result<Regex, ProvisionError> {
        Regex::new(self.file_pattern())
            .map_err(|e| ProvisionError::BadState(format!("invalid revision pattern: {e}")))
    }

    /// Derive the deterministic local base-directory name for this bucket
    /// path. See [`local_dir_name`] for the algorithm.
    pub fn local_dir_name(&self, job_name: &str) -> String {
        local_dir_name(Some(self), job_name)
    }
}

impl std::fmt::Display for BucketPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Derive the deterministic local base-directory name for a bucket path (or
/// fall back to the job name if no bucket path is supplied): scheme
/// removed, slashes in the listing-prefix part replaced with underscores,
/// the filename template stripped of [`crate::BUILD_TYPE_SUBSTRINGS`], then
/// concatenated with a short hash of the stripped filename.
///
/// Same bucket path always yields the same local directory across
/// processes, since the hash is a pure function of the stripped filename.
pub fn local_dir_name(bucket_path: Option<&BucketPath>, job_name: &str) -> String {
    let Some(bucket_path) = bucket_path else {
        return job_name.to_string();
    };

    let rest = bucket_path.without_scheme();
    let (dir_part, filename) = rest
        .rfind('/')
        .map_or(("", rest), |idx| (&rest[..idx], &rest[idx + 1..]));

    if dir_part.is_empty() {
        return job_name.to_string();
    }

    let normalized_dir = dir_part.replace('/', "_");
    let stripped_filename = strip_build_type_substrings(filename);
    let hash = short_hash(&stripped_filename);
    format!("{normalized_dir}_{hash}")
}

fn strip_build_type_substrings(filename: &str) -> String {
    let mut stripped = filename.to_string();
    for suffix in crate::BUILD_TYPE_SUBSTRINGS {
        stripped = stripped.replace(suffix, "");
    }
    stripped
}

fn short_hash(s: &str) -> String {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_scheme() {
        assert!(BucketPath::parse("bucket/build-([0-9]+).zip").is_err());
    }

    #[test]
    fn splits_prefix_and_pattern() {
        let bp = BucketPath::parse("gs://bucket/path/build-([0-9]+).zip").unwrap();
        assert_eq!(bp.listing_prefix(), "bucket/path");
        assert_eq!(bp.file_pattern(), "build-([0-9]+).zip");
    }

    #[test]
    fn substitutes_target_token() {
        let bp = BucketPath::parse("gs://bucket/%TARGET%/build-([0-9]+).zip").unwrap();
        let substituted = bp.with_target("my_fuzzer@asan");
        assert_eq!(substituted.as_str(), "gs://bucket/my_fuzzer/build-([0-9]+).zip");
    }

    #[test]
    fn local_dir_name_is_pure() {
        let bp = BucketPath::parse("gs://bucket/path/build-stable-([0-9]+).zip").unwrap();
        let a = bp.local_dir_name("job");
        let b = bp.local_dir_name("job");
        assert_eq!(a, b);
    }

    #[test]
    fn local_dir_name_falls_back_to_job_name_when_no_bucket_path() {
        assert_eq!(local_dir_name(None, "my_job"), "my_job");
    }

    #[test]
    fn local_dir_name_strips_build_type_suffixes_before_hashing() {
        let a = BucketPath::parse("gs://bucket/path/build-([0-9]+)-release.zip").unwrap();
        let b = BucketPath::parse("gs://bucket/path/build-([0-9]+)-debug.zip").unwrap();
        // Both reduce to the same stripped filename "build-([0-9]+).zip", so
        // they collide into the same base directory -- this mirrors the
        // original's behavior of sharing a base dir across build types.
        assert_eq!(a.local_dir_name("job"), b.local_dir_name("job"));
    }
}
