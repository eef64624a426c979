//! Explicit configuration, replacing the original's global environment store.
//!
//! [`ProvisioningConfig`] collects every environment-derived input named in
//! the external-interfaces contract into one typed value, loaded once at
//! process start (by the CLI binary) and threaded explicitly through every
//! entry point in this crate. Nothing in `provisioner-core` reads
//! `std::env` directly outside of [`ProvisioningConfig::from_env`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use provisioner_schema::{BucketPath, Platform, ProvisionError, Revision};

/// Free-space floor enforced by the disk budget manager. 10 GiB for the
/// `chromium` deployment profile (large builds, generous headroom), 5 GiB
/// otherwise.
const MIN_FREE_CHROMIUM: u64 = 10 * 1024 * 1024 * 1024;
const MIN_FREE_DEFAULT: u64 = 5 * 1024 * 1024 * 1024;

/// Fixed prefix token used for the secondary "extra overlay" build dir.
pub const EXTRA_BUILD_DIR: &str = "EXTRA_BUILD_DIR";

/// Every environment-derived input a provisioning run needs, collected up
/// front instead of read ad hoc from a process-global store.
#[derive(Debug, Clone)]
pub struct ProvisioningConfig {
    /// `JOB_NAME` -- used as the base directory name when no bucket path is set.
    pub job_name: String,
    /// `BUILDS_DIR` -- root directory under which all base build directories live.
    pub builds_dir: PathBuf,
    /// `BUILD_URLS_DIR` -- directory holding the per-bucket-path URL listing cache.
    pub build_urls_dir: PathBuf,
    /// `ROOT_DIR` -- the safe working directory provisioning resets to before
    /// clearing a build subtree (so the cwd never blocks a directory delete).
    pub root_dir: PathBuf,
    /// `APP_NAME` -- basename of the main executable the publisher looks for.
    pub app_name: Option<String>,
    /// `FUZZER_DIR` -- directory holding fuzzer engine support files (unused
    /// by the provisioning core itself, carried through for parity with the
    /// original's environment contract).
    pub fuzzer_dir: Option<PathBuf>,
    /// `FUZZ_TARGET` -- the fuzz target requested for this job, if any.
    pub fuzz_target: Option<String>,
    /// `REVISION` -- an explicit revision pin, parsed as a positive integer.
    /// Absent or non-positive both mean "resolve trunk instead".
    pub revision: Option<Revision>,
    /// `CUSTOM_BINARY` -- opaque blob-store key for a custom build.
    pub custom_binary: Option<String>,
    /// `RELEASE_BUILD_BUCKET_PATH`.
    pub release_build_bucket_path: Option<BucketPath>,
    /// `SYM_RELEASE_BUILD_BUCKET_PATH`.
    pub sym_release_build_bucket_path: Option<BucketPath>,
    /// `SYM_DEBUG_BUILD_BUCKET_PATH`.
    pub sym_debug_build_bucket_path: Option<BucketPath>,
    /// `FUZZ_TARGET_BUILD_BUCKET_PATH`.
    pub fuzz_target_build_bucket_path: Option<BucketPath>,
    /// `EXTRA_BUILD_BUCKET_PATH`.
    pub extra_build_bucket_path: Option<BucketPath>,
    /// `UNPACK_ALL_FUZZ_TARGETS_AND_FILES`.
    pub unpack_all_fuzz_targets_and_files: bool,
    /// `ALLOW_UNPACK_OVER_HTTP`.
    pub allow_unpack_over_http: bool,
    /// `USE_DEFAULT_LLVM_SYMBOLIZER`.
    pub use_default_llvm_symbolizer: bool,
    /// `TASK_NAME` -- scopes the in-process URL-listing memoization.
    pub task_name: String,
    /// Secondary bucket used for custom builds keyed by object name, as
    /// opposed to the blob store keyed by opaque hash (`custom_builds.bucket`).
    pub custom_builds_bucket: Option<String>,
    /// Host platform; selects path-walk filters, Windows-class unrecoverable
    /// handling, and whether this is a Fuchsia job.
    pub platform: Platform,
    /// Whether this deployment runs the `chromium` profile (selects the
    /// 10 GiB vs. 5 GiB free-space floor).
    pub chromium_profile: bool,
    /// Explicit override for the free-space floor, taking precedence over
    /// the profile default when set. Parsed from `MIN_FREE_DISK_SPACE`.
    pub min_free_disk_space_override: Option<u64>,
    /// Bucket-path overrides keyed by platform identifier.
    pub bucket_path_overrides: HashMap<Platform, BucketPath>,
    /// Paths to prepend to binaries' RPATH when the host advertises
    /// instrumented library search paths. Empty means RPATH patching is
    /// skipped entirely.
    pub instrumented_library_paths: Vec<PathBuf>,
    /// `<prefix>SYMBOLIC_LINK` targets, keyed by the same prefix the
    /// environment publisher uses (`""` for release, `"APP_PATH_DEBUG"` for
    /// symbolized debug).
    pub symbolic_links: HashMap<String, PathBuf>,
}

/// Structurally invalid configuration input: a value that was present but
/// failed to parse, as opposed to an absent optional field (which is not an
/// error -- callers handle absence per-field).
#[derive(Debug, thiserror::Error)]
#[error("invalid configuration value for {field}: {reason}")]
pub struct ConfigError {
    field: &'static str,
    reason: String,
}

impl From<ConfigError> for ProvisionError {
    fn from(e: ConfigError) -> Self {
        Self::Configuration(e.to_string())
    }
}

impl ProvisioningConfig {
    /// Load configuration from the process environment.
    ///
    /// Optional fields default quietly; only a present-but-malformed value
    /// (currently just `MIN_FREE_DISK_SPACE`) produces a [`ConfigError`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let job_name = std::env::var("JOB_NAME").unwrap_or_default();
        let builds_dir = env_path("BUILDS_DIR", PathBuf::from("/mnt/scratch0/builds"));
        let build_urls_dir = env_path("BUILD_URLS_DIR", PathBuf::from("/mnt/scratch0/build_urls"));
        let root_dir = env_path("ROOT_DIR", std::env::temp_dir());

        let min_free_disk_space_override = match std::env::var("MIN_FREE_DISK_SPACE") {
            Ok(raw) => Some(raw.trim().parse::<u64>().map_err(|e| ConfigError {
                field: "MIN_FREE_DISK_SPACE",
                reason: e.to_string(),
            })?),
            Err(_) => None,
        };

        Ok(Self {
            job_name,
            builds_dir,
            build_urls_dir,
            root_dir,
            app_name: env_opt("APP_NAME"),
            fuzzer_dir: env_opt("FUZZER_DIR").map(PathBuf::from),
            fuzz_target: env_opt("FUZZ_TARGET"),
            revision: env_opt("REVISION").and_then(|raw| raw.trim().parse::<i64>().ok()).filter(|v| *v > 0).map(Revision::new),
            custom_binary: env_opt("CUSTOM_BINARY"),
            release_build_bucket_path: env_bucket_path("RELEASE_BUILD_BUCKET_PATH"),
            sym_release_build_bucket_path: env_bucket_path("SYM_RELEASE_BUILD_BUCKET_PATH"),
            sym_debug_build_bucket_path: env_bucket_path("SYM_DEBUG_BUILD_BUCKET_PATH"),
            fuzz_target_build_bucket_path: env_bucket_path("FUZZ_TARGET_BUILD_BUCKET_PATH"),
            extra_build_bucket_path: env_bucket_path("EXTRA_BUILD_BUCKET_PATH"),
            unpack_all_fuzz_targets_and_files: env_bool("UNPACK_ALL_FUZZ_TARGETS_AND_FILES"),
            allow_unpack_over_http: env_bool("ALLOW_UNPACK_OVER_HTTP"),
            use_default_llvm_symbolizer: env_bool("USE_DEFAULT_LLVM_SYMBOLIZER"),
            task_name: std::env::var("TASK_NAME").unwrap_or_default(),
            custom_builds_bucket: env_opt("CUSTOM_BUILDS_BUCKET"),
            platform: Platform::current(),
            chromium_profile: env_bool("CHROMIUM_PROFILE"),
            min_free_disk_space_override,
            bucket_path_overrides: HashMap::new(),
            instrumented_library_paths: Vec::new(),
            symbolic_links: HashMap::new(),
        })
    }

    /// The free-space floor the disk budget manager must enforce: the
    /// explicit override if set, else 10 GiB under the `chromium` profile,
    /// else 5 GiB.
    pub fn min_free_disk_space(&self) -> u64 {
        self.min_free_disk_space_override.unwrap_or(if self.chromium_profile {
            MIN_FREE_CHROMIUM
        } else {
            MIN_FREE_DEFAULT
        })
    }

    /// Apply any platform-specific bucket-path override to `bucket_path`,
    /// falling back to `bucket_path` unchanged when no override is configured
    /// for the current platform.
    pub fn apply_bucket_path_override<'a>(&'a self, bucket_path: &'a BucketPath) -> &'a BucketPath {
        self.bucket_path_overrides.get(&self.platform).unwrap_or(bucket_path)
    }

    /// Whether RPATH patching should run at all: the host advertises at
    /// least one instrumented library search path.
    pub fn wants_rpath_patch(&self) -> bool {
        !self.instrumented_library_paths.is_empty()
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    env_opt(key).map_or(default, PathBuf::from)
}

fn env_bool(key: &str) -> bool {
    matches!(std::env::var(key).as_deref(), Ok("1") | Ok("true") | Ok("True") | Ok("TRUE"))
}

fn env_bucket_path(key: &str) -> Option<BucketPath> {
    env_opt(key).and_then(|raw| BucketPath::parse(raw).ok())
}

/// Path to the `targets.list` sibling file for a split-target bucket path:
/// `<dirname(dirname(bucket_path))>/targets.list`.
pub fn targets_list_path(bucket_path: &BucketPath) -> PathBuf {
    let prefix = Path::new(bucket_path.listing_prefix());
    let dir = prefix.parent().unwrap_or(prefix);
    dir.join(provisioner_schema::TARGETS_LIST_FILENAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_free_disk_space_defaults_by_profile() {
        let mut cfg = bare_config();
        cfg.chromium_profile = false;
        assert_eq!(cfg.min_free_disk_space(), MIN_FREE_DEFAULT);
        cfg.chromium_profile = true;
        assert_eq!(cfg.min_free_disk_space(), MIN_FREE_CHROMIUM);
    }

    #[test]
    fn explicit_override_wins_over_profile() {
        let mut cfg = bare_config();
        cfg.chromium_profile = true;
        cfg.min_free_disk_space_override = Some(42);
        assert_eq!(cfg.min_free_disk_space(), 42);
    }

    #[test]
    fn targets_list_path_is_sibling_of_grandparent_dir() {
        let bp = BucketPath::parse("gs://bucket/project/%TARGET%/build-([0-9]+).zip").unwrap();
        assert_eq!(
            targets_list_path(&bp),
            PathBuf::from("bucket/project/targets.list")
        );
    }

    fn bare_config() -> ProvisioningConfig {
        ProvisioningConfig {
            job_name: "job".into(),
            builds_dir: PathBuf::from("/tmp/builds"),
            build_urls_dir: PathBuf::from("/tmp/build_urls"),
            root_dir: PathBuf::from("/tmp"),
            app_name: None,
            fuzzer_dir: None,
            fuzz_target: None,
            revision: None,
            custom_binary: None,
            release_build_bucket_path: None,
            sym_release_build_bucket_path: None,
            sym_debug_build_bucket_path: None,
            fuzz_target_build_bucket_path: None,
            extra_build_bucket_path: None,
            unpack_all_fuzz_targets_and_files: false,
            allow_unpack_over_http: false,
            use_default_llvm_symbolizer: false,
            task_name: "task".into(),
            custom_builds_bucket: None,
            platform: Platform::Linux,
            chromium_profile: false,
            min_free_disk_space_override: None,
            bucket_path_overrides: HashMap::new(),
            instrumented_library_paths: Vec::new(),
            symbolic_links: HashMap::new(),
        }
    }
}
