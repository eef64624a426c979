//! Bucket-path listing, revision sorting, and the local URL-listing cache.
//!
//! This is the pure, local half of "revision discovery": given a listing of
//! object URLs (obtained from an [`ObjectStore`]), pick out the ones that
//! match a bucket path's file-pattern template, sort them by revision, and
//! answer `find_url` / `latest_revision` queries against that sorted list.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use provisioner_schema::revision::{compare_revision_strings, convert_revision_to_integer};
use provisioner_schema::{BucketPath, ProvisionError, Revision};

use crate::object_store::ObjectStore;

/// One object whose basename matched a bucket path's file-pattern template.
#[derive(Debug, Clone)]
pub struct ListedUrl {
    /// The full object URL.
    pub url: String,
    /// The raw captured revision string (may be dotted, e.g. `94.0.4606`).
    pub raw_revision: String,
    /// The parsed revision, or `None` if the raw string didn't parse as an
    /// integer or dotted-integer sequence.
    pub revision: Option<Revision>,
}

/// Enumerate objects under `bucket_path`'s listing prefix, keep only those
/// whose basename matches the file-pattern template, and return them sorted
/// by revision (descending by default, matching the original's
/// `reverse=true`).
///
/// Sorting is numeric-dotted when every matched revision parses; on any
/// parse failure the whole list falls back to lexicographic order (logged
/// as a warning), per the original's documented fallback. Duplicate raw
/// revision strings within one listing are a hard [`ProvisionError::BadState`].
pub async fn list_urls(
    store: &dyn ObjectStore,
    bucket_path: &BucketPath,
    reverse: bool,
) -> Result<Vec<ListedUrl>, ProvisionError> {
    let objects = store.list_blobs(bucket_path.listing_prefix()).await?;
    let urls: Vec<String> = objects.into_iter().map(|o| o.url).collect();
    finalize_listing(bucket_path, match_urls(bucket_path, &urls)?, reverse)
}

/// Filter `urls` down to the ones whose basename matches `bucket_path`'s
/// file-pattern template, extracting each one's captured revision string.
fn match_urls(bucket_path: &BucketPath, urls: &[String]) -> Result<Vec<ListedUrl>, ProvisionError> {
    let pattern = bucket_path.revision_pattern()?;
    let mut matched = Vec::new();
    for url in urls {
        let basename = url.rsplit('/').next().unwrap_or(url);
        let Some(captures) = pattern.captures(basename) else { continue };
        let Some(raw) = captures.get(1) else { continue };
        let raw_revision = raw.as_str().to_string();
        let revision = convert_revision_to_integer(&raw_revision);
        matched.push(ListedUrl { url: url.clone(), raw_revision, revision });
    }
    Ok(matched)
}

/// Reject duplicate revisions, then sort `matched` numerically (falling back
/// to lexicographic order on any parse failure) and apply `reverse`.
fn finalize_listing(
    bucket_path: &BucketPath,
    mut matched: Vec<ListedUrl>,
    reverse: bool,
) -> Result<Vec<ListedUrl>, ProvisionError> {
    let mut seen = std::collections::HashSet::new();
    for entry in &matched {
        if !seen.insert(entry.raw_revision.clone()) {
            return Err(ProvisionError::BadState(format!(
                "duplicate revision '{}' in listing under {bucket_path}",
                entry.raw_revision
            )));
        }
    }

    let all_numeric = matched.iter().all(|e| e.revision.is_some());
    if all_numeric {
        matched.sort_by_key(|e| e.revision.expect("checked all_numeric"));
    } else {
        tracing::warn!(
            bucket_path = %bucket_path,
            "non-numeric revision encountered while listing; falling back to lexicographic sort"
        );
        matched.sort_by(|a, b| compare_revision_strings(&a.raw_revision, &b.raw_revision));
    }

    if reverse {
        matched.reverse();
    }

    Ok(matched)
}

/// Find the URL in `urls` whose captured revision numerically equals
/// `revision`, or `None` if absent.
pub fn find_url(urls: &[ListedUrl], revision: Revision) -> Option<String> {
    urls.iter().find(|e| e.revision == Some(revision)).map(|e| e.url.clone())
}

/// Return the greatest revision present in the listing for `bucket_paths[0]`
/// that is also present in every other supplied bucket path's listing.
/// Used to align a release build with its symbolized release/debug pair.
///
/// Returns `Ok(None)` if `bucket_paths` is empty or no common revision
/// exists.
pub async fn latest_revision(
    store: &dyn ObjectStore,
    bucket_paths: &[BucketPath],
) -> Result<Option<Revision>, ProvisionError> {
    let Some((primary, rest)) = bucket_paths.split_first() else { return Ok(None) };

    let primary_urls = list_urls(store, primary, true).await?;
    let mut other_revision_sets = Vec::with_capacity(rest.len());
    for bucket_path in rest {
        let urls = list_urls(store, bucket_path, true).await?;
        let revisions: std::collections::HashSet<Revision> = urls.iter().filter_map(|e| e.revision).collect();
        other_revision_sets.push(revisions);
    }

    for entry in &primary_urls {
        let Some(revision) = entry.revision else { continue };
        if other_revision_sets.iter().all(|set| set.contains(&revision)) {
            return Ok(Some(revision));
        }
    }
    Ok(None)
}

/// Derive the deterministic local base-directory path for a bucket path (or
/// job name, when no bucket path is configured) under `builds_dir`.
pub fn local_dir(builds_dir: &Path, bucket_path: Option<&BucketPath>, job_name: &str) -> PathBuf {
    builds_dir.join(provisioner_schema::bucket_path::local_dir_name(bucket_path, job_name))
}

fn cache_file_name(bucket_path: &BucketPath) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    bucket_path.as_str().hash(&mut hasher);
    format!("{:016x}.cache", hasher.finish())
}

/// Read a previously cached listing for `bucket_path` from `cache_dir`, if
/// present. The cache file is newline-delimited UTF-8 URLs, one per line.
pub fn read_cached_urls(cache_dir: &Path, bucket_path: &BucketPath) -> Option<Vec<String>> {
    let path = cache_dir.join(cache_file_name(bucket_path));
    let contents = std::fs::read_to_string(path).ok()?;
    Some(contents.lines().map(str::to_string).collect())
}

/// Write `urls` to the listing cache file for `bucket_path` under `cache_dir`.
pub fn write_cached_urls(cache_dir: &Path, bucket_path: &BucketPath, urls: &[String]) -> std::io::Result<()> {
    std::fs::create_dir_all(cache_dir)?;
    let path = cache_dir.join(cache_file_name(bucket_path));
    std::fs::write(path, urls.join("\n"))
}

/// In-process memoization of [`list_urls`] results, keyed on
/// `(bucket_path, task_name)` and scoped to one provisioning run: generalizes
/// the original's `cc_users_for_job`-style per-task caching described in the
/// design notes. No invalidation beyond the cache being dropped with the run.
///
/// When constructed with [`UrlListingCache::with_disk_cache`], a miss also
/// consults the on-disk, newline-delimited-URL cache file under
/// `BUILD_URLS_DIR` before re-listing the object store, and populates it on
/// a full miss -- this is what lets repeated calls across separate processes
/// within the same task skip re-listing, per §4.A.
#[derive(Default)]
pub struct UrlListingCache {
    entries: Mutex<HashMap<(BucketPath, String), Vec<ListedUrl>>>,
    disk_cache_dir: Option<PathBuf>,
}

impl UrlListingCache {
    /// Build an empty cache with no on-disk backing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an empty cache that also reads and writes through
    /// `cache_dir` (typically `BUILD_URLS_DIR`).
    pub fn with_disk_cache(cache_dir: PathBuf) -> Self {
        Self { entries: Mutex::new(HashMap::new()), disk_cache_dir: Some(cache_dir) }
    }

    /// Return the cached listing for `(bucket_path, task_name)`, consulting
    /// the on-disk cache (if configured) and finally `list_urls` in turn,
    /// populating whichever caches missed along the way.
    pub async fn get_or_list(
        &self,
        store: &dyn ObjectStore,
        bucket_path: &BucketPath,
        task_name: &str,
        reverse: bool,
    ) -> Result<Vec<ListedUrl>, ProvisionError> {
        let key = (bucket_path.clone(), task_name.to_string());
        if let Some(cached) = self.entries.lock().expect("cache mutex poisoned").get(&key) {
            return Ok(cached.clone());
        }

        if let Some(cache_dir) = &self.disk_cache_dir {
            if let Some(cached_urls) = read_cached_urls(cache_dir, bucket_path) {
                let listed = finalize_listing(bucket_path, match_urls(bucket_path, &cached_urls)?, reverse)?;
                self.entries.lock().expect("cache mutex poisoned").insert(key, listed.clone());
                return Ok(listed);
            }
        }

        let listed = list_urls(store, bucket_path, reverse).await?;
        if let Some(cache_dir) = &self.disk_cache_dir {
            let urls: Vec<String> = listed.iter().map(|e| e.url.clone()).collect();
            if let Err(e) = write_cached_urls(cache_dir, bucket_path, &urls) {
                tracing::debug!(bucket_path = %bucket_path, error = %e, "failed to write URL listing cache");
            }
        }
        self.entries.lock().expect("cache mutex poisoned").insert(key, listed.clone());
        Ok(listed)
    }
}
