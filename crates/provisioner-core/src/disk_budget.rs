//! Free-space enforcement via LRU eviction of sibling build directories.
//!
//! Runs entirely inside one [`tokio::task::spawn_blocking`] call since the
//! whole algorithm is a tight sequential loop of synchronous filesystem
//! queries and deletions -- there is nothing to usefully interleave with
//! the async runtime here, following this corpus's pattern of offloading
//! blocking filesystem work rather than sprinkling `spawn_blocking` per
//! syscall.

use std::path::{Path, PathBuf};

use provisioner_schema::{sentinel, ProvisionError};

use crate::MAX_EVICTIONS;

/// Ensure at least `requested_bytes + min_free` bytes are available under
/// `builds_root`, evicting least-recently-used sibling directories (by
/// `.timestamp`) until the floor is met or [`MAX_EVICTIONS`] is exhausted.
///
/// `current_build_dir`, if given, protects the in-progress build: no
/// candidate that is a path-prefix of it is ever deleted.
pub async fn make_space(
    builds_root: &Path,
    requested_bytes: u64,
    current_build_dir: Option<&Path>,
    min_free: u64,
) -> Result<(), ProvisionError> {
    let builds_root = builds_root.to_path_buf();
    let current_build_dir = current_build_dir.map(Path::to_path_buf);

    tokio::task::spawn_blocking(move || {
        make_space_blocking(&builds_root, requested_bytes, current_build_dir.as_deref(), min_free)
    })
    .await
    .map_err(|e| ProvisionError::Unrecoverable(format!("disk budget task panicked: {e}")))?
}

fn make_space_blocking(
    builds_root: &Path,
    requested_bytes: u64,
    current_build_dir: Option<&Path>,
    min_free: u64,
) -> Result<(), ProvisionError> {
    std::fs::create_dir_all(builds_root).map_err(ProvisionError::Io)?;

    for _ in 0..MAX_EVICTIONS {
        let free = fs2::available_space(builds_root).map_err(|e| {
            ProvisionError::Transport(format!("could not query free space under {}: {e}", builds_root.display()))
        })?;

        if free >= requested_bytes.saturating_add(min_free) {
            return Ok(());
        }

        match select_eviction_candidate(builds_root, current_build_dir)? {
            Some(victim) => {
                tracing::info!(
                    dir = %victim.display(),
                    free_bytes = free,
                    requested_bytes,
                    "evicting least-recently-used build directory"
                );
                std::fs::remove_dir_all(&victim).map_err(|e| {
                    ProvisionError::Unrecoverable(format!("failed to evict {}: {e}", victim.display()))
                })?;
            }
            None => {
                return Err(ProvisionError::DiskExhausted {
                    requested_bytes,
                    builds_root: builds_root.display().to_string(),
                });
            }
        }
    }

    Err(ProvisionError::DiskExhausted { requested_bytes, builds_root: builds_root.display().to_string() })
}

/// Select the immediate child of `builds_root` with the smallest
/// `.timestamp` (missing file counts as `0.0`), excluding any child that is
/// a path-prefix of `current_build_dir`.
fn select_eviction_candidate(builds_root: &Path, current_build_dir: Option<&Path>) -> Result<Option<PathBuf>, ProvisionError> {
    let mut best: Option<(PathBuf, f64)> = None;

    for entry in std::fs::read_dir(builds_root).map_err(ProvisionError::Io)? {
        let entry = entry.map_err(ProvisionError::Io)?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if let Some(current) = current_build_dir {
            if current.starts_with(&path) {
                continue;
            }
        }

        let timestamp = sentinel::read_timestamp(&path);
        if best.as_ref().is_none_or(|(_, best_ts)| timestamp < *best_ts) {
            best = Some((path, timestamp));
        }
    }

    Ok(best.map(|(path, _)| path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use provisioner_schema::sentinel::write_timestamp;
    use tempfile::tempdir;

    #[tokio::test]
    async fn succeeds_immediately_when_space_already_sufficient() {
        let dir = tempdir().unwrap();
        make_space(dir.path(), 0, None, 0).await.unwrap();
    }

    #[tokio::test]
    async fn evicts_smallest_timestamp_first() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::create_dir_all(&a).unwrap();
        std::fs::create_dir_all(&b).unwrap();
        write_timestamp(&a, 5.0).unwrap();
        write_timestamp(&b, 1.0).unwrap();

        // Requesting more than fs2 would ever report free forces an eviction
        // to be attempted; min_free=0 and requested_bytes=0 means the loop
        // succeeds without evicting, so instead we call the candidate
        // selector directly to assert LRU ordering deterministically.
        let victim = select_eviction_candidate(dir.path(), None).unwrap().unwrap();
        assert_eq!(victim, b);
    }

    #[tokio::test]
    async fn never_evicts_a_prefix_of_current_build_dir() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a");
        std::fs::create_dir_all(a.join("revisions")).unwrap();
        write_timestamp(&a, 1.0).unwrap();

        let current = a.join("revisions");
        let victim = select_eviction_candidate(dir.path(), Some(&current)).unwrap();
        assert!(victim.is_none());
    }

    #[tokio::test]
    async fn missing_timestamp_counts_as_zero_and_is_evicted_first() {
        let dir = tempdir().unwrap();
        let no_ts = dir.path().join("no_ts");
        let has_ts = dir.path().join("has_ts");
        std::fs::create_dir_all(&no_ts).unwrap();
        std::fs::create_dir_all(&has_ts).unwrap();
        write_timestamp(&has_ts, 100.0).unwrap();

        let victim = select_eviction_candidate(dir.path(), None).unwrap().unwrap();
        assert_eq!(victim, no_ts);
    }

    #[tokio::test]
    async fn disk_exhausted_when_no_eligible_candidate() {
        let dir = tempdir().unwrap();
        let current = dir.path().join("only_child");
        std::fs::create_dir_all(&current).unwrap();
        write_timestamp(&current, 1.0).unwrap();

        // The only child present is a prefix of current_build_dir, so there
        // is nothing left to evict; requesting an absurd amount of free
        // space forces the loop to exhaust.
        let result = make_space(dir.path(), u64::MAX / 2, Some(&current), 0).await;
        assert!(matches!(result, Err(ProvisionError::DiskExhausted { .. })));
    }
}
