//! `targets.list` reading and target-name filtering for split-target builds.

use std::collections::HashSet;
use std::path::Path;

use provisioner_schema::ProvisionError;

/// Read `targets.list` (plain text, one target name per line) from `path`.
/// Blank lines are skipped; surrounding whitespace on each line is trimmed.
pub fn read_targets_list(path: &Path) -> Result<Vec<String>, ProvisionError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| ProvisionError::Configuration(format!("failed to read targets.list at {}: {e}", path.display())))?;

    Ok(contents.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string).collect())
}

/// The base name of a fuzz target: the text before its first `@` (e.g.
/// `my_fuzzer@asan` -> `my_fuzzer`).
pub fn base_name(fuzz_target: &str) -> &str {
    fuzz_target.split('@').next().unwrap_or(fuzz_target)
}

/// Immediate subdirectory names of `dir`, by base name (before `@`).
fn immediate_subdirectory_base_names(dir: &Path) -> Result<HashSet<String>, ProvisionError> {
    let mut names = HashSet::new();
    let entries = std::fs::read_dir(dir)
        .map_err(|e| ProvisionError::Transport(format!("failed to list {}: {e}", dir.display())))?;
    for entry in entries {
        let entry = entry.map_err(ProvisionError::Io)?;
        if entry.file_type().map_err(ProvisionError::Io)?.is_dir() {
            names.insert(base_name(&entry.file_name().to_string_lossy()).to_string());
        }
    }
    Ok(names)
}

/// Intersect `targets_list` with the immediate subdirectories of
/// `target_build_prefix_dir`, case-sensitive, by base name. Returns the
/// intersection in `targets_list`'s original order.
pub fn filter_available_targets(targets_list: &[String], target_build_prefix_dir: &Path) -> Result<Vec<String>, ProvisionError> {
    let available = immediate_subdirectory_base_names(target_build_prefix_dir)?;
    Ok(targets_list.iter().filter(|t| available.contains(base_name(t))).cloned().collect())
}

/// Validate that `requested` is a listed target, returning its base name on
/// success or [`ProvisionError::NotFound`] on an unlisted target.
pub fn validate_requested_target<'a>(requested: &'a str, targets_list: &[String]) -> Result<&'a str, ProvisionError> {
    let base = base_name(requested);
    if targets_list.iter().any(|t| base_name(t) == base) {
        Ok(base)
    } else {
        Err(ProvisionError::NotFound(format!("fuzz target '{requested}' is not in targets.list")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn reads_targets_list_skipping_blank_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("targets.list");
        std::fs::write(&path, "foo\n\nbar\n  \nbaz\n").unwrap();

        assert_eq!(read_targets_list(&path).unwrap(), vec!["foo", "bar", "baz"]);
    }

    #[test]
    fn base_name_strips_variant_suffix() {
        assert_eq!(base_name("my_fuzzer@asan"), "my_fuzzer");
        assert_eq!(base_name("my_fuzzer"), "my_fuzzer");
    }

    #[test]
    fn validate_requested_target_rejects_unlisted_target() {
        let list = vec!["foo".to_string(), "bar".to_string()];
        assert!(validate_requested_target("baz", &list).is_err());
        assert_eq!(validate_requested_target("foo", &list).unwrap(), "foo");
    }

    #[test]
    fn filter_available_targets_intersects_with_directory_listing() {
        let dir = tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("foo")).unwrap();
        std::fs::create_dir_all(dir.path().join("bar@asan")).unwrap();

        let list = vec!["foo".to_string(), "bar".to_string(), "baz".to_string()];
        let filtered = filter_available_targets(&list, dir.path()).unwrap();
        assert_eq!(filtered, vec!["foo".to_string(), "bar".to_string()]);
    }
}
