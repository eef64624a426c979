use std::io;
use std::path::Path;

use crate::{PARTIAL_BUILD_FILE_NAME, REVISION_FILE_NAME, Revision, TIMESTAMP_FILE_NAME};

/// The three-state machine formed by the `REVISION` and `.partial_build`
/// sentinel files inside a build subtree.
///
/// Read from disk in one pass and written atomically (write to a `.tmp`
/// sibling, then rename) so a reader never observes a half-written sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentinelState {
    /// Neither sentinel is present, or `REVISION` contains non-integer content.
    NotPresent,
    /// `REVISION` contains a valid integer and no `.partial_build` marker exists.
    Complete(Revision),
    /// `.partial_build` is present: the subtree holds only a subset of targets.
    Partial,
}

impl SentinelState {
    /// Read the sentinel state of a build subtree. `.partial_build` takes
    /// precedence over `REVISION` content, matching the original's check
    /// order (a partial subtree always forces re-extraction regardless of
    /// what `REVISION` happens to say).
    pub fn read(subtree: &Path) -> Self {
        if subtree.join(PARTIAL_BUILD_FILE_NAME).is_file() {
            return Self::Partial;
        }

        match std::fs::read_to_string(subtree.join(REVISION_FILE_NAME)) {
            Ok(contents) => contents
                .trim()
                .parse::<i64>()
                .map_or(Self::NotPresent, |v| Self::Complete(Revision::new(v))),
            Err(_) => Self::NotPresent,
        }
    }

    /// Whether this state represents a completed build of exactly `revision`.
    pub fn matches(self, revision: Revision) -> bool {
        matches!(self, Self::Complete(r) if r == revision)
    }
}

/// Atomically write `contents` to `path`: write to a `.tmp` sibling, then rename.
pub fn atomic_write(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    std::fs::write(&tmp_path, contents)?;
    std::fs::rename(&tmp_path, path)
}

/// Write the decimal revision to `REVISION` inside `subtree`.
pub fn write_revision_file(subtree: &Path, revision: Revision) -> io::Result<()> {
    atomic_write(&subtree.join(REVISION_FILE_NAME), revision.to_string().as_bytes())
}

/// Write an empty `.partial_build` marker inside `subtree`.
pub fn write_partial_marker(subtree: &Path) -> io::Result<()> {
    atomic_write(&subtree.join(PARTIAL_BUILD_FILE_NAME), b"")
}

/// Remove the `.partial_build` marker inside `subtree`, if present.
pub fn clear_partial_marker(subtree: &Path) -> io::Result<()> {
    let marker = subtree.join(PARTIAL_BUILD_FILE_NAME);
    if marker.is_file() {
        std::fs::remove_file(marker)?;
    }
    Ok(())
}

/// Read the `.timestamp` sentinel, defaulting to `0.0` if missing or unparseable.
pub fn read_timestamp(subtree: &Path) -> f64 {
    std::fs::read_to_string(subtree.join(TIMESTAMP_FILE_NAME))
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0.0)
}

/// Write the `.timestamp` sentinel inside `subtree`.
pub fn write_timestamp(subtree: &Path, unix_time: f64) -> io::Result<()> {
    atomic_write(&subtree.join(TIMESTAMP_FILE_NAME), unix_time.to_string().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn not_present_when_empty() {
        let dir = tempdir().unwrap();
        assert_eq!(SentinelState::read(dir.path()), SentinelState::NotPresent);
    }

    #[test]
    fn complete_when_revision_written() {
        let dir = tempdir().unwrap();
        write_revision_file(dir.path(), Revision::new(42)).unwrap();
        assert_eq!(
            SentinelState::read(dir.path()),
            SentinelState::Complete(Revision::new(42))
        );
    }

    #[test]
    fn partial_marker_takes_precedence_over_revision() {
        let dir = tempdir().unwrap();
        write_revision_file(dir.path(), Revision::new(42)).unwrap();
        write_partial_marker(dir.path()).unwrap();
        assert_eq!(SentinelState::read(dir.path()), SentinelState::Partial);
    }

    #[test]
    fn garbage_revision_contents_read_as_not_present() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(REVISION_FILE_NAME), b"not-a-number").unwrap();
        assert_eq!(SentinelState::read(dir.path()), SentinelState::NotPresent);
    }

    #[test]
    fn timestamp_round_trips() {
        let dir = tempdir().unwrap();
        write_timestamp(dir.path(), 123.5).unwrap();
        assert!((read_timestamp(dir.path()) - 123.5).abs() < f64::EPSILON);
    }

    #[test]
    fn missing_timestamp_defaults_to_zero() {
        let dir = tempdir().unwrap();
        assert_eq!(read_timestamp(dir.path()), 0.0);
    }
}
