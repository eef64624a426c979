/// Host platform, used to select path-walk filters and Windows-class
/// unrecoverable-error handling.
///
/// Distinct from CPU architecture: provisioning cares about filesystem and
/// process-restart semantics (Windows vs. everything else), and about a
/// handful of genuinely OS-specific skip rules in the environment publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Platform {
    /// Linux, the default target for this crate's archive/RPATH machinery.
    Linux,
    /// macOS; publisher skips `.dSYM` paths.
    MacOs,
    /// Windows; publisher skips `\initialexe` paths, and unrecoverable
    /// directory-clear failures trigger a restart rather than propagating.
    Windows,
    /// Fuchsia; selects the `FuchsiaBuild` variant and requires full unpack.
    Fuchsia,
    /// Android; no provisioning-level behavior differs, but device-specific
    /// post-install hooks are invoked only on this platform.
    Android,
}

impl Platform {
    /// Detect the platform this process is running on.
    ///
    /// Falls back to [`Platform::Linux`] for any `cfg(target_os)` this crate
    /// does not special-case (e.g. the various BSDs), since Linux is the
    /// closest behavioral match (patchelf/chrpath-based RPATH patching, no
    /// Windows-style restart escalation).
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Self::MacOs
        } else if cfg!(target_os = "windows") {
            Self::Windows
        } else {
            Self::Linux
        }
    }

    /// Whether unrecoverable directory-clear failures should trigger the
    /// sleep-and-restart escalation instead of being logged and propagated.
    pub fn is_windows_class(self) -> bool {
        matches!(self, Self::Windows)
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Linux => "linux",
            Self::MacOs => "macos",
            Self::Windows => "windows",
            Self::Fuchsia => "fuchsia",
            Self::Android => "android",
        };
        write!(f, "{s}")
    }
}
