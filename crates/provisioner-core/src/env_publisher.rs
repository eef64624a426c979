//! Walks a materialized build tree and assigns well-known path fields on a
//! [`ProvisionedBuild`].
//!
//! First-match-wins over a depth-first walk (`walkdir`'s default order, as
//! used elsewhere in this corpus for tree walks): the first file named
//! `APP_NAME` becomes the app path, the first `args.gn` becomes the GN args
//! path, the first platform-specific `llvm-symbolizer` becomes the
//! symbolizer path.

use std::path::{Path, PathBuf};

use provisioner_schema::{Platform, ProvisionError};
use walkdir::WalkDir;

use crate::dispatch::ProvisionedBuild;

/// Which half of a symbolized pair this publish call is for. Both variants
/// write the shared `APP_DIR` / `GN_ARGS_PATH` / `LLVM_SYMBOLIZER_PATH`
/// fields unconditionally -- the debug publish deliberately overrides
/// whatever the release publish set, per the documented (not a bug)
/// behavior in the component design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppPathSlot {
    /// Writes `ProvisionedBuild::app_path`.
    Release,
    /// Writes `ProvisionedBuild::app_path_debug`.
    Debug,
}

fn llvm_symbolizer_name(platform: Platform) -> &'static str {
    match platform {
        Platform::Windows => "llvm-symbolizer.exe",
        _ => "llvm-symbolizer",
    }
}

fn should_skip(platform: Platform, path: &Path) -> bool {
    let path_str = path.to_string_lossy();
    match platform {
        Platform::MacOs => path_str.contains(".dSYM"),
        Platform::Windows => path_str.contains("\\initialexe"),
        _ => false,
    }
}

/// Walk `roots` and publish the first-match-wins assignments into `build`.
///
/// `app_name` is typically `ProvisioningConfig::app_name`; when absent, no
/// `APP_PATH`/`APP_DIR` assignment is attempted (but `args.gn` and the
/// symbolizer are still searched for). If the walk completes without
/// finding `app_name` and one was configured, this logs an error but does
/// not fail, matching the original's best-effort contract.
pub fn publish(
    roots: &[&Path],
    app_name: Option<&str>,
    use_default_llvm_symbolizer: bool,
    platform: Platform,
    slot: AppPathSlot,
    build: &mut ProvisionedBuild,
) -> Result<(), ProvisionError> {
    let symbolizer_name = llvm_symbolizer_name(platform);
    let mut app_path: Option<PathBuf> = None;
    let mut gn_args_path: Option<PathBuf> = None;
    let mut symbolizer_path: Option<PathBuf> = None;

    for root in roots {
        if !root.is_dir() {
            continue;
        }
        for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if should_skip(platform, path) {
                continue;
            }
            let basename = entry.file_name().to_string_lossy();

            if app_path.is_none() && app_name.is_some_and(|n| n == basename) {
                app_path = Some(path.to_path_buf());
            }
            if gn_args_path.is_none() && basename == "args.gn" {
                gn_args_path = Some(path.to_path_buf());
            }
            if symbolizer_path.is_none() && !use_default_llvm_symbolizer && basename == symbolizer_name {
                symbolizer_path = Some(path.to_path_buf());
            }

            if app_path.is_some() && gn_args_path.is_some() && (symbolizer_path.is_some() || use_default_llvm_symbolizer) {
                break;
            }
        }
    }

    if let Some(path) = &app_path {
        mark_executable(path)?;
    } else if app_name.is_some() {
        tracing::error!(app_name, "environment publisher did not find APP_NAME under any search root");
    }

    let app_dir = app_path.as_ref().and_then(|p| p.parent().map(Path::to_path_buf));

    match slot {
        AppPathSlot::Release => build.app_path = app_path.or(build.app_path.clone()),
        AppPathSlot::Debug => build.app_path_debug = app_path.or(build.app_path_debug.clone()),
    }
    // APP_DIR, GN_ARGS_PATH, and LLVM_SYMBOLIZER_PATH are shared fields that
    // each publish call overwrites unconditionally, matching the
    // original's deliberate debug-overrides-release behavior.
    if let Some(dir) = app_dir {
        build.app_dir = Some(dir);
    }
    if let Some(path) = gn_args_path {
        build.gn_args_path = Some(path);
    }
    if let Some(path) = symbolizer_path {
        build.symbolizer_path = Some(path);
    }

    Ok(())
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> Result<(), ProvisionError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o750)).map_err(ProvisionError::Io)
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) -> Result<(), ProvisionError> {
    Ok(())
}

/// Replace any symlink at `link_path` with one pointing to `app_dir`, per
/// the `<prefix>SYMBOLIC_LINK` configuration field.
#[cfg(unix)]
pub fn relink_symbolic_link(link_path: &Path, app_dir: &Path) -> Result<(), ProvisionError> {
    if link_path.is_symlink() || link_path.exists() {
        std::fs::remove_file(link_path).map_err(ProvisionError::Io)?;
    }
    std::os::unix::fs::symlink(app_dir, link_path).map_err(ProvisionError::Io)
}

#[cfg(not(unix))]
pub fn relink_symbolic_link(_link_path: &Path, _app_dir: &Path) -> Result<(), ProvisionError> {
    Ok(())
}
