//! Rewrites dynamic-linker search paths of extracted binaries.
//!
//! Only runs when the host advertises instrumented library search paths.
//! Mirrors the teacher crate's `install_name_tool`-driven relinker
//! ([`crate::core::relinker`] in the teacher repo) but targets ELF RPATH via
//! two external tools instead of Mach-O load commands: `patchelf` for
//! binaries under the size threshold (it loads the whole binary into
//! memory) and `chrpath` above it (it edits in place).

use std::path::Path;

use provisioner_schema::ProvisionError;
use tokio::process::Command;

use crate::PATCHELF_SIZE_LIMIT_BYTES;

/// Which external tool to use to read/write a binary's RPATH, chosen by
/// size: `patchelf` loads the whole binary into memory, so binaries at or
/// above [`PATCHELF_SIZE_LIMIT_BYTES`] use `chrpath` instead, which edits
/// the ELF header in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RpathTool {
    Patchelf,
    Chrpath,
}

fn tool_for_size(size_bytes: u64) -> RpathTool {
    if size_bytes >= PATCHELF_SIZE_LIMIT_BYTES {
        RpathTool::Chrpath
    } else {
        RpathTool::Patchelf
    }
}

/// Patch RPATH on every path in `binaries`, prepending `instrumented_paths`
/// (each as a `$ORIGIN`-relative entry is expected to already exist in the
/// instrumented path list) unless already present. A no-op if
/// `instrumented_paths` is empty.
pub async fn patch_binaries(binaries: &[impl AsRef<Path>], instrumented_paths: &[impl AsRef<Path>]) -> Result<(), ProvisionError> {
    if instrumented_paths.is_empty() {
        return Ok(());
    }
    for binary in binaries {
        patch_one(binary.as_ref(), instrumented_paths).await?;
    }
    Ok(())
}

async fn patch_one(binary: &Path, instrumented_paths: &[impl AsRef<Path>]) -> Result<(), ProvisionError> {
    let size = tokio::fs::metadata(binary)
        .await
        .map_err(|e| ProvisionError::Configuration(format!("cannot stat {} for RPATH patch: {e}", binary.display())))?
        .len();
    let tool = tool_for_size(size);

    let current = read_rpath(binary, tool).await?;
    let origin_only: Vec<String> = current.into_iter().filter(|e| e.contains("$ORIGIN")).collect();

    let mut updated = origin_only.clone();
    for instrumented in instrumented_paths.iter().rev() {
        let entry = format!("$ORIGIN/{}", instrumented.as_ref().display());
        if !updated.contains(&entry) {
            updated.insert(0, entry);
        }
    }

    if updated == origin_only {
        return Ok(());
    }

    write_rpath(binary, tool, &updated).await
}

fn tool_binary_name(tool: RpathTool) -> &'static str {
    match tool {
        RpathTool::Patchelf => "patchelf",
        RpathTool::Chrpath => "chrpath",
    }
}

async fn locate_tool(tool: RpathTool) -> Result<std::path::PathBuf, ProvisionError> {
    let name = tool_binary_name(tool);
    which::which(name).map_err(|e| ProvisionError::Configuration(format!("{name} not found on PATH: {e}")))
}

async fn read_rpath(binary: &Path, tool: RpathTool) -> Result<Vec<String>, ProvisionError> {
    let tool_path = locate_tool(tool).await?;

    match tool {
        RpathTool::Patchelf => {
            let output = Command::new(&tool_path)
                .arg("--print-rpath")
                .arg(binary)
                .output()
                .await
                .map_err(|e| ProvisionError::Archive(format!("failed to spawn patchelf: {e}")))?;
            if !output.status.success() {
                return Ok(Vec::new());
            }
            let stdout = String::from_utf8_lossy(&output.stdout);
            Ok(split_rpath(stdout.trim()))
        }
        RpathTool::Chrpath => {
            let output = Command::new(&tool_path)
                .arg(binary)
                .output()
                .await
                .map_err(|e| ProvisionError::Archive(format!("failed to spawn chrpath: {e}")))?;

            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("no rpath or runpath tag found") {
                return Ok(Vec::new());
            }

            let combined = format!("{}{}", String::from_utf8_lossy(&output.stdout), stderr);
            let Some(idx) = combined.find("RPATH=") else {
                return Ok(Vec::new());
            };
            let rest = &combined[idx + "RPATH=".len()..];
            let line_end = rest.find('\n').unwrap_or(rest.len());
            Ok(split_rpath(rest[..line_end].trim()))
        }
    }
}

async fn write_rpath(binary: &Path, tool: RpathTool, entries: &[String]) -> Result<(), ProvisionError> {
    let tool_path = locate_tool(tool).await?;
    let joined = entries.join(":");

    let output = match tool {
        RpathTool::Patchelf => {
            Command::new(&tool_path)
                .arg("--set-rpath")
                .arg(&joined)
                .arg(binary)
                .output()
                .await
        }
        RpathTool::Chrpath => {
            Command::new(&tool_path)
                .arg("-r")
                .arg(&joined)
                .arg(binary)
                .output()
                .await
        }
    }
    .map_err(|e| ProvisionError::Archive(format!("failed to spawn {}: {e}", tool_binary_name(tool))))?;

    if !output.status.success() {
        return Err(ProvisionError::Archive(format!(
            "{} failed on {}: {}",
            tool_binary_name(tool),
            binary.display(),
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

fn split_rpath(raw: &str) -> Vec<String> {
    if raw.is_empty() {
        Vec::new()
    } else {
        raw.split(':').map(str::to_string).collect()
    }
}
