//! CLI surface for the build provisioner: argument parsing and the
//! `ProvisionedBuild` -> environment translation.
//!
//! The original publishes every field directly into the worker process's own
//! environment, since provisioning and fuzzing run in the same long-lived
//! interpreter. This binary is a separate process per invocation, so instead
//! it prints `KEY=VALUE` lines to stdout for the caller to `source` or
//! `eval` -- the same shape, adapted to a process boundary the original
//! never had.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use provisioner_core::ProvisionedBuild;

/// Build provisioner for fuzzing worker fleets.
#[derive(Debug, Parser)]
#[command(name = "provisioner")]
#[command(author, version, about = "Materializes fuzzing job builds on local disk")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Provision a build for this job.
    Provision {
        #[command(subcommand)]
        target: ProvisionTarget,
    },
}

#[derive(Debug, Subcommand)]
pub enum ProvisionTarget {
    /// Resolve and build the latest revision common to every configured bucket path.
    Trunk,
    /// Build a specific, already-known revision.
    Revision {
        /// The revision to provision.
        revision: i64,
    },
    /// Fetch a custom binary (`CUSTOM_BINARY` / `CUSTOM_BUILDS_BUCKET`).
    Custom,
    /// Build the symbolized release/debug pair at a specific revision.
    Symbolized {
        /// The revision to provision.
        revision: i64,
    },
}

/// Render a [`ProvisionedBuild`] as `KEY=VALUE` lines, one per populated
/// field, matching the environment-variable names the original publishes.
pub fn render_env_lines(build: &ProvisionedBuild) -> Vec<String> {
    let mut lines = vec![
        format!("BUILD_DIR={}", build.build_dir.display()),
        format!("REVISION={}", build.revision),
        format!("FUZZ_TARGETS={}", build.fuzz_targets.join(",")),
    ];

    push_optional(&mut lines, "BUILD_URL", build.build_url.as_deref());
    push_optional(&mut lines, "BUILD_KEY", build.build_key.as_deref());
    push_optional_path(&mut lines, "APP_PATH", build.app_path.as_deref());
    push_optional_path(&mut lines, "APP_DIR", build.app_dir.as_deref());
    push_optional_path(&mut lines, "APP_PATH_DEBUG", build.app_path_debug.as_deref());
    push_optional_path(&mut lines, "GN_ARGS_PATH", build.gn_args_path.as_deref());
    push_optional_path(&mut lines, "LLVM_SYMBOLIZER_PATH", build.symbolizer_path.as_deref());
    push_optional(&mut lines, "FUCHSIA_INSTANCE_HANDLE", build.fuchsia_instance_handle.as_deref());

    lines
}

fn push_optional(lines: &mut Vec<String>, key: &str, value: Option<&str>) {
    if let Some(value) = value {
        lines.push(format!("{key}={value}"));
    }
}

fn push_optional_path(lines: &mut Vec<String>, key: &str, value: Option<&std::path::Path>) {
    if let Some(value) = value {
        lines.push(format!("{key}={}", value.display()));
    }
}

/// Root directory passed to the local object/blob stores that back archive
/// acquisition, when the `upload` feature's S3 backend isn't in play.
/// `OBJECT_STORE_ROOT` defaults to the current directory, matching an
/// operator running the CLI from wherever upstream archives are mirrored.
pub fn object_store_root() -> PathBuf {
    std::env::var("OBJECT_STORE_ROOT").map_or_else(|_| PathBuf::from("."), PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use provisioner_schema::Revision;

    fn empty_build() -> ProvisionedBuild {
        ProvisionedBuild {
            build_dir: PathBuf::from("/builds/job/revisions"),
            revision: Revision::new(42),
            fuzz_targets: vec!["fuzzer_a".to_string(), "fuzzer_b".to_string()],
            build_url: None,
            build_key: None,
            app_path: None,
            app_dir: None,
            app_path_debug: None,
            gn_args_path: None,
            symbolizer_path: None,
            fuchsia_instance_handle: None,
        }
    }

    #[test]
    fn render_env_lines_always_includes_the_required_fields() {
        let build = empty_build();
        let lines = render_env_lines(&build);

        assert!(lines.contains(&"BUILD_DIR=/builds/job/revisions".to_string()));
        assert!(lines.contains(&"REVISION=42".to_string()));
        assert!(lines.contains(&"FUZZ_TARGETS=fuzzer_a,fuzzer_b".to_string()));
    }

    #[test]
    fn render_env_lines_omits_absent_optional_fields() {
        let build = empty_build();
        let lines = render_env_lines(&build);

        assert!(!lines.iter().any(|l| l.starts_with("APP_PATH=")));
        assert!(!lines.iter().any(|l| l.starts_with("BUILD_URL=")));
    }

    #[test]
    fn render_env_lines_includes_populated_optional_fields() {
        let mut build = empty_build();
        build.app_path = Some(PathBuf::from("/builds/job/revisions/my_app"));
        build.build_url = Some("gs://bucket/build-42.zip".to_string());

        let lines = render_env_lines(&build);
        assert!(lines.contains(&"APP_PATH=/builds/job/revisions/my_app".to_string()));
        assert!(lines.contains(&"BUILD_URL=gs://bucket/build-42.zip".to_string()));
    }
}
