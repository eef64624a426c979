//! Entry-point dispatch: selects a build variant from [`ProvisioningConfig`]
//! and runs it, publishing the materialized layout into [`ProvisionedBuild`].
//!
//! Selection order follows the original's precedence exactly: a configured
//! custom binary always wins, then a fuzz-target-scoped bucket path, then an
//! explicit numeric revision, and only then trunk discovery against the
//! release/symbolized-release/symbolized-debug bucket paths in that fixed
//! declared order.

use std::path::PathBuf;

use provisioner_schema::{BucketPath, ProvisionError, Revision};

use crate::build::{
    Build, CustomBuild, CustomSource, FuchsiaBuild, RegularBuild, SetupContext, SplitTargetBuild,
    SymbolizedBuild, SymbolizedHalf,
};
use crate::config::ProvisioningConfig;
use crate::resolver::{self, UrlListingCache};
use crate::targets;

/// The materialized result of one provisioning run, published into the
/// process environment by the CLI layer (never written to by anything in
/// this crate except the build variants and [`crate::env_publisher`]).
#[derive(Debug, Clone)]
pub struct ProvisionedBuild {
    /// The subtree this build was extracted into (`REVISION`/`.timestamp` live here).
    pub build_dir: PathBuf,
    /// The revision actually materialized.
    pub revision: Revision,
    /// Fuzz target names available in this build.
    pub fuzz_targets: Vec<String>,
    /// The upstream archive URL this build was extracted from, if any.
    pub build_url: Option<String>,
    /// The blob-store key this build was fetched from, for custom binaries.
    pub build_key: Option<String>,
    /// Path to the main executable, if found.
    pub app_path: Option<PathBuf>,
    /// Directory containing the main executable.
    pub app_dir: Option<PathBuf>,
    /// Path to the debug-slot executable, for symbolized builds.
    pub app_path_debug: Option<PathBuf>,
    /// Path to `args.gn`, if found.
    pub gn_args_path: Option<PathBuf>,
    /// Path to `llvm-symbolizer`, if found and not using the default.
    pub symbolizer_path: Option<PathBuf>,
    /// Opaque handle returned by a [`crate::build::FuchsiaOrchestrator`], for Fuchsia jobs.
    pub fuchsia_instance_handle: Option<String>,
}

/// Select and run the appropriate build variant for `config`, then apply any
/// configured extra overlay. This is the crate's single entry point; the CLI
/// binary's subcommands are thin wrappers that first validate their own
/// arguments (e.g. a `revision` subcommand parses its positional argument)
/// and then call into the relevant `setup_*` function below, or this one
/// when no explicit choice has been made.
pub async fn setup_build(ctx: &SetupContext<'_>) -> Result<ProvisionedBuild, ProvisionError> {
    let config = ctx.config;

    let mut build = if config.custom_binary.is_some() {
        setup_custom_binary(ctx).await?
    } else if config.fuzz_target_build_bucket_path.is_some() {
        setup_split_target_build(ctx).await?
    } else if let Some(revision) = config.revision {
        setup_regular_build(ctx, revision).await?
    } else {
        setup_trunk_build(ctx).await?
    };

    if let Some(overlay_bucket_path) = &config.extra_build_bucket_path {
        apply_extra_overlay(ctx, overlay_bucket_path, &mut build).await?;
    }

    Ok(build)
}

/// Resolve trunk (latest common revision across release + symbolized
/// release + symbolized debug, in that fixed order) and build a
/// [`RegularBuild`] against the release bucket path.
pub async fn setup_trunk_build(ctx: &SetupContext<'_>) -> Result<ProvisionedBuild, ProvisionError> {
    let config = ctx.config;
    let bucket_paths = trunk_bucket_paths(config);
    if bucket_paths.is_empty() {
        return Err(ProvisionError::Configuration(
            "no bucket path configured; cannot discover a trunk revision".into(),
        ));
    }

    let overridden: Vec<BucketPath> = bucket_paths.iter().map(|bp| config.apply_bucket_path_override(bp).clone()).collect();
    let revision = resolver::latest_revision(ctx.object_store, &overridden)
        .await?
        .ok_or_else(|| ProvisionError::NotFound("no revision common to every configured bucket path".into()))?;

    setup_regular_build(ctx, revision).await
}

fn trunk_bucket_paths(config: &ProvisioningConfig) -> Vec<BucketPath> {
    [
        config.release_build_bucket_path.clone(),
        config.sym_release_build_bucket_path.clone(),
        config.sym_debug_build_bucket_path.clone(),
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// Build (or reuse) the release build at an explicit `revision`, and, if
/// symbolized bucket paths are configured, the matching symbolized pair.
pub async fn setup_regular_build(ctx: &SetupContext<'_>, revision: Revision) -> Result<ProvisionedBuild, ProvisionError> {
    let config = ctx.config;

    if config.platform == provisioner_schema::Platform::Fuchsia {
        return setup_fuchsia_build(ctx, revision).await;
    }

    let Some(release_bucket_path) = &config.release_build_bucket_path else {
        return setup_symbolized_builds(ctx, revision).await;
    };
    let release_bucket_path = config.apply_bucket_path_override(release_bucket_path);

    let cache = UrlListingCache::with_disk_cache(config.build_urls_dir.clone());
    let urls = cache.get_or_list(ctx.object_store, release_bucket_path, &config.task_name, true).await?;
    let remote_url = resolver::find_url(&urls, revision)
        .ok_or_else(|| ProvisionError::NotFound(format!("revision {revision} not found under {release_bucket_path}")))?;

    let updated = ctx.object_store.updated(&remote_url).await.ok();
    let base_dir = resolver::local_dir(&config.builds_dir, Some(release_bucket_path), &config.job_name);

    let mut build = RegularBuild {
        base_dir,
        subtree_name: "revisions".to_string(),
        remote_url,
        http_url: None,
        requested_revision: revision,
        fuzz_target: config.fuzz_target.clone(),
        unpack_everything: config.unpack_all_fuzz_targets_and_files,
        updated,
    };

    build.setup(ctx).await
}

async fn setup_fuchsia_build(ctx: &SetupContext<'_>, revision: Revision) -> Result<ProvisionedBuild, ProvisionError> {
    let config = ctx.config;
    let release_bucket_path = config
        .release_build_bucket_path
        .as_ref()
        .ok_or_else(|| ProvisionError::Configuration("Fuchsia build requires RELEASE_BUILD_BUCKET_PATH".into()))?;
    let release_bucket_path = config.apply_bucket_path_override(release_bucket_path);

    let urls = resolver::list_urls(ctx.object_store, release_bucket_path, true).await?;
    let remote_url = resolver::find_url(&urls, revision)
        .ok_or_else(|| ProvisionError::NotFound(format!("revision {revision} not found under {release_bucket_path}")))?;

    let base_dir = resolver::local_dir(&config.builds_dir, Some(release_bucket_path), &config.job_name);
    let regular = RegularBuild {
        base_dir,
        subtree_name: "revisions".to_string(),
        remote_url,
        http_url: None,
        requested_revision: revision,
        fuzz_target: None,
        unpack_everything: true,
        updated: None,
    };

    let mut build = FuchsiaBuild::new(regular);
    build.setup(ctx).await
}

/// Build release and debug symbolized subtrees for `revision`, per
/// whichever of `SYM_RELEASE_BUILD_BUCKET_PATH` / `SYM_DEBUG_BUILD_BUCKET_PATH`
/// is configured.
pub async fn setup_symbolized_builds(ctx: &SetupContext<'_>, revision: Revision) -> Result<ProvisionedBuild, ProvisionError> {
    let config = ctx.config;

    let release = resolve_symbolized_half(ctx, config.sym_release_build_bucket_path.as_ref(), revision).await?;
    let debug = resolve_symbolized_half(ctx, config.sym_debug_build_bucket_path.as_ref(), revision).await?;

    let base_dir_source = config
        .sym_release_build_bucket_path
        .as_ref()
        .or(config.sym_debug_build_bucket_path.as_ref());
    let base_dir = resolver::local_dir(&config.builds_dir, base_dir_source, &config.job_name);

    let mut build = SymbolizedBuild { base_dir, release, debug, requested_revision: revision };
    build.setup(ctx).await
}

async fn resolve_symbolized_half(
    ctx: &SetupContext<'_>,
    bucket_path: Option<&BucketPath>,
    revision: Revision,
) -> Result<SymbolizedHalf, ProvisionError> {
    let Some(bucket_path) = bucket_path else {
        return Ok(SymbolizedHalf { remote_url: None, http_url: None });
    };
    let bucket_path = ctx.config.apply_bucket_path_override(bucket_path);
    let urls = resolver::list_urls(ctx.object_store, bucket_path, true).await?;
    let remote_url = resolver::find_url(&urls, revision);
    Ok(SymbolizedHalf { remote_url, http_url: None })
}

/// Build a split-target job: substitute `%TARGET%` in
/// `FUZZ_TARGET_BUILD_BUCKET_PATH` with `FUZZ_TARGET`, validate the target
/// is listed in the sibling `targets.list`, and build at the latest revision
/// present for that substituted path.
pub async fn setup_split_target_build(ctx: &SetupContext<'_>) -> Result<ProvisionedBuild, ProvisionError> {
    let config = ctx.config;
    let template = config
        .fuzz_target_build_bucket_path
        .as_ref()
        .ok_or_else(|| ProvisionError::Configuration("FUZZ_TARGET_BUILD_BUCKET_PATH not configured".into()))?;
    let fuzz_target = config
        .fuzz_target
        .as_ref()
        .ok_or_else(|| ProvisionError::Configuration("FUZZ_TARGET_BUILD_BUCKET_PATH requires FUZZ_TARGET".into()))?;

    let targets_list_path = crate::config::targets_list_path(template);
    let targets_list = targets::read_targets_list(&targets_list_path)?;
    let validated_target = targets::validate_requested_target(fuzz_target, &targets_list)?.to_string();

    let substituted = config.apply_bucket_path_override(template).with_target(&validated_target);

    let urls = resolver::list_urls(ctx.object_store, &substituted, true).await?;
    let revision = urls
        .first()
        .and_then(|e| e.revision)
        .ok_or_else(|| ProvisionError::NotFound(format!("no builds found under {substituted}")))?;
    let remote_url = resolver::find_url(&urls, revision)
        .ok_or_else(|| ProvisionError::NotFound(format!("revision {revision} disappeared from {substituted}")))?;

    let base_dir = resolver::local_dir(&config.builds_dir, Some(&substituted), &config.job_name);
    let target_build_prefix_dir = base_dir.join("revisions");

    let regular = RegularBuild {
        base_dir,
        subtree_name: "revisions".to_string(),
        remote_url,
        http_url: None,
        requested_revision: revision,
        fuzz_target: Some(validated_target),
        unpack_everything: false,
        updated: None,
    };

    let mut build = SplitTargetBuild { regular, targets_list, target_build_prefix_dir };
    build.setup(ctx).await
}

/// Build a custom binary job: `CUSTOM_BINARY` (blob store) takes precedence
/// over `CUSTOM_BUILDS_BUCKET` (secondary bucket by object name), matching
/// the original's precedence when both happen to be configured.
pub async fn setup_custom_binary(ctx: &SetupContext<'_>) -> Result<ProvisionedBuild, ProvisionError> {
    let config = ctx.config;
    let key = config
        .custom_binary
        .as_ref()
        .ok_or_else(|| ProvisionError::Configuration("CUSTOM_BINARY not configured".into()))?;

    let source = if let Some(bucket) = &config.custom_builds_bucket {
        CustomSource::Bucket { url: format!("{bucket}/{key}") }
    } else {
        CustomSource::Blob { key: key.clone() }
    };

    let base_dir = resolver::local_dir(&config.builds_dir, None, &config.job_name);
    let mut build = CustomBuild { base_dir, source, revision: None };
    build.setup(ctx).await
}

async fn apply_extra_overlay(
    ctx: &SetupContext<'_>,
    overlay_bucket_path: &BucketPath,
    build: &mut ProvisionedBuild,
) -> Result<(), ProvisionError> {
    let overlay_bucket_path = ctx.config.apply_bucket_path_override(overlay_bucket_path);
    let urls = resolver::list_urls(ctx.object_store, overlay_bucket_path, true).await?;
    let revision = urls
        .first()
        .and_then(|e| e.revision)
        .ok_or_else(|| ProvisionError::NotFound(format!("no builds found under extra overlay path {overlay_bucket_path}")))?;
    let remote_url = resolver::find_url(&urls, revision)
        .ok_or_else(|| ProvisionError::NotFound(format!("revision {revision} disappeared from {overlay_bucket_path}")))?;

    crate::build::setup_extra_overlay(ctx, &build.build_dir, overlay_bucket_path, remote_url, None, revision).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NullMetricsSink;
    use crate::object_store::{LocalBlobStore, LocalObjectStore};
    use provisioner_schema::Platform;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_test_zip(path: &std::path::Path, entries: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default().unix_permissions(0o755);
        for (name, contents) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(contents).unwrap();
        }
        writer.finish().unwrap();
    }

    fn bare_config(builds_dir: &std::path::Path, root_dir: &std::path::Path) -> ProvisioningConfig {
        ProvisioningConfig {
            job_name: "job".into(),
            builds_dir: builds_dir.to_path_buf(),
            build_urls_dir: builds_dir.join("urls"),
            root_dir: root_dir.to_path_buf(),
            app_name: Some("my_app".into()),
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
            use_default_llvm_symbolizer: true,
            task_name: "task".into(),
            custom_builds_bucket: None,
            platform: Platform::Linux,
            chromium_profile: false,
            min_free_disk_space_override: Some(0),
            bucket_path_overrides: Default::default(),
            instrumented_library_paths: Vec::new(),
            symbolic_links: Default::default(),
        }
    }

    #[tokio::test]
    async fn setup_regular_build_resolves_explicit_revision() {
        let remote = tempdir().unwrap();
        std::fs::create_dir_all(remote.path().join("b")).unwrap();
        write_test_zip(&remote.path().join("b/build-42.zip"), &[("my_app", b"bin")]);

        let builds = tempdir().unwrap();
        let root = tempdir().unwrap();
        let mut config = bare_config(builds.path(), root.path());
        config.release_build_bucket_path = Some(BucketPath::parse("gs://x/b/build-([0-9]+).zip").unwrap());

        let store = LocalObjectStore::new(remote.path());
        let blob_store = LocalBlobStore::new(remote.path());
        let client = reqwest::Client::new();
        let metrics = NullMetricsSink;
        let ctx = SetupContext { config: &config, object_store: &store, blob_store: &blob_store, http_client: &client, metrics: &metrics, fuchsia: None };

        let build = setup_regular_build(&ctx, Revision::new(42)).await.unwrap();
        assert_eq!(build.revision, Revision::new(42));
        assert!(build.app_path.is_some());
    }

    #[tokio::test]
    async fn setup_regular_build_errors_on_missing_revision() {
        let remote = tempdir().unwrap();
        std::fs::create_dir_all(remote.path().join("b")).unwrap();
        write_test_zip(&remote.path().join("b/build-42.zip"), &[("my_app", b"bin")]);

        let builds = tempdir().unwrap();
        let root = tempdir().unwrap();
        let mut config = bare_config(builds.path(), root.path());
        config.release_build_bucket_path = Some(BucketPath::parse("gs://x/b/build-([0-9]+).zip").unwrap());

        let store = LocalObjectStore::new(remote.path());
        let blob_store = LocalBlobStore::new(remote.path());
        let client = reqwest::Client::new();
        let metrics = NullMetricsSink;
        let ctx = SetupContext { config: &config, object_store: &store, blob_store: &blob_store, http_client: &client, metrics: &metrics, fuchsia: None };

        let result = setup_regular_build(&ctx, Revision::new(99)).await;
        assert!(matches!(result, Err(ProvisionError::NotFound(_))));
    }

    #[tokio::test]
    async fn setup_trunk_build_picks_common_revision_across_bucket_paths() {
        let remote = tempdir().unwrap();
        std::fs::create_dir_all(remote.path().join("release")).unwrap();
        std::fs::create_dir_all(remote.path().join("sym_release")).unwrap();
        write_test_zip(&remote.path().join("release/build-41.zip"), &[("my_app", b"bin")]);
        write_test_zip(&remote.path().join("release/build-42.zip"), &[("my_app", b"bin")]);
        write_test_zip(&remote.path().join("sym_release/build-41.zip"), &[("my_app", b"bin")]);

        let builds = tempdir().unwrap();
        let root = tempdir().unwrap();
        let mut config = bare_config(builds.path(), root.path());
        config.release_build_bucket_path = Some(BucketPath::parse("gs://x/release/build-([0-9]+).zip").unwrap());
        config.sym_release_build_bucket_path = Some(BucketPath::parse("gs://x/sym_release/build-([0-9]+).zip").unwrap());

        let store = LocalObjectStore::new(remote.path());
        let blob_store = LocalBlobStore::new(remote.path());
        let client = reqwest::Client::new();
        let metrics = NullMetricsSink;
        let ctx = SetupContext { config: &config, object_store: &store, blob_store: &blob_store, http_client: &client, metrics: &metrics, fuchsia: None };

        let build = setup_trunk_build(&ctx).await.unwrap();
        assert_eq!(build.revision, Revision::new(41));
    }

    #[tokio::test]
    async fn setup_split_target_build_rejects_unlisted_target() {
        let remote = tempdir().unwrap();
        std::fs::create_dir_all(remote.path().join("project")).unwrap();
        std::fs::write(remote.path().join("project/targets.list"), "fuzzer_a\n").unwrap();

        let builds = tempdir().unwrap();
        let root = tempdir().unwrap();
        let mut config = bare_config(builds.path(), root.path());
        config.fuzz_target_build_bucket_path = Some(BucketPath::parse("gs://x/project/%TARGET%/build-([0-9]+).zip").unwrap());
        config.fuzz_target = Some("fuzzer_unknown".into());

        let store = LocalObjectStore::new(remote.path());
        let blob_store = LocalBlobStore::new(remote.path());
        let client = reqwest::Client::new();
        let metrics = NullMetricsSink;
        let ctx = SetupContext { config: &config, object_store: &store, blob_store: &blob_store, http_client: &client, metrics: &metrics, fuchsia: None };

        let result = setup_split_target_build(&ctx).await;
        assert!(matches!(result, Err(ProvisionError::NotFound(_))));
    }

    #[tokio::test]
    async fn setup_custom_binary_prefers_blob_store_over_bucket() {
        let remote = tempdir().unwrap();
        write_test_zip(&remote.path().join("abc123"), &[("custom_app", b"bin")]);

        let builds = tempdir().unwrap();
        let root = tempdir().unwrap();
        let mut config = bare_config(builds.path(), root.path());
        config.custom_binary = Some("abc123".into());

        let store = LocalObjectStore::new(remote.path());
        let blob_store = LocalBlobStore::new(remote.path());
        let client = reqwest::Client::new();
        let metrics = NullMetricsSink;
        let ctx = SetupContext { config: &config, object_store: &store, blob_store: &blob_store, http_client: &client, metrics: &metrics, fuchsia: None };

        let build = setup_custom_binary(&ctx).await.unwrap();
        assert_eq!(build.build_key, Some("abc123".into()));
    }

    #[tokio::test]
    async fn setup_build_dispatches_to_custom_binary_when_configured() {
        let remote = tempdir().unwrap();
        write_test_zip(&remote.path().join("abc123"), &[("custom_app", b"bin")]);

        let builds = tempdir().unwrap();
        let root = tempdir().unwrap();
        let mut config = bare_config(builds.path(), root.path());
        config.custom_binary = Some("abc123".into());
        config.release_build_bucket_path = Some(BucketPath::parse("gs://x/release/build-([0-9]+).zip").unwrap());

        let store = LocalObjectStore::new(remote.path());
        let blob_store = LocalBlobStore::new(remote.path());
        let client = reqwest::Client::new();
        let metrics = NullMetricsSink;
        let ctx = SetupContext { config: &config, object_store: &store, blob_store: &blob_store, http_client: &client, metrics: &metrics, fuchsia: None };

        let build = setup_build(&ctx).await.unwrap();
        assert_eq!(build.build_key, Some("abc123".into()));
    }
}
