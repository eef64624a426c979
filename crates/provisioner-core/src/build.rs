//! The five build variants and the seven-phase pipeline they share.
//!
//! Dynamic dispatch in the original (`Build` → `Regular` → `{SplitTarget,
//! Fuchsia}`, plus sibling `Symbolized` and `Custom`) becomes a `Build`
//! trait implemented by five concrete structs; each overrides only the
//! extraction step and whatever post-setup hook it needs, while phases 1
//! (pre-setup), 2 (existence check), 3 (space + extraction), 4 (partial
//! marking), and 5 (revision write) live in [`setup_archive_subtree`], the
//! one routine every archive-backed variant calls into.

use std::path::{Path, PathBuf};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use provisioner_schema::{sentinel, BucketPath, Revision, SentinelState};

use provisioner_schema::ProvisionError;

use crate::archive::{self, ArchiveFormat};
use crate::config::ProvisioningConfig;
use crate::dispatch::ProvisionedBuild;
use crate::env_publisher::{self, AppPathSlot};
use crate::metrics::{BuildType, MetricsSink, RetrievalStep};
use crate::object_store::{BlobStore, ObjectStore};
use crate::rpath;
use crate::UNPACK_TIME_LIMIT_SECS;

/// External orchestrator for Fuchsia-class builds: terminates any stale
/// instance and starts a fresh one against a freshly unpacked build, and
/// enumerates the fuzz targets it manages (the original's replacement for
/// a plain directory walk on this platform).
#[async_trait]
pub trait FuchsiaOrchestrator: Send + Sync {
    /// Terminate a stale instance for `build_dir`, if any, and start a
    /// fresh one. Returns an opaque handle recorded as
    /// `FUCHSIA_INSTANCE_HANDLE`.
    async fn restart_instance(&self, build_dir: &Path) -> Result<String, ProvisionError>;

    /// Enumerate the fuzz targets the orchestrator knows about for `build_dir`.
    async fn list_fuzz_targets(&self, build_dir: &Path) -> Result<Vec<String>, ProvisionError>;
}

/// Every collaborator a build variant's `setup` needs, collected so
/// constructors don't grow an ever-longer parameter list.
pub struct SetupContext<'a> {
    /// Explicit, process-wide configuration (replaces the original's environment store).
    pub config: &'a ProvisioningConfig,
    /// Upstream object-store client.
    pub object_store: &'a dyn ObjectStore,
    /// Key/value blob store for custom binaries.
    pub blob_store: &'a dyn BlobStore,
    /// Used only for the HTTP-range streaming probe.
    pub http_client: &'a reqwest::Client,
    /// Build-retrieval metrics sink.
    pub metrics: &'a dyn MetricsSink,
    /// Present only on Fuchsia-class jobs.
    pub fuchsia: Option<&'a dyn FuchsiaOrchestrator>,
}

/// The capability set every build variant exposes, replacing the original's
/// `Base`/`Build` class hierarchy.
#[async_trait]
pub trait Build: Send {
    /// Materialize this build on local disk, running the seven-phase
    /// pipeline and returning the populated output struct.
    async fn setup(&mut self, ctx: &SetupContext<'_>) -> Result<ProvisionedBuild, ProvisionError>;

    /// The base directory this build lives under.
    fn base_dir(&self) -> &Path;

    /// Delete this build's entire base directory. Used by callers that
    /// want to explicitly discard a build outside of LRU eviction.
    fn delete(&self) -> Result<(), ProvisionError> {
        if self.base_dir().is_dir() {
            std::fs::remove_dir_all(self.base_dir()).map_err(ProvisionError::Io)?;
        }
        Ok(())
    }

    /// The `.timestamp` of this build's primary subtree, for LRU purposes.
    fn last_used_time(&self) -> f64;
}

/// Reset the working directory to `root_dir` (so the current directory
/// never blocks a directory delete on Windows-like platforms) and discard
/// the contents of the OS temp directory. Best-effort: failures to remove
/// individual temp entries are logged, not propagated, since other
/// processes may hold files there.
fn pre_setup(config: &ProvisioningConfig, base_dir: &Path) -> Result<(), ProvisionError> {
    std::fs::create_dir_all(&config.root_dir).map_err(ProvisionError::Io)?;
    std::env::set_current_dir(&config.root_dir).map_err(ProvisionError::Io)?;

    let tmp = std::env::temp_dir();
    if let Ok(entries) = std::fs::read_dir(&tmp) {
        for entry in entries.flatten() {
            let path = entry.path();
            let result = if path.is_dir() { std::fs::remove_dir_all(&path) } else { std::fs::remove_file(&path) };
            if let Err(e) = result {
                tracing::debug!(path = %path.display(), error = %e, "failed to clear temp entry");
            }
        }
    }

    for subtree in FIXED_SUBTREES {
        std::fs::create_dir_all(base_dir.join(subtree)).map_err(ProvisionError::Io)?;
    }
    Ok(())
}

const FIXED_SUBTREES: &[&str] = &["custom", "revisions", "symbolized", "symbolized/debug", "symbolized/release"];

/// Immediate top-level entries of `dir` that look like fuzz-target
/// binaries, for the existence-check path where the archive was never
/// opened and the target list must come from a directory walk instead.
fn walk_existing_targets(dir: &Path) -> Result<Vec<String>, ProvisionError> {
    let mut targets = Vec::new();
    if !dir.is_dir() {
        return Ok(targets);
    }
    for entry in std::fs::read_dir(dir).map_err(ProvisionError::Io)? {
        let entry = entry.map_err(ProvisionError::Io)?;
        let name = entry.file_name().to_string_lossy().to_string();
        if archive::is_plausible_target_name(&name) {
            targets.push(name);
        }
    }
    targets.sort();
    Ok(targets)
}

/// Everything [`setup_archive_subtree`] needs for one archive extraction
/// into one subtree.
pub(crate) struct SubtreeSetup<'a> {
    pub base_dir: &'a Path,
    pub subtree: &'a Path,
    pub remote_url: &'a str,
    pub http_url: Option<&'a str>,
    pub requested_revision: Revision,
    pub fuzz_target: Option<&'a str>,
    pub unpack_everything: bool,
    pub trusted: bool,
    pub build_type: BuildType,
    pub job_name: &'a str,
    pub platform_label: &'a str,
}

/// Outcome of extracting (or skipping extraction for) one subtree.
pub(crate) struct SubtreeOutcome {
    pub fuzz_targets: Vec<String>,
    pub skipped_extraction: bool,
}

/// Phases 2-5 of the shared pipeline for one archive-backed subtree:
/// existence check, space + extraction, partial-build marking, revision
/// write. Phase 1 (pre-setup) and phase 6/7 (publish, post-setup) are the
/// caller's responsibility since they operate over the whole build, not one
/// subtree.
pub(crate) async fn setup_archive_subtree(
    ctx: &SetupContext<'_>,
    params: SubtreeSetup<'_>,
) -> Result<SubtreeOutcome, ProvisionError> {
    if SentinelState::read(params.subtree) == SentinelState::Partial && params.subtree.is_dir() {
        std::fs::remove_dir_all(params.subtree)
            .map_err(|e| ProvisionError::Unrecoverable(format!("failed to clear partial subtree {}: {e}", params.subtree.display())))?;
    }

    if SentinelState::read(params.subtree).matches(params.requested_revision) {
        tracing::info!(subtree = %params.subtree.display(), revision = %params.requested_revision, "build already present, skipping extraction");
        let fuzz_targets = walk_existing_targets(params.subtree)?;
        return Ok(SubtreeOutcome { fuzz_targets, skipped_extraction: true });
    }

    if params.subtree.is_dir() {
        std::fs::remove_dir_all(params.subtree)
            .map_err(|e| ProvisionError::Unrecoverable(format!("failed to clear subtree {}: {e}", params.subtree.display())))?;
    }
    std::fs::create_dir_all(params.subtree).map_err(ProvisionError::Io)?;

    let download_start = Instant::now();
    let mut acquired = archive::acquire(
        ctx.object_store,
        ctx.http_client,
        ctx.config.allow_unpack_over_http,
        params.subtree,
        params.remote_url,
        params.http_url,
        &ctx.config.builds_dir,
        params.base_dir,
        ctx.config.min_free_disk_space(),
    )
    .await?;
    ctx.metrics.record_retrieval_time(params.job_name, params.platform_label, RetrievalStep::Download, params.build_type, download_start.elapsed());

    let (unpack_target, listed_targets) = if params.unpack_everything {
        (None, None)
    } else {
        let list_start = Instant::now();
        let listed = acquired.handle.list_fuzz_targets().await;
        ctx.metrics.record_retrieval_time(
            params.job_name,
            params.platform_label,
            RetrievalStep::ListFuzzTargets,
            params.build_type,
            list_start.elapsed(),
        );
        (params.fuzz_target, Some(listed?))
    };

    let unpack_start = Instant::now();
    let unpack_result = acquired.handle.unpack(params.subtree, unpack_target, params.trusted).await;
    let unpack_elapsed = unpack_start.elapsed();
    ctx.metrics.record_retrieval_time(params.job_name, params.platform_label, RetrievalStep::Unpack, params.build_type, unpack_elapsed);
    if unpack_elapsed.as_secs() > UNPACK_TIME_LIMIT_SECS {
        tracing::warn!(subtree = %params.subtree.display(), elapsed_secs = unpack_elapsed.as_secs(), "unpack exceeded the expected time limit");
    }

    acquired.cleanup();
    unpack_result?;

    let fuzz_targets = if params.unpack_everything {
        walk_existing_targets(params.subtree)?
    } else {
        // We never unpack the full archive in this branch, so the target list
        // has to come from the archive's own listing rather than a directory walk.
        listed_targets.unwrap_or_default()
    };

    if params.unpack_everything {
        sentinel::clear_partial_marker(params.subtree).map_err(ProvisionError::Io)?;
    } else {
        sentinel::write_partial_marker(params.subtree).map_err(ProvisionError::Io)?;
    }
    sentinel::write_revision_file(params.subtree, params.requested_revision).map_err(ProvisionError::Io)?;

    Ok(SubtreeOutcome { fuzz_targets, skipped_extraction: false })
}

/// Phase 7: update `.timestamp` and, if the host advertises instrumented
/// library paths, rewrite RPATHs on the app executable, its debug
/// companion, and every discovered fuzz target.
async fn post_setup(config: &ProvisioningConfig, subtree: &Path, build: &ProvisionedBuild) -> Result<(), ProvisionError> {
    sentinel::write_timestamp(subtree, unix_time_now()).map_err(ProvisionError::Io)?;

    if config.wants_rpath_patch() {
        let mut binaries: Vec<PathBuf> = Vec::new();
        binaries.extend(build.app_path.clone());
        binaries.extend(build.app_path_debug.clone());
        if let Some(dir) = &build.app_dir {
            for target in &build.fuzz_targets {
                binaries.push(dir.join(target));
            }
        }
        let binaries: Vec<PathBuf> = binaries.into_iter().filter(|p| p.is_file()).collect();
        rpath::patch_binaries(&binaries, &config.instrumented_library_paths).await?;
    }
    Ok(())
}

fn unix_time_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn empty_build(base_dir: &Path, revision: Revision) -> ProvisionedBuild {
    ProvisionedBuild {
        build_dir: base_dir.to_path_buf(),
        revision,
        fuzz_targets: Vec::new(),
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

fn publish_and_relink(
    config: &ProvisioningConfig,
    subtree: &Path,
    slot: AppPathSlot,
    prefix: &str,
    build: &mut ProvisionedBuild,
) -> Result<(), ProvisionError> {
    env_publisher::publish(
        &[subtree],
        config.app_name.as_deref(),
        config.use_default_llvm_symbolizer,
        config.platform,
        slot,
        build,
    )?;

    if let (Some(link), Some(app_dir)) = (config.symbolic_links.get(prefix), &build.app_dir) {
        env_publisher::relink_symbolic_link(link, app_dir)?;
    }
    Ok(())
}

/// A single archive at a known revision, unpacked into `revisions/` (or a
/// lowercased-prefix-named subtree when the bucket path carries one).
pub struct RegularBuild {
    /// Base directory owned by the job.
    pub base_dir: PathBuf,
    /// Subtree name under `base_dir` (`"revisions"` unless the bucket path prefix overrides it).
    pub subtree_name: String,
    /// The resolved remote archive URL.
    pub remote_url: String,
    /// HTTP-reachable mirror of `remote_url`, for the direct-streaming path.
    pub http_url: Option<String>,
    /// The revision this build is pinned to.
    pub requested_revision: Revision,
    /// Restrict extraction to this single target, unless `unpack_everything` is set.
    pub fuzz_target: Option<String>,
    /// Force a full extraction regardless of `fuzz_target`.
    pub unpack_everything: bool,
    /// Upstream last-modified time of `remote_url`, recorded for the build-age metric.
    pub updated: Option<DateTime<Utc>>,
}

impl RegularBuild {
    fn subtree(&self) -> PathBuf {
        self.base_dir.join(&self.subtree_name)
    }

    async fn run(&mut self, ctx: &SetupContext<'_>) -> Result<ProvisionedBuild, ProvisionError> {
        pre_setup(ctx.config, &self.base_dir)?;
        let subtree = self.subtree();

        let outcome = setup_archive_subtree(
            ctx,
            SubtreeSetup {
                base_dir: &self.base_dir,
                subtree: &subtree,
                remote_url: &self.remote_url,
                http_url: self.http_url.as_deref(),
                requested_revision: self.requested_revision,
                fuzz_target: self.fuzz_target.as_deref(),
                unpack_everything: self.unpack_everything,
                trusted: false,
                build_type: BuildType::Release,
                job_name: &ctx.config.job_name,
                platform_label: &ctx.config.platform.to_string(),
            },
        )
        .await?;

        let mut build = empty_build(&subtree, self.requested_revision);
        build.fuzz_targets = outcome.fuzz_targets;
        build.build_url = Some(self.remote_url.clone());

        publish_and_relink(ctx.config, &subtree, AppPathSlot::Release, "", &mut build)?;
        post_setup(ctx.config, &subtree, &build).await?;

        ctx.metrics.record_build_revision(&ctx.config.job_name, &ctx.config.platform.to_string(), self.requested_revision.value());
        if let Some(updated) = self.updated {
            let age_hours = (Utc::now() - updated).num_minutes() as f64 / 60.0;
            ctx.metrics.record_build_age(&ctx.config.job_name, &ctx.config.platform.to_string(), age_hours.max(0.0));
        }

        Ok(build)
    }
}

#[async_trait]
impl Build for RegularBuild {
    async fn setup(&mut self, ctx: &SetupContext<'_>) -> Result<ProvisionedBuild, ProvisionError> {
        self.run(ctx).await
    }

    fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn last_used_time(&self) -> f64 {
        sentinel::read_timestamp(&self.subtree())
    }
}

/// A [`RegularBuild`] whose bucket path was derived by substituting
/// `%TARGET%`, with its fuzz-target list replaced post-setup by the
/// intersection of `targets.list` and the target-build prefix's directory
/// listing.
pub struct SplitTargetBuild {
    /// The underlying regular build against the target-substituted bucket path.
    pub regular: RegularBuild,
    /// Every target name listed in `targets.list`.
    pub targets_list: Vec<String>,
    /// Directory whose immediate subdirectories enumerate targets actually built.
    pub target_build_prefix_dir: PathBuf,
}

#[async_trait]
impl Build for SplitTargetBuild {
    async fn setup(&mut self, ctx: &SetupContext<'_>) -> Result<ProvisionedBuild, ProvisionError> {
        let mut build = self.regular.run(ctx).await?;
        build.fuzz_targets = crate::targets::filter_available_targets(&self.targets_list, &self.target_build_prefix_dir)?;
        Ok(build)
    }

    fn base_dir(&self) -> &Path {
        self.regular.base_dir()
    }

    fn last_used_time(&self) -> f64 {
        self.regular.last_used_time()
    }
}

/// A [`RegularBuild`] that always unpacks everything and, after extraction,
/// asks an external orchestrator to restart the Fuchsia instance and
/// enumerate its fuzz targets rather than walking the directory.
pub struct FuchsiaBuild {
    /// The underlying regular build; `unpack_everything` is forced on by [`FuchsiaBuild::new`].
    pub regular: RegularBuild,
}

impl FuchsiaBuild {
    /// Wrap `regular`, forcing full extraction as Fuchsia requires.
    pub fn new(mut regular: RegularBuild) -> Self {
        regular.unpack_everything = true;
        Self { regular }
    }
}

#[async_trait]
impl Build for FuchsiaBuild {
    async fn setup(&mut self, ctx: &SetupContext<'_>) -> Result<ProvisionedBuild, ProvisionError> {
        let mut build = self.regular.run(ctx).await?;
        let orchestrator = ctx
            .fuchsia
            .ok_or_else(|| ProvisionError::Configuration("Fuchsia build requires a configured orchestrator".into()))?;

        let handle = orchestrator.restart_instance(&build.build_dir).await?;
        build.fuchsia_instance_handle = Some(handle);
        build.fuzz_targets = orchestrator.list_fuzz_targets(&build.build_dir).await?;
        Ok(build)
    }

    fn base_dir(&self) -> &Path {
        self.regular.base_dir()
    }

    fn last_used_time(&self) -> f64 {
        self.regular.last_used_time()
    }
}

/// One half (release or debug) of a symbolized build's archive source.
pub struct SymbolizedHalf {
    /// Resolved remote archive URL, absent when that half wasn't requested or resolved.
    pub remote_url: Option<String>,
    /// HTTP mirror of `remote_url`, for the direct-streaming path.
    pub http_url: Option<String>,
}

/// Zero, one, or two archives (release and/or debug) extracted into sibling
/// `symbolized/release/` and `symbolized/debug/` subtrees. Release is always
/// processed before debug; the second environment publish deliberately
/// overrides the shared fields the first one set (documented, not a bug).
pub struct SymbolizedBuild {
    /// Base directory owned by the job.
    pub base_dir: PathBuf,
    /// The release half.
    pub release: SymbolizedHalf,
    /// The debug half.
    pub debug: SymbolizedHalf,
    /// The revision both halves are pinned to.
    pub requested_revision: Revision,
}

#[async_trait]
impl Build for SymbolizedBuild {
    async fn setup(&mut self, ctx: &SetupContext<'_>) -> Result<ProvisionedBuild, ProvisionError> {
        if self.release.remote_url.is_none() && self.debug.remote_url.is_none() {
            return Err(ProvisionError::Configuration("symbolized build requires at least one of release/debug".into()));
        }

        pre_setup(ctx.config, &self.base_dir)?;
        let mut build = empty_build(&self.base_dir.join("symbolized"), self.requested_revision);

        if let Some(remote_url) = self.release.remote_url.clone() {
            let subtree = self.base_dir.join("symbolized/release");
            let outcome = setup_archive_subtree(
                ctx,
                SubtreeSetup {
                    base_dir: &self.base_dir,
                    subtree: &subtree,
                    remote_url: &remote_url,
                    http_url: self.release.http_url.as_deref(),
                    requested_revision: self.requested_revision,
                    fuzz_target: None,
                    unpack_everything: true,
                    trusted: false,
                    build_type: BuildType::Release,
                    job_name: &ctx.config.job_name,
                    platform_label: &ctx.config.platform.to_string(),
                },
            )
            .await?;

            build.fuzz_targets = outcome.fuzz_targets;
            build.build_url = Some(remote_url);
            build.build_dir = subtree.clone();
            publish_and_relink(ctx.config, &subtree, AppPathSlot::Release, "", &mut build)?;
            post_setup(ctx.config, &subtree, &build).await?;
        }

        if let Some(remote_url) = self.debug.remote_url.clone() {
            let subtree = self.base_dir.join("symbolized/debug");
            let outcome = setup_archive_subtree(
                ctx,
                SubtreeSetup {
                    base_dir: &self.base_dir,
                    subtree: &subtree,
                    remote_url: &remote_url,
                    http_url: self.debug.http_url.as_deref(),
                    requested_revision: self.requested_revision,
                    fuzz_target: None,
                    unpack_everything: true,
                    trusted: false,
                    build_type: BuildType::Debug,
                    job_name: &ctx.config.job_name,
                    platform_label: &ctx.config.platform.to_string(),
                },
            )
            .await?;

            if build.fuzz_targets.is_empty() {
                build.fuzz_targets = outcome.fuzz_targets;
            }
            // The debug publish deliberately overrides APP_DIR, GN_ARGS_PATH
            // and LLVM_SYMBOLIZER_PATH set by the release publish above; see
            // env_publisher's AppPathSlot doc and §9's resolved open question.
            publish_and_relink(ctx.config, &subtree, AppPathSlot::Debug, "APP_PATH_DEBUG", &mut build)?;
            post_setup(ctx.config, &subtree, &build).await?;
        }

        ctx.metrics.record_build_revision(&ctx.config.job_name, &ctx.config.platform.to_string(), self.requested_revision.value());
        Ok(build)
    }

    fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn last_used_time(&self) -> f64 {
        let release = sentinel::read_timestamp(&self.base_dir.join("symbolized/release"));
        let debug = sentinel::read_timestamp(&self.base_dir.join("symbolized/debug"));
        release.max(debug)
    }
}

/// Where a custom binary is fetched from: a secondary bucket addressed by
/// object key, or the blob store addressed by opaque key.
pub enum CustomSource {
    /// Fetched from `custom_builds.bucket` by object key.
    Bucket {
        /// Object URL within the secondary bucket.
        url: String,
    },
    /// Fetched from the blob store by opaque key.
    Blob {
        /// Opaque blob-store key (the `CUSTOM_BINARY` value).
        key: String,
    },
}

/// Either an archive or a single binary fetched by opaque key or secondary
/// bucket object, unpacked (if recognized as an archive) into `custom/`.
/// Revision bookkeeping follows [`SentinelState`]'s "needs update" read
/// rather than the inline existence check every other variant uses.
pub struct CustomBuild {
    /// Base directory owned by the job.
    pub base_dir: PathBuf,
    /// Where to fetch the binary from.
    pub source: CustomSource,
    /// Revision to record once fetched, if known (custom binaries are
    /// frequently unversioned; absent means `REVISION` is left untouched).
    pub revision: Option<Revision>,
}

impl CustomBuild {
    fn subtree(&self) -> PathBuf {
        self.base_dir.join("custom")
    }
}

#[async_trait]
impl Build for CustomBuild {
    async fn setup(&mut self, ctx: &SetupContext<'_>) -> Result<ProvisionedBuild, ProvisionError> {
        pre_setup(ctx.config, &self.base_dir)?;
        let subtree = self.subtree();

        let needs_update = match self.revision {
            Some(r) => !SentinelState::read(&subtree).matches(r),
            None => true,
        };

        let mut build = empty_build(&subtree, self.revision.unwrap_or(Revision::new(0)));
        let mut build_key = None;

        if needs_update {
            std::fs::create_dir_all(&subtree).map_err(ProvisionError::Io)?;
            let download_start = Instant::now();

            let local_path = match &self.source {
                CustomSource::Bucket { url } => {
                    let basename = url.rsplit('/').next().unwrap_or(url);
                    let dest = subtree.join(basename);
                    ctx.object_store.copy_file_from(url, &dest).await?;
                    build.build_url = Some(url.clone());
                    dest
                }
                CustomSource::Blob { key } => {
                    let dest = subtree.join("custom_binary");
                    let found = ctx.blob_store.read_blob_to_disk(key, &dest).await?;
                    if !found {
                        return Err(ProvisionError::NotFound(format!("custom binary blob '{key}' not found")));
                    }
                    build_key = Some(key.clone());
                    dest
                }
            };

            if archive::detect_format(&local_path.to_string_lossy()) != ArchiveFormat::RawBinary {
                let mut handle = crate::archive::LocalArchiveHandle::open(&local_path);
                handle.unpack(&subtree, None, true).await?;
                let _ = std::fs::remove_file(&local_path);
            }

            ctx.metrics.record_retrieval_time(
                &ctx.config.job_name,
                &ctx.config.platform.to_string(),
                RetrievalStep::Download,
                BuildType::Release,
                download_start.elapsed(),
            );

            if let Some(revision) = self.revision {
                sentinel::write_revision_file(&subtree, revision).map_err(ProvisionError::Io)?;
            }
        } else {
            build.fuzz_targets = walk_existing_targets(&subtree)?;
        }

        build.build_key = build_key;
        publish_and_relink(ctx.config, &subtree, AppPathSlot::Release, "", &mut build)?;
        post_setup(ctx.config, &subtree, &build).await?;
        Ok(build)
    }

    fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn last_used_time(&self) -> f64 {
        sentinel::read_timestamp(&self.subtree())
    }
}

/// Construct and run a second [`RegularBuild`] rooted at `primary_build_dir`
/// (the first build's own `build_dir`) under the fixed `EXTRA_BUILD_DIR`
/// prefix, per §4.D's "extra overlays". Failure of the overlay fails the
/// whole provisioning run, by design.
pub async fn setup_extra_overlay(
    ctx: &SetupContext<'_>,
    primary_build_dir: &Path,
    bucket_path: &BucketPath,
    remote_url: String,
    http_url: Option<String>,
    revision: Revision,
) -> Result<ProvisionedBuild, ProvisionError> {
    let _ = bucket_path;
    let mut overlay = RegularBuild {
        base_dir: primary_build_dir.to_path_buf(),
        subtree_name: crate::config::EXTRA_BUILD_DIR.to_lowercase(),
        remote_url,
        http_url,
        requested_revision: revision,
        fuzz_target: None,
        unpack_everything: true,
        updated: None,
    };
    overlay.setup(ctx).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NullMetricsSink;
    use crate::object_store::{LocalBlobStore, LocalObjectStore};
    use provisioner_schema::Platform;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_test_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default().unix_permissions(0o755);
        for (name, contents) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(contents).unwrap();
        }
        writer.finish().unwrap();
    }

    fn bare_config(builds_dir: &Path, root_dir: &Path) -> ProvisioningConfig {
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
    async fn regular_build_unpacks_and_publishes_app_path() {
        let remote = tempdir().unwrap();
        std::fs::create_dir_all(remote.path().join("bucket")).unwrap();
        write_test_zip(&remote.path().join("bucket/build-42.zip"), &[("my_app", b"binary")]);

        let builds = tempdir().unwrap();
        let root = tempdir().unwrap();
        let config = bare_config(builds.path(), root.path());
        let store = LocalObjectStore::new(remote.path());
        let blob_store = LocalBlobStore::new(remote.path());
        let client = reqwest::Client::new();
        let metrics = NullMetricsSink;

        let ctx = SetupContext {
            config: &config,
            object_store: &store,
            blob_store: &blob_store,
            http_client: &client,
            metrics: &metrics,
            fuchsia: None,
        };

        let mut build = RegularBuild {
            base_dir: builds.path().join("job_base"),
            subtree_name: "revisions".into(),
            remote_url: "bucket/build-42.zip".into(),
            http_url: None,
            requested_revision: Revision::new(42),
            fuzz_target: None,
            unpack_everything: true,
            updated: None,
        };

        let result = build.setup(&ctx).await.unwrap();
        assert_eq!(result.revision, Revision::new(42));
        assert!(result.app_path.is_some());
        assert_eq!(
            std::fs::read_to_string(builds.path().join("job_base/revisions/REVISION")).unwrap(),
            "42"
        );
    }

    #[tokio::test]
    async fn regular_build_skips_extraction_when_revision_already_present() {
        let remote = tempdir().unwrap();
        let builds = tempdir().unwrap();
        let root = tempdir().unwrap();
        let config = bare_config(builds.path(), root.path());
        let store = LocalObjectStore::new(remote.path());
        let blob_store = LocalBlobStore::new(remote.path());
        let client = reqwest::Client::new();
        let metrics = NullMetricsSink;

        let subtree = builds.path().join("job_base/revisions");
        std::fs::create_dir_all(&subtree).unwrap();
        sentinel::write_revision_file(&subtree, Revision::new(42)).unwrap();
        std::fs::write(subtree.join("my_app"), b"already-here").unwrap();

        let ctx = SetupContext {
            config: &config,
            object_store: &store,
            blob_store: &blob_store,
            http_client: &client,
            metrics: &metrics,
            fuchsia: None,
        };

        let mut build = RegularBuild {
            base_dir: builds.path().join("job_base"),
            subtree_name: "revisions".into(),
            remote_url: "bucket/build-42.zip".into(),
            http_url: None,
            requested_revision: Revision::new(42),
            fuzz_target: None,
            unpack_everything: true,
            updated: None,
        };

        let result = build.setup(&ctx).await.unwrap();
        assert_eq!(result.fuzz_targets, vec!["my_app".to_string()]);
    }

    #[tokio::test]
    async fn single_target_unpack_writes_partial_marker() {
        let remote = tempdir().unwrap();
        std::fs::create_dir_all(remote.path().join("bucket")).unwrap();
        write_test_zip(
            &remote.path().join("bucket/build-1.zip"),
            &[("fuzzer_a", b"aaa"), ("fuzzer_b", b"bbb")],
        );

        let builds = tempdir().unwrap();
        let root = tempdir().unwrap();
        let config = bare_config(builds.path(), root.path());
        let store = LocalObjectStore::new(remote.path());
        let blob_store = LocalBlobStore::new(remote.path());
        let client = reqwest::Client::new();
        let metrics = NullMetricsSink;

        let ctx = SetupContext {
            config: &config,
            object_store: &store,
            blob_store: &blob_store,
            http_client: &client,
            metrics: &metrics,
            fuchsia: None,
        };

        let mut build = RegularBuild {
            base_dir: builds.path().join("job_base"),
            subtree_name: "revisions".into(),
            remote_url: "bucket/build-1.zip".into(),
            http_url: None,
            requested_revision: Revision::new(1),
            fuzz_target: Some("fuzzer_a".into()),
            unpack_everything: false,
            updated: None,
        };

        let result = build.setup(&ctx).await.unwrap();
        let subtree = builds.path().join("job_base/revisions");
        assert!(subtree.join(".partial_build").is_file());
        assert!(subtree.join("fuzzer_a").exists());
        assert!(!subtree.join("fuzzer_b").exists());

        // The reported fuzz-target list comes from the archive's own listing,
        // not just the one target actually unpacked -- we never open the
        // archive again later to discover `fuzzer_b` by any other means.
        let mut targets = result.fuzz_targets.clone();
        targets.sort();
        assert_eq!(targets, vec!["fuzzer_a".to_string(), "fuzzer_b".to_string()]);
    }

    #[tokio::test]
    async fn symbolized_build_with_only_release_leaves_debug_empty() {
        let remote = tempdir().unwrap();
        std::fs::create_dir_all(remote.path().join("bucket")).unwrap();
        write_test_zip(&remote.path().join("bucket/release-9.zip"), &[("my_app", b"release-bin")]);

        let builds = tempdir().unwrap();
        let root = tempdir().unwrap();
        let config = bare_config(builds.path(), root.path());
        let store = LocalObjectStore::new(remote.path());
        let blob_store = LocalBlobStore::new(remote.path());
        let client = reqwest::Client::new();
        let metrics = NullMetricsSink;

        let ctx = SetupContext {
            config: &config,
            object_store: &store,
            blob_store: &blob_store,
            http_client: &client,
            metrics: &metrics,
            fuchsia: None,
        };

        let mut build = SymbolizedBuild {
            base_dir: builds.path().join("job_base"),
            release: SymbolizedHalf { remote_url: Some("bucket/release-9.zip".into()), http_url: None },
            debug: SymbolizedHalf { remote_url: None, http_url: None },
            requested_revision: Revision::new(9),
        };

        let result = build.setup(&ctx).await.unwrap();
        assert!(builds.path().join("job_base/symbolized/release/REVISION").is_file());
        assert!(!builds.path().join("job_base/symbolized/debug/REVISION").is_file());
        assert!(result.app_path.is_some());
        assert!(result.app_path_debug.is_none());
    }

    #[tokio::test]
    async fn symbolized_build_fails_when_both_halves_absent() {
        let builds = tempdir().unwrap();
        let root = tempdir().unwrap();
        let config = bare_config(builds.path(), root.path());
        let store = LocalObjectStore::new(builds.path());
        let blob_store = LocalBlobStore::new(builds.path());
        let client = reqwest::Client::new();
        let metrics = NullMetricsSink;

        let ctx = SetupContext {
            config: &config,
            object_store: &store,
            blob_store: &blob_store,
            http_client: &client,
            metrics: &metrics,
            fuchsia: None,
        };

        let mut build = SymbolizedBuild {
            base_dir: builds.path().join("job_base"),
            release: SymbolizedHalf { remote_url: None, http_url: None },
            debug: SymbolizedHalf { remote_url: None, http_url: None },
            requested_revision: Revision::new(9),
        };

        let result = build.setup(&ctx).await;
        assert!(matches!(result, Err(ProvisionError::Configuration(_))));
    }

    #[tokio::test]
    async fn custom_build_from_blob_store_unpacks_archive() {
        let remote = tempdir().unwrap();
        write_test_zip(&remote.path().join("abc123"), &[("custom_app", b"bin")]);

        let builds = tempdir().unwrap();
        let root = tempdir().unwrap();
        let config = bare_config(builds.path(), root.path());
        let store = LocalObjectStore::new(remote.path());
        let blob_store = LocalBlobStore::new(remote.path());
        let client = reqwest::Client::new();
        let metrics = NullMetricsSink;

        let ctx = SetupContext {
            config: &config,
            object_store: &store,
            blob_store: &blob_store,
            http_client: &client,
            metrics: &metrics,
            fuchsia: None,
        };

        let mut build = CustomBuild {
            base_dir: builds.path().join("job_base"),
            source: CustomSource::Blob { key: "abc123".into() },
            revision: None,
        };

        let result = build.setup(&ctx).await.unwrap();
        assert!(result.app_path.is_some());
        assert_eq!(result.build_key, Some("abc123".into()));
    }

    #[tokio::test]
    async fn custom_build_reports_missing_blob() {
        let remote = tempdir().unwrap();
        let builds = tempdir().unwrap();
        let root = tempdir().unwrap();
        let config = bare_config(builds.path(), root.path());
        let store = LocalObjectStore::new(remote.path());
        let blob_store = LocalBlobStore::new(remote.path());
        let client = reqwest::Client::new();
        let metrics = NullMetricsSink;

        let ctx = SetupContext {
            config: &config,
            object_store: &store,
            blob_store: &blob_store,
            http_client: &client,
            metrics: &metrics,
            fuchsia: None,
        };

        let mut build = CustomBuild { base_dir: builds.path().join("job_base"), source: CustomSource::Blob { key: "missing".into() }, revision: None };

        let result = build.setup(&ctx).await;
        assert!(matches!(result, Err(ProvisionError::NotFound(_))));
    }
}
