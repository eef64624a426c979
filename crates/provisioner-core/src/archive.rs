//! Archive format detection and the [`ArchiveHandle`] contract.
//!
//! An open archive handle answers three questions regardless of how it was
//! obtained: what fuzz targets does it contain, how many bytes would a given
//! target (or everything) occupy once extracted, and how do you actually
//! extract it. Two concrete handles exist: [`LocalArchiveHandle`] opens a
//! file already on disk; [`HttpRangeArchiveHandle`] streams a zip's central
//! directory over HTTP range requests without ever downloading the whole
//! thing, for the `ALLOW_UNPACK_OVER_HTTP` path.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use provisioner_schema::ProvisionError;

/// Recognized archive container formats. `RawBinary` covers the custom-build
/// case where the fetched object is a single executable, not an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// `.zip`.
    Zip,
    /// `.tar.gz` / `.tgz`.
    TarGz,
    /// `.tar.zst` / `.tzst`.
    TarZst,
    /// Plain `.tar`.
    Tar,
    /// Anything else: treated as a single binary, not unpacked.
    RawBinary,
}

/// Detect archive format from a file path or URL's extension.
pub fn detect_format(name_or_url: &str) -> ArchiveFormat {
    let lower = name_or_url.to_lowercase();
    if lower.ends_with(".tar.zst") || lower.ends_with(".tzst") {
        ArchiveFormat::TarZst
    } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
        ArchiveFormat::TarGz
    } else if lower.ends_with(".tar") {
        ArchiveFormat::Tar
    } else if lower.ends_with(".zip") {
        ArchiveFormat::Zip
    } else {
        ArchiveFormat::RawBinary
    }
}

/// Whether `format` can be opened for lazy, random-access reads (i.e. the
/// central directory can be read without a linear scan of the whole
/// stream). Only zip qualifies; tar-family formats require reading entries
/// in order, so they are never stream-compatible.
pub fn supports_random_access(format: ArchiveFormat) -> bool {
    matches!(format, ArchiveFormat::Zip)
}

/// Contract required from an open archive, whether it was downloaded to
/// local disk or is being read lazily over HTTP.
#[async_trait]
pub trait ArchiveHandle: Send {
    /// Normalized fuzz target names found in the archive, without
    /// extracting anything.
    async fn list_fuzz_targets(&mut self) -> Result<Vec<String>, ProvisionError>;

    /// Total extracted byte count, optionally restricted to the files
    /// needed for one target.
    async fn unpacked_size(&mut self, fuzz_target: Option<&str>) -> Result<u64, ProvisionError>;

    /// Extract into `build_dir`. `trusted = false` additionally validates
    /// every entry's resolved path stays within `build_dir` (zip-slip
    /// check); custom binaries fetched from the blob store are extracted
    /// with `trusted = true` since their provenance is the job's own config.
    async fn unpack(
        &mut self,
        build_dir: &Path,
        fuzz_target: Option<&str>,
        trusted: bool,
    ) -> Result<(), ProvisionError>;
}

/// An [`ArchiveHandle`] over a file already present on local disk.
pub struct LocalArchiveHandle {
    path: PathBuf,
    format: ArchiveFormat,
}

impl LocalArchiveHandle {
    /// Open `path`, sniffing its format from the filename.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let format = detect_format(&path.to_string_lossy());
        Self { path, format }
    }
}

#[async_trait]
impl ArchiveHandle for LocalArchiveHandle {
    async fn list_fuzz_targets(&mut self) -> Result<Vec<String>, ProvisionError> {
        let path = self.path.clone();
        let format = self.format;
        tokio::task::spawn_blocking(move || list_fuzz_targets_blocking(&path, format))
            .await
            .map_err(|e| ProvisionError::Archive(format!("list task panicked: {e}")))?
    }

    async fn unpacked_size(&mut self, fuzz_target: Option<&str>) -> Result<u64, ProvisionError> {
        let path = self.path.clone();
        let format = self.format;
        let fuzz_target = fuzz_target.map(str::to_string);
        tokio::task::spawn_blocking(move || unpacked_size_blocking(&path, format, fuzz_target.as_deref()))
            .await
            .map_err(|e| ProvisionError::Archive(format!("size task panicked: {e}")))?
    }

    async fn unpack(&mut self, build_dir: &Path, fuzz_target: Option<&str>, trusted: bool) -> Result<(), ProvisionError> {
        let path = self.path.clone();
        let format = self.format;
        let build_dir = build_dir.to_path_buf();
        let fuzz_target = fuzz_target.map(str::to_string);
        tokio::task::spawn_blocking(move || {
            unpack_blocking(&path, format, &build_dir, fuzz_target.as_deref(), trusted)
        })
        .await
        .map_err(|e| ProvisionError::Archive(format!("unpack task panicked: {e}")))?
    }
}

/// A normalized fuzz-target name is the base name (no directory components,
/// no known non-target filenames) before any `@variant` suffix already
/// present on disk. Entries named after well-known support files are never
/// targets.
pub(crate) fn is_plausible_target_name(name: &str) -> bool {
    if name.is_empty() || name.starts_with('.') {
        return false;
    }
    !matches!(name, "args.gn" | "targets.list" | "REVISION")
        && !name.ends_with(".so")
        && !name.ends_with(".json")
        && !name.ends_with(".txt")
}

fn list_fuzz_targets_blocking(path: &Path, format: ArchiveFormat) -> Result<Vec<String>, ProvisionError> {
    let mut targets = Vec::new();
    for_each_top_level_executable(path, format, |name| {
        if is_plausible_target_name(name) {
            targets.push(name.to_string());
        }
    })?;
    targets.sort();
    targets.dedup();
    Ok(targets)
}

fn unpacked_size_blocking(path: &Path, format: ArchiveFormat, fuzz_target: Option<&str>) -> Result<u64, ProvisionError> {
    let mut total = 0u64;
    for_each_entry(path, format, |entry_name, size| {
        if fuzz_target.is_none_or(|t| entry_name == t || entry_name.starts_with(&format!("{t}."))) {
            total += size;
        }
    })?;
    Ok(total)
}

fn for_each_top_level_executable(
    path: &Path,
    format: ArchiveFormat,
    mut f: impl FnMut(&str),
) -> Result<(), ProvisionError> {
    match format {
        ArchiveFormat::Zip => {
            let file = File::open(path).map_err(ProvisionError::Io)?;
            let mut archive = zip::ZipArchive::new(file).map_err(|e| ProvisionError::Archive(e.to_string()))?;
            for i in 0..archive.len() {
                let entry = archive.by_index(i).map_err(|e| ProvisionError::Archive(e.to_string()))?;
                if entry.is_dir() {
                    continue;
                }
                let is_exec = entry.unix_mode().is_none_or(|m| m & 0o111 != 0);
                let Some(enclosed) = entry.enclosed_name() else { continue };
                if enclosed.components().count() == 1 && is_exec {
                    f(&enclosed.to_string_lossy());
                }
            }
        }
        ArchiveFormat::TarGz | ArchiveFormat::TarZst | ArchiveFormat::Tar => {
            with_tar_reader(path, format, |mut archive| {
                for entry in archive.entries().map_err(|e| ProvisionError::Archive(e.to_string()))? {
                    let entry = entry.map_err(|e| ProvisionError::Archive(e.to_string()))?;
                    if entry.header().entry_type().is_dir() {
                        continue;
                    }
                    let is_exec = entry.header().mode().map(|m| m & 0o111 != 0).unwrap_or(false);
                    let entry_path = entry.path().map_err(|e| ProvisionError::Archive(e.to_string()))?;
                    if entry_path.components().count() == 1 && is_exec {
                        f(&entry_path.to_string_lossy());
                    }
                }
                Ok(())
            })?;
        }
        ArchiveFormat::RawBinary => {
            if let Some(name) = path.file_name() {
                f(&name.to_string_lossy());
            }
        }
    }
    Ok(())
}

fn for_each_entry(path: &Path, format: ArchiveFormat, mut f: impl FnMut(&str, u64)) -> Result<(), ProvisionError> {
    match format {
        ArchiveFormat::Zip => {
            let file = File::open(path).map_err(ProvisionError::Io)?;
            let mut archive = zip::ZipArchive::new(file).map_err(|e| ProvisionError::Archive(e.to_string()))?;
            for i in 0..archive.len() {
                let entry = archive.by_index(i).map_err(|e| ProvisionError::Archive(e.to_string()))?;
                if entry.is_dir() {
                    continue;
                }
                let Some(enclosed) = entry.enclosed_name() else { continue };
                let top = enclosed.components().next().map(|c| c.as_os_str().to_string_lossy().to_string());
                f(top.as_deref().unwrap_or_default(), entry.size());
            }
        }
        ArchiveFormat::TarGz | ArchiveFormat::TarZst | ArchiveFormat::Tar => {
            with_tar_reader(path, format, |mut archive| {
                for entry in archive.entries().map_err(|e| ProvisionError::Archive(e.to_string()))? {
                    let entry = entry.map_err(|e| ProvisionError::Archive(e.to_string()))?;
                    if entry.header().entry_type().is_dir() {
                        continue;
                    }
                    let entry_path = entry.path().map_err(|e| ProvisionError::Archive(e.to_string()))?;
                    let top = entry_path.components().next().map(|c| c.as_os_str().to_string_lossy().to_string());
                    let size = entry.header().size().unwrap_or(0);
                    f(top.as_deref().unwrap_or_default(), size);
                }
                Ok(())
            })?;
        }
        ArchiveFormat::RawBinary => {
            let size = std::fs::metadata(path).map_err(ProvisionError::Io)?.len();
            if let Some(name) = path.file_name() {
                f(&name.to_string_lossy(), size);
            }
        }
    }
    Ok(())
}

fn with_tar_reader(
    path: &Path,
    format: ArchiveFormat,
    f: impl FnOnce(tar::Archive<Box<dyn Read>>) -> Result<(), ProvisionError>,
) -> Result<(), ProvisionError> {
    let file = File::open(path).map_err(ProvisionError::Io)?;
    let reader = BufReader::new(file);
    let boxed: Box<dyn Read> = match format {
        ArchiveFormat::TarGz => Box::new(flate2::read::GzDecoder::new(reader)),
        ArchiveFormat::TarZst => {
            Box::new(zstd::stream::Decoder::new(reader).map_err(ProvisionError::Io)?)
        }
        ArchiveFormat::Tar => Box::new(reader),
        ArchiveFormat::Zip | ArchiveFormat::RawBinary => unreachable!("caller filters by format"),
    };
    f(tar::Archive::new(boxed))
}

fn unpack_blocking(
    path: &Path,
    format: ArchiveFormat,
    build_dir: &Path,
    fuzz_target: Option<&str>,
    trusted: bool,
) -> Result<(), ProvisionError> {
    std::fs::create_dir_all(build_dir).map_err(ProvisionError::Io)?;

    match format {
        ArchiveFormat::Zip => unpack_zip(path, build_dir, fuzz_target, trusted),
        ArchiveFormat::TarGz | ArchiveFormat::TarZst | ArchiveFormat::Tar => {
            with_tar_reader(path, format, |mut archive| unpack_tar(&mut archive, build_dir, fuzz_target, trusted))
        }
        ArchiveFormat::RawBinary => {
            let name = path.file_name().ok_or_else(|| ProvisionError::Archive("archive path has no filename".into()))?;
            std::fs::copy(path, build_dir.join(name)).map_err(ProvisionError::Io)?;
            Ok(())
        }
    }
}

fn entry_wanted(entry_path: &Path, fuzz_target: Option<&str>) -> bool {
    match fuzz_target {
        None => true,
        Some(target) => entry_path
            .components()
            .next()
            .map(|c| {
                let top = c.as_os_str().to_string_lossy();
                top == target || top.starts_with(&format!("{target}."))
            })
            .unwrap_or(false),
    }
}

fn checked_join(build_dir: &Path, relative: &Path) -> Result<PathBuf, ProvisionError> {
    let joined = build_dir.join(relative);
    if !joined.starts_with(build_dir) {
        return Err(ProvisionError::Archive(format!(
            "path traversal in archive entry: {}",
            relative.display()
        )));
    }
    Ok(joined)
}

fn unpack_zip(path: &Path, build_dir: &Path, fuzz_target: Option<&str>, trusted: bool) -> Result<(), ProvisionError> {
    let file = File::open(path).map_err(ProvisionError::Io)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| ProvisionError::Archive(e.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| ProvisionError::Archive(e.to_string()))?;
        let Some(relative) = entry.enclosed_name() else { continue };

        if !entry_wanted(&relative, fuzz_target) {
            continue;
        }

        let absolute = if trusted {
            build_dir.join(&relative)
        } else {
            checked_join(build_dir, &relative)?
        };

        if entry.is_dir() {
            std::fs::create_dir_all(&absolute).map_err(ProvisionError::Io)?;
            continue;
        }
        if let Some(parent) = absolute.parent() {
            std::fs::create_dir_all(parent).map_err(ProvisionError::Io)?;
        }

        let mut out = File::create(&absolute).map_err(ProvisionError::Io)?;
        io::copy(&mut entry, &mut out).map_err(ProvisionError::Io)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&absolute, std::fs::Permissions::from_mode(mode)).map_err(ProvisionError::Io)?;
        }
    }
    Ok(())
}

fn unpack_tar<R: Read>(
    archive: &mut tar::Archive<R>,
    build_dir: &Path,
    fuzz_target: Option<&str>,
    trusted: bool,
) -> Result<(), ProvisionError> {
    for entry in archive.entries().map_err(|e| ProvisionError::Archive(e.to_string()))? {
        let mut entry = entry.map_err(|e| ProvisionError::Archive(e.to_string()))?;
        if entry.header().entry_type().is_dir() {
            continue;
        }
        let relative: PathBuf = entry.path().map_err(|e| ProvisionError::Archive(e.to_string()))?.into_owned();

        if !entry_wanted(&relative, fuzz_target) {
            continue;
        }

        let absolute = if trusted { build_dir.join(&relative) } else { checked_join(build_dir, &relative)? };
        if let Some(parent) = absolute.parent() {
            std::fs::create_dir_all(parent).map_err(ProvisionError::Io)?;
        }
        entry.unpack(&absolute).map_err(ProvisionError::Io)?;
    }
    Ok(())
}

/// An open archive handle plus the local file it was downloaded to, if any.
///
/// Returned by [`acquire`]. `cleanup` must be called exactly once, on every
/// exit path (success or failure) after the handle is done being used, per
/// the acquisition contract that a locally downloaded archive is always
/// removed once unpacking has run.
pub struct AcquiredArchive {
    /// The open handle: local or HTTP-range, depending on which path [`acquire`] took.
    pub handle: Box<dyn ArchiveHandle>,
    local_path: Option<PathBuf>,
}

impl AcquiredArchive {
    /// Remove the locally downloaded archive file, if [`acquire`] downloaded
    /// one. A no-op when the archive was streamed directly over HTTP.
    pub fn cleanup(&self) {
        if let Some(path) = &self.local_path {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!(path = %path.display(), error = %e, "failed to remove downloaded archive file");
            }
        }
    }
}

/// Obtain a handle to `remote_url`, either by streaming it directly over
/// HTTP (when `allow_unpack_over_http` is set, `http_url` is given, and the
/// format supports random access) or by downloading it to
/// `<build_dir>/<basename(remote_url)>` after clearing disk budget for its
/// size. Mirrors §4.C of the component design: no disk budgeting occurs on
/// the streaming path since nothing touches local disk.
#[allow(clippy::too_many_arguments)]
pub async fn acquire(
    object_store: &dyn crate::object_store::ObjectStore,
    http_client: &reqwest::Client,
    allow_unpack_over_http: bool,
    build_dir: &Path,
    remote_url: &str,
    http_url: Option<&str>,
    builds_root: &Path,
    current_build_dir: &Path,
    min_free: u64,
) -> Result<AcquiredArchive, ProvisionError> {
    if allow_unpack_over_http {
        if let Some(http_url) = http_url {
            if let Some(probe) = probe_stream_compatible(http_client, http_url).await? {
                tracing::info!(http_url, content_length = probe.content_length, "streaming archive directly over HTTP");
                return Ok(AcquiredArchive {
                    handle: Box::new(HttpRangeArchiveHandle::new(http_url.to_string(), probe.content_length)),
                    local_path: None,
                });
            }
        }
    }

    let size = object_store.get_object_size(remote_url).await?;
    crate::disk_budget::make_space(builds_root, size, Some(current_build_dir), min_free).await?;

    let basename = remote_url.rsplit('/').next().unwrap_or(remote_url);
    let local_path = build_dir.join(basename);
    tracing::info!(remote_url, local_path = %local_path.display(), size, "downloading archive");
    object_store.copy_file_from(remote_url, &local_path).await?;

    Ok(AcquiredArchive { handle: Box::new(LocalArchiveHandle::open(&local_path)), local_path: Some(local_path) })
}

/// Result of probing whether an `http_url` supports the direct-streaming
/// path: the server answered HEAD successfully, advertised byte-range
/// support, and the sniffed format supports random access.
pub struct StreamProbe {
    /// Content-Length reported by the HEAD response.
    pub content_length: u64,
}

/// Probe `http_url` for direct-streaming eligibility: HEAD must succeed,
/// the server must advertise `Accept-Ranges: bytes`, and the sniffed format
/// must support random access (only zip, currently).
pub async fn probe_stream_compatible(
    client: &reqwest::Client,
    http_url: &str,
) -> Result<Option<StreamProbe>, ProvisionError> {
    if !supports_random_access(detect_format(http_url)) {
        return Ok(None);
    }

    let resp = client
        .head(http_url)
        .send()
        .await
        .map_err(|e| ProvisionError::Transport(format!("HEAD {http_url}: {e}")))?;

    if !resp.status().is_success() {
        return Ok(None);
    }

    let accepts_ranges = resp
        .headers()
        .get(reqwest::header::ACCEPT_RANGES)
        .is_some_and(|v| v.as_bytes() == b"bytes");
    if !accepts_ranges {
        return Ok(None);
    }

    let Some(content_length) = resp.content_length() else {
        return Ok(None);
    };

    Ok(Some(StreamProbe { content_length }))
}

/// A [`Read`] + [`Seek`] adapter over an HTTP resource accessed via `Range`
/// requests, letting the `zip` crate's central-directory reader work
/// without downloading the archive. Uses a blocking client because this
/// type is only ever driven from inside `spawn_blocking`.
struct HttpRangeReader {
    client: reqwest::blocking::Client,
    url: String,
    len: u64,
    pos: u64,
}

impl HttpRangeReader {
    fn new(url: String, len: u64) -> Self {
        Self { client: reqwest::blocking::Client::new(), url, len, pos: 0 }
    }
}

impl Read for HttpRangeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.len || buf.is_empty() {
            return Ok(0);
        }
        let end = (self.pos + buf.len() as u64 - 1).min(self.len - 1);
        let resp = self
            .client
            .get(&self.url)
            .header(reqwest::header::RANGE, format!("bytes={}-{end}", self.pos))
            .send()
            .map_err(io::Error::other)?;
        let bytes = resp.bytes().map_err(io::Error::other)?;
        let n = bytes.len();
        buf[..n].copy_from_slice(&bytes);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for HttpRangeReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = match pos {
            SeekFrom::Start(p) => p,
            SeekFrom::End(p) => (self.len as i64 + p).max(0) as u64,
            SeekFrom::Current(p) => (self.pos as i64 + p).max(0) as u64,
        };
        Ok(self.pos)
    }
}

/// An [`ArchiveHandle`] that reads a zip's central directory lazily over
/// HTTP range requests. No local download occurs; every operation issues
/// range requests on demand.
pub struct HttpRangeArchiveHandle {
    url: String,
    len: u64,
}

impl HttpRangeArchiveHandle {
    /// Build a handle for a zip known (via [`probe_stream_compatible`]) to
    /// support range reads.
    pub fn new(url: String, len: u64) -> Self {
        Self { url, len }
    }

    fn open_zip(&self) -> Result<zip::ZipArchive<HttpRangeReader>, ProvisionError> {
        let reader = HttpRangeReader::new(self.url.clone(), self.len);
        zip::ZipArchive::new(reader).map_err(|e| ProvisionError::Archive(e.to_string()))
    }
}

#[async_trait]
impl ArchiveHandle for HttpRangeArchiveHandle {
    async fn list_fuzz_targets(&mut self) -> Result<Vec<String>, ProvisionError> {
        let url = self.url.clone();
        let len = self.len;
        tokio::task::spawn_blocking(move || {
            let handle = HttpRangeArchiveHandle { url, len };
            let mut archive = handle.open_zip()?;
            let mut targets = Vec::new();
            for i in 0..archive.len() {
                let entry = archive.by_index(i).map_err(|e| ProvisionError::Archive(e.to_string()))?;
                if entry.is_dir() {
                    continue;
                }
                let is_exec = entry.unix_mode().is_none_or(|m| m & 0o111 != 0);
                let Some(enclosed) = entry.enclosed_name() else { continue };
                if enclosed.components().count() == 1 && is_exec && is_plausible_target_name(&enclosed.to_string_lossy()) {
                    targets.push(enclosed.to_string_lossy().to_string());
                }
            }
            targets.sort();
            targets.dedup();
            Ok(targets)
        })
        .await
        .map_err(|e| ProvisionError::Archive(format!("list task panicked: {e}")))?
    }

    async fn unpacked_size(&mut self, fuzz_target: Option<&str>) -> Result<u64, ProvisionError> {
        let url = self.url.clone();
        let len = self.len;
        let fuzz_target = fuzz_target.map(str::to_string);
        tokio::task::spawn_blocking(move || {
            let handle = HttpRangeArchiveHandle { url, len };
            let mut archive = handle.open_zip()?;
            let mut total = 0u64;
            for i in 0..archive.len() {
                let entry = archive.by_index(i).map_err(|e| ProvisionError::Archive(e.to_string()))?;
                if entry.is_dir() {
                    continue;
                }
                let Some(enclosed) = entry.enclosed_name() else { continue };
                if fuzz_target
                    .as_deref()
                    .is_none_or(|t| entry_wanted(&enclosed, Some(t)))
                {
                    total += entry.size();
                }
            }
            Ok(total)
        })
        .await
        .map_err(|e| ProvisionError::Archive(format!("size task panicked: {e}")))?
    }

    async fn unpack(&mut self, build_dir: &Path, fuzz_target: Option<&str>, trusted: bool) -> Result<(), ProvisionError> {
        let url = self.url.clone();
        let len = self.len;
        let build_dir = build_dir.to_path_buf();
        let fuzz_target = fuzz_target.map(str::to_string);
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&build_dir).map_err(ProvisionError::Io)?;
            let handle = HttpRangeArchiveHandle { url, len };
            let mut archive = handle.open_zip()?;

            for i in 0..archive.len() {
                let mut entry = archive.by_index(i).map_err(|e| ProvisionError::Archive(e.to_string()))?;
                let Some(relative) = entry.enclosed_name() else { continue };
                if !entry_wanted(&relative, fuzz_target.as_deref()) {
                    continue;
                }

                let absolute = if trusted { build_dir.join(&relative) } else { checked_join(&build_dir, &relative)? };
                if entry.is_dir() {
                    std::fs::create_dir_all(&absolute).map_err(ProvisionError::Io)?;
                    continue;
                }
                if let Some(parent) = absolute.parent() {
                    std::fs::create_dir_all(parent).map_err(ProvisionError::Io)?;
                }
                let mut out = File::create(&absolute).map_err(ProvisionError::Io)?;
                io::copy(&mut entry, &mut out).map_err(ProvisionError::Io)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| ProvisionError::Archive(format!("unpack task panicked: {e}")))?
    }
}
