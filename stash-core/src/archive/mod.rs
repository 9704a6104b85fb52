/*!
Directory tree ↔ tar stream codec.

[`Archiver::create`] walks a root directory in filesystem order and writes a
tar stream (GNU headers) through the configured [`StreamCompression`]. When a
[`PermissionProvider`] is attached, each directory and regular file carrying a
descriptor is preceded by a PAX extended header whose `STASH.acl` record holds
the base64-encoded descriptor.

[`Archiver::extract`] is the inverse. Entries that would land outside the
destination are skipped, as are entry types other than directories, regular
files and symbolic links.

Only an inaccessible root or a failing output stream aborts an archive run;
per-entry problems are logged and counted in [`ArchiveStats::skipped`].
*/

pub mod filter;
pub mod permissions;

pub use filter::{IncludeFilter, Inclusion};
pub use permissions::{platform_permissions, NoPermissions, PermissionProvider};

use crate::compression::StreamCompression;
use crate::{Result, StashError};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Serialize;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tar::{Builder, EntryType, Header, HeaderMode};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// PAX record key carrying the base64 permission descriptor
pub const ACL_PAX_KEY: &str = "STASH.acl";

/// Counters reported by [`Archiver::create`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveStats {
    /// Regular files written
    pub files: u64,
    /// File content bytes written (before compression)
    pub bytes: u64,
    pub directories: u64,
    pub links: u64,
    /// Entries left out because they could not be read
    pub skipped: u64,
}

/// Counters reported by [`Archiver::extract`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExtractStats {
    /// Entries recreated on disk, of any type
    pub entries: u64,
    pub files: u64,
    pub bytes: u64,
    pub skipped: u64,
}

/// Receives per-file progress from archive runs.
///
/// Calls come from the blocking thread doing the archive work, and runs for
/// different labels may interleave when paths are processed concurrently.
pub trait ProgressReporter: Send + Sync {
    /// `done` regular files processed for `label`, out of `total` when known
    fn advance(&self, label: &str, done: u64, total: Option<u64>);

    fn finish(&self, label: &str, done: u64);
}

#[derive(Clone)]
struct Progress {
    reporter: Arc<dyn ProgressReporter>,
    label: String,
}

/// Encodes directory trees into tar streams and back.
#[derive(Clone, Default)]
pub struct Archiver {
    compression: StreamCompression,
    permissions: Option<Arc<dyn PermissionProvider>>,
    progress: Option<Progress>,
}

impl fmt::Debug for Archiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Archiver")
            .field("compression", &self.compression)
            .field("permissions", &self.permissions.as_ref().map(|p| p.name()))
            .field("progress", &self.progress.as_ref().map(|p| p.label.as_str()))
            .finish()
    }
}

impl Archiver {
    pub fn new(compression: StreamCompression) -> Self {
        Self {
            compression,
            permissions: None,
            progress: None,
        }
    }

    /// Capture descriptors on create and apply them on extract
    pub fn with_permissions(mut self, provider: Arc<dyn PermissionProvider>) -> Self {
        self.permissions = Some(provider);
        self
    }

    /// Report processed files to `reporter` under `label`. Creating an
    /// archive then walks the tree once more up front to count files.
    pub fn with_progress(
        mut self,
        reporter: Arc<dyn ProgressReporter>,
        label: impl Into<String>,
    ) -> Self {
        self.progress = Some(Progress {
            reporter,
            label: label.into(),
        });
        self
    }

    pub fn compression(&self) -> StreamCompression {
        self.compression
    }

    /// Write an archive of `root` to `writer`.
    ///
    /// # Errors
    /// [`StashError::SourceUnavailable`] if `root` is missing or unreadable,
    /// [`StashError::Io`] if writing the output fails.
    pub fn create<W: Write>(
        &self,
        writer: W,
        root: &Path,
        filter: &IncludeFilter,
    ) -> Result<ArchiveStats> {
        let root_meta = fs::metadata(root).map_err(|e| StashError::SourceUnavailable {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?;
        if !root_meta.is_dir() {
            return Err(StashError::SourceUnavailable {
                path: root.to_path_buf(),
                reason: "not a directory".to_string(),
            });
        }

        let total = self.progress.as_ref().map(|_| count_files(root, filter));
        let mut builder = Builder::new(self.compression.encoder(writer));
        let mut stats = ArchiveStats::default();
        let mut walker = WalkDir::new(root).follow_links(false).into_iter();

        while let Some(next) = walker.next() {
            let entry = match next {
                Ok(entry) => entry,
                Err(err) if err.depth() == 0 => {
                    return Err(StashError::SourceUnavailable {
                        path: root.to_path_buf(),
                        reason: err.to_string(),
                    });
                }
                Err(err) => {
                    warn!(error = %err, "Skipping unreadable entry");
                    stats.skipped += 1;
                    continue;
                }
            };

            let relative = relative_path(root, entry.path());
            let name = archive_name(&relative);
            let is_dir = entry.file_type().is_dir();

            match filter.classify(&name, is_dir) {
                Inclusion::Archive => {}
                Inclusion::Traverse => continue,
                Inclusion::Skip => {
                    if is_dir {
                        walker.skip_current_dir();
                    }
                    continue;
                }
            }

            let files_before = stats.files;
            self.append_entry(&mut builder, entry.path(), &relative, &mut stats)?;
            if stats.files > files_before {
                self.report(stats.files, total);
            }
        }

        let encoder = builder.into_inner()?;
        encoder.finish()?.flush()?;
        self.report_finished(stats.files);

        debug!(
            root = %root.display(),
            files = stats.files,
            bytes = stats.bytes,
            skipped = stats.skipped,
            "Archive written"
        );
        Ok(stats)
    }

    /// Append one walked entry. Source-side failures are counted as skipped;
    /// only output failures propagate.
    fn append_entry<W: Write>(
        &self,
        builder: &mut Builder<W>,
        path: &Path,
        relative: &Path,
        stats: &mut ArchiveStats,
    ) -> Result<()> {
        let meta = match fs::symlink_metadata(path) {
            Ok(meta) => meta,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Skipping entry without metadata");
                stats.skipped += 1;
                return Ok(());
            }
        };

        let mut header = Header::new_gnu();
        header.set_metadata_in_mode(&meta, HeaderMode::Complete);
        let file_type = meta.file_type();

        if file_type.is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            self.append_descriptor(builder, path)?;
            builder.append_data(&mut header, relative, io::empty())?;
            stats.directories += 1;
        } else if file_type.is_file() {
            let file = match File::open(path) {
                Ok(file) => file,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Skipping unreadable file");
                    stats.skipped += 1;
                    return Ok(());
                }
            };
            let len = meta.len();
            header.set_size(len);
            self.append_descriptor(builder, path)?;
            // Pad with zeros if the file shrinks while it is being read
            let data = file.take(len).chain(io::repeat(0)).take(len);
            builder.append_data(&mut header, relative, data)?;
            stats.files += 1;
            stats.bytes += len;
        } else if file_type.is_symlink() {
            let target = match fs::read_link(path) {
                Ok(target) => target,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Skipping unreadable link");
                    stats.skipped += 1;
                    return Ok(());
                }
            };
            header.set_size(0);
            builder.append_link(&mut header, relative, &target)?;
            stats.links += 1;
        } else {
            warn!(path = %path.display(), "Skipping special file");
            stats.skipped += 1;
        }
        Ok(())
    }

    fn append_descriptor<W: Write>(&self, builder: &mut Builder<W>, path: &Path) -> Result<()> {
        let Some(provider) = &self.permissions else {
            return Ok(());
        };
        match provider.descriptor(path) {
            Ok(Some(descriptor)) => {
                let encoded = BASE64.encode(descriptor);
                builder.append_pax_extensions([(ACL_PAX_KEY, encoded.as_bytes())])?;
            }
            Ok(None) => {}
            Err(err) => warn!(
                path = %path.display(),
                error = %err,
                "Failed to read permission descriptor"
            ),
        }
        Ok(())
    }

    /// Recreate the tree stored in `reader` under `dest`.
    ///
    /// # Errors
    /// Fails on a corrupt or truncated stream or when `dest` cannot be
    /// created; individual entries that cannot be written are skipped.
    pub fn extract<R: Read>(&self, reader: R, dest: &Path) -> Result<ExtractStats> {
        fs::create_dir_all(dest)?;
        let dest_root = dest.canonicalize()?;

        let mut archive = tar::Archive::new(self.compression.decoder(reader));
        let mut stats = ExtractStats::default();
        let mut directories = Vec::new();

        for entry in archive
            .entries()
            .map_err(|e| StashError::archive(format!("Failed to read archive: {e}")))?
        {
            let mut entry =
                entry.map_err(|e| StashError::archive(format!("Corrupt archive entry: {e}")))?;
            let entry_type = entry.header().entry_type();
            let entry_path = entry.path()?.into_owned();

            if !matches!(
                entry_type,
                EntryType::Directory | EntryType::Regular | EntryType::Symlink
            ) {
                warn!(path = %entry_path.display(), ?entry_type, "Skipping unsupported entry type");
                stats.skipped += 1;
                continue;
            }

            let Some(relative) = sanitize(&entry_path) else {
                warn!(path = %entry_path.display(), "Skipping entry outside destination");
                stats.skipped += 1;
                continue;
            };
            let target = if relative.as_os_str().is_empty() {
                dest_root.clone()
            } else {
                dest_root.join(&relative)
            };

            if target != dest_root {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                    if !parent.canonicalize()?.starts_with(&dest_root) {
                        warn!(
                            path = %entry_path.display(),
                            "Skipping entry behind a link leaving destination"
                        );
                        stats.skipped += 1;
                        continue;
                    }
                }
            }

            let descriptor = self.descriptor_of(&mut entry);
            let size = entry.header().size().unwrap_or(0);

            if entry_type == EntryType::Directory {
                if fs::symlink_metadata(&target).is_ok_and(|meta| meta.file_type().is_symlink()) {
                    warn!(path = %entry_path.display(), "Skipping directory entry over a link");
                    stats.skipped += 1;
                    continue;
                }
                if let Err(err) = fs::create_dir_all(&target) {
                    warn!(path = %target.display(), error = %err, "Failed to restore directory");
                    stats.skipped += 1;
                    continue;
                }
                directories.push(PendingDirectory {
                    path: target,
                    mode: entry.header().mode().ok(),
                    mtime: entry.header().mtime().ok(),
                    descriptor,
                });
                stats.entries += 1;
                continue;
            }

            if let Err(err) = entry.unpack(&target) {
                warn!(path = %target.display(), error = %err, "Failed to restore entry");
                stats.skipped += 1;
                continue;
            }

            if let (Some(provider), Some(descriptor)) = (&self.permissions, descriptor) {
                if let Err(err) = provider.apply(&target, &descriptor) {
                    warn!(
                        path = %target.display(),
                        error = %err,
                        "Failed to apply permission descriptor"
                    );
                }
            }

            stats.entries += 1;
            if entry_type == EntryType::Regular {
                stats.files += 1;
                stats.bytes += size;
                self.report(stats.files, None);
            }
        }

        self.report_finished(stats.files);

        // Children first, so a read-only directory is sealed only once filled
        for directory in directories.iter().rev() {
            self.finish_directory(directory);
        }

        debug!(
            dest = %dest.display(),
            entries = stats.entries,
            skipped = stats.skipped,
            "Archive extracted"
        );
        Ok(stats)
    }

    fn report(&self, done: u64, total: Option<u64>) {
        if let Some(progress) = &self.progress {
            progress.reporter.advance(&progress.label, done, total);
        }
    }

    fn report_finished(&self, done: u64) {
        if let Some(progress) = &self.progress {
            progress.reporter.finish(&progress.label, done);
        }
    }

    fn finish_directory(&self, directory: &PendingDirectory) {
        let path = &directory.path;
        if let Some(mtime) = directory.mtime {
            let modified = UNIX_EPOCH + Duration::from_secs(mtime);
            if let Err(err) = File::open(path).and_then(|dir| dir.set_modified(modified)) {
                debug!(path = %path.display(), error = %err, "Could not restore directory mtime");
            }
        }

        if let (Some(provider), Some(descriptor)) = (&self.permissions, &directory.descriptor) {
            if let Err(err) = provider.apply(path, descriptor) {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "Failed to apply permission descriptor"
                );
            }
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = directory.mode {
                let permissions = fs::Permissions::from_mode(mode & 0o7777);
                if let Err(err) = fs::set_permissions(path, permissions) {
                    warn!(path = %path.display(), error = %err, "Failed to restore directory mode");
                }
            }
        }
    }

    fn descriptor_of<R: Read>(&self, entry: &mut tar::Entry<'_, R>) -> Option<Vec<u8>> {
        self.permissions.as_ref()?;
        let extensions = entry.pax_extensions().ok().flatten()?;
        for extension in extensions.flatten() {
            if extension.key() != Ok(ACL_PAX_KEY) {
                continue;
            }
            match BASE64.decode(extension.value_bytes()) {
                Ok(descriptor) => return Some(descriptor),
                Err(err) => {
                    warn!(error = %err, "Ignoring malformed permission descriptor");
                    return None;
                }
            }
        }
        None
    }
}

/// Number of regular files [`Archiver::create`] would archive under `root`.
///
/// Files that fail to open while archiving are still counted here.
pub fn count_files(root: &Path, filter: &IncludeFilter) -> u64 {
    let mut count = 0;
    let mut walker = WalkDir::new(root).follow_links(false).into_iter();
    while let Some(next) = walker.next() {
        let Ok(entry) = next else {
            continue;
        };
        let is_dir = entry.file_type().is_dir();
        let name = archive_name(&relative_path(root, entry.path()));
        match filter.classify(&name, is_dir) {
            Inclusion::Archive if entry.file_type().is_file() => count += 1,
            Inclusion::Skip if is_dir => walker.skip_current_dir(),
            _ => {}
        }
    }
    count
}

/// Directory whose metadata is applied after all entries are written
struct PendingDirectory {
    path: PathBuf,
    mode: Option<u32>,
    mtime: Option<u64>,
    descriptor: Option<Vec<u8>>,
}

fn relative_path(root: &Path, path: &Path) -> PathBuf {
    match path.strip_prefix(root) {
        Ok(relative) if !relative.as_os_str().is_empty() => relative.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Forward-slash name used for filtering
fn archive_name(relative: &Path) -> String {
    let parts: Vec<_> = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect();
    parts.join("/")
}

/// Relative path confined to the destination, or `None` if the entry name
/// is absolute or climbs out with `..`.
fn sanitize(path: &Path) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(clean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn write_file(root: &Path, relative: &str, contents: &[u8]) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn sample_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "uploads/x.png", b"png bytes");
        write_file(dir.path(), "uploads/deep/nested.txt", b"nested");
        write_file(dir.path(), "other/y.png", b"other bytes");
        write_file(dir.path(), "top.txt", b"top level");
        dir
    }

    fn entry_names(archiver: &Archiver, archive: &[u8]) -> Vec<String> {
        let mut tar = tar::Archive::new(archiver.compression().decoder(archive));
        tar.entries()
            .unwrap()
            .map(|entry| {
                let entry = entry.unwrap();
                entry.path().unwrap().to_string_lossy().trim_end_matches('/').to_string()
            })
            .collect()
    }

    #[test]
    fn test_roundtrip_gzip() {
        let source = sample_tree();
        let archiver = Archiver::new(StreamCompression::gzip());

        let mut archive = Vec::new();
        let stats = archiver.create(&mut archive, source.path(), &IncludeFilter::all()).unwrap();
        assert_eq!(stats.files, 4);
        assert_eq!(stats.bytes, (9 + 6 + 11 + 9) as u64);
        assert_eq!(stats.skipped, 0);

        let dest = TempDir::new().unwrap();
        let extracted = archiver.extract(&archive[..], dest.path()).unwrap();
        assert_eq!(extracted.files, 4);
        assert_eq!(extracted.bytes, stats.bytes);
        assert_eq!(extracted.skipped, 0);

        assert_eq!(fs::read(dest.path().join("uploads/x.png")).unwrap(), b"png bytes");
        assert_eq!(fs::read(dest.path().join("uploads/deep/nested.txt")).unwrap(), b"nested");
        assert_eq!(fs::read(dest.path().join("other/y.png")).unwrap(), b"other bytes");
        assert_eq!(fs::read(dest.path().join("top.txt")).unwrap(), b"top level");
    }

    #[test]
    fn test_roundtrip_plain_tar() {
        let source = sample_tree();
        let archiver = Archiver::new(StreamCompression::None);

        let mut archive = Vec::new();
        archiver.create(&mut archive, source.path(), &IncludeFilter::all()).unwrap();
        assert_ne!(&archive[..2], &[0x1f, 0x8b], "plain tar must not carry a gzip magic");
        assert_eq!(archive.len() % 512, 0);

        let dest = TempDir::new().unwrap();
        archiver.extract(&archive[..], dest.path()).unwrap();
        assert_eq!(fs::read(dest.path().join("top.txt")).unwrap(), b"top level");
    }

    #[test]
    fn test_include_filter_prunes_entries() {
        let source = sample_tree();
        let archiver = Archiver::new(StreamCompression::None);

        let mut archive = Vec::new();
        let stats = archiver
            .create(&mut archive, source.path(), &IncludeFilter::new(["uploads"]))
            .unwrap();
        assert_eq!(stats.files, 2);

        let names = entry_names(&archiver, &archive);
        assert!(names.contains(&".".to_string()));
        assert!(names.contains(&"uploads/x.png".to_string()));
        assert!(names.contains(&"uploads/deep/nested.txt".to_string()));
        assert!(!names.iter().any(|name| name.starts_with("other")));
        assert!(!names.contains(&"top.txt".to_string()));
    }

    #[test]
    fn test_traversed_parents_are_not_emitted() {
        let source = TempDir::new().unwrap();
        write_file(source.path(), "var/www/uploads/a.png", b"a");
        write_file(source.path(), "var/www/index.html", b"index");
        let archiver = Archiver::new(StreamCompression::None);

        let mut archive = Vec::new();
        archiver
            .create(&mut archive, source.path(), &IncludeFilter::new(["var/www/uploads"]))
            .unwrap();

        let names = entry_names(&archiver, &archive);
        assert!(names.contains(&"var/www/uploads/a.png".to_string()));
        assert!(!names.contains(&"var".to_string()));
        assert!(!names.contains(&"var/www".to_string()));
        assert!(!names.contains(&"var/www/index.html".to_string()));

        let dest = TempDir::new().unwrap();
        archiver.extract(&archive[..], dest.path()).unwrap();
        assert_eq!(fs::read(dest.path().join("var/www/uploads/a.png")).unwrap(), b"a");
    }

    #[test]
    fn test_missing_root_is_fatal() {
        let dir = TempDir::new().unwrap();
        let archiver = Archiver::default();

        let err = archiver
            .create(Vec::new(), &dir.path().join("missing"), &IncludeFilter::all())
            .unwrap_err();
        assert!(matches!(err, StashError::SourceUnavailable { .. }));
    }

    #[test]
    fn test_file_root_is_rejected() {
        let dir = TempDir::new().unwrap();
        write_file(dir.path(), "file.txt", b"x");

        let err = Archiver::default()
            .create(Vec::new(), &dir.path().join("file.txt"), &IncludeFilter::all())
            .unwrap_err();
        assert!(matches!(err, StashError::SourceUnavailable { .. }));
    }

    #[derive(Default)]
    struct RecordingPermissions {
        applied: Mutex<Vec<(PathBuf, Vec<u8>)>>,
    }

    impl PermissionProvider for RecordingPermissions {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn descriptor(&self, path: &Path) -> Result<Option<Vec<u8>>> {
            if path.extension().is_some_and(|ext| ext == "png") {
                let name = path.file_name().unwrap().to_string_lossy();
                Ok(Some(format!("user:web:rw- {name}").into_bytes()))
            } else {
                Ok(None)
            }
        }

        fn apply(&self, path: &Path, descriptor: &[u8]) -> Result<()> {
            self.applied.lock().unwrap().push((path.to_path_buf(), descriptor.to_vec()));
            Ok(())
        }
    }

    #[test]
    fn test_permission_descriptors_roundtrip() {
        let source = sample_tree();
        let provider = Arc::new(RecordingPermissions::default());
        let archiver = Archiver::new(StreamCompression::gzip()).with_permissions(provider.clone());

        let mut archive = Vec::new();
        archiver.create(&mut archive, source.path(), &IncludeFilter::all()).unwrap();

        let mut tar = tar::Archive::new(archiver.compression().decoder(&archive[..]));
        let mut tagged = 0;
        for entry in tar.entries().unwrap() {
            let mut entry = entry.unwrap();
            if let Some(extensions) = entry.pax_extensions().unwrap() {
                for extension in extensions {
                    if extension.unwrap().key() == Ok(ACL_PAX_KEY) {
                        tagged += 1;
                    }
                }
            }
        }
        assert_eq!(tagged, 2);

        let dest = TempDir::new().unwrap();
        archiver.extract(&archive[..], dest.path()).unwrap();

        let mut applied = provider.applied.lock().unwrap().clone();
        applied.sort();
        assert_eq!(applied.len(), 2);
        assert!(applied[0].0.ends_with("other/y.png"));
        assert_eq!(applied[0].1, b"user:web:rw- y.png");
        assert!(applied[1].0.ends_with("uploads/x.png"));
    }

    #[test]
    fn test_descriptors_ignored_without_provider() {
        let source = sample_tree();
        let provider = Arc::new(RecordingPermissions::default());
        let writer = Archiver::new(StreamCompression::None).with_permissions(provider.clone());

        let mut archive = Vec::new();
        writer.create(&mut archive, source.path(), &IncludeFilter::all()).unwrap();

        let dest = TempDir::new().unwrap();
        let stats = Archiver::new(StreamCompression::None)
            .extract(&archive[..], dest.path())
            .unwrap();
        assert_eq!(stats.files, 4);
        assert!(provider.applied.lock().unwrap().is_empty());
    }

    fn raw_entry(builder: &mut Builder<Vec<u8>>, name: &[u8], entry_type: EntryType, data: &[u8]) {
        let mut header = Header::new_gnu();
        header.as_old_mut().name[..name.len()].copy_from_slice(name);
        header.set_entry_type(entry_type);
        header.set_mode(0o644);
        header.set_size(data.len() as u64);
        header.set_cksum();
        builder.append(&header, data).unwrap();
    }

    #[derive(Default)]
    struct RecordingProgress {
        events: Mutex<Vec<(String, u64, Option<u64>)>>,
        finished: Mutex<Vec<(String, u64)>>,
    }

    impl ProgressReporter for RecordingProgress {
        fn advance(&self, label: &str, done: u64, total: Option<u64>) {
            self.events.lock().unwrap().push((label.to_string(), done, total));
        }

        fn finish(&self, label: &str, done: u64) {
            self.finished.lock().unwrap().push((label.to_string(), done));
        }
    }

    #[test]
    fn test_progress_counts_filtered_files() {
        let source = sample_tree();
        let filter = IncludeFilter::new(["uploads"]);
        assert_eq!(count_files(source.path(), &filter), 2);
        assert_eq!(count_files(source.path(), &IncludeFilter::all()), 4);

        let progress = Arc::new(RecordingProgress::default());
        let archiver =
            Archiver::new(StreamCompression::gzip()).with_progress(progress.clone(), "web/site");
        let mut archive = Vec::new();
        archiver.create(&mut archive, source.path(), &filter).unwrap();

        let events = progress.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                ("web/site".to_string(), 1, Some(2)),
                ("web/site".to_string(), 2, Some(2)),
            ]
        );

        let dest = TempDir::new().unwrap();
        let restoring =
            Archiver::new(StreamCompression::gzip()).with_progress(progress.clone(), "restore");
        restoring.extract(&archive[..], dest.path()).unwrap();

        let finished = progress.finished.lock().unwrap().clone();
        assert_eq!(finished, vec![("web/site".to_string(), 2), ("restore".to_string(), 2)]);
        assert_eq!(
            progress.events.lock().unwrap().last().unwrap(),
            &("restore".to_string(), 2, None)
        );
    }

    #[test]
    fn test_unknown_entry_types_are_skipped() {
        let mut builder = Builder::new(Vec::new());
        raw_entry(&mut builder, b"pipe", EntryType::Fifo, b"");
        raw_entry(&mut builder, b"kept.txt", EntryType::Regular, b"kept");
        let archive = builder.into_inner().unwrap();

        let dest = TempDir::new().unwrap();
        let stats = Archiver::new(StreamCompression::None)
            .extract(&archive[..], dest.path())
            .unwrap();

        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.files, 1);
        assert!(!dest.path().join("pipe").exists());
        assert_eq!(fs::read(dest.path().join("kept.txt")).unwrap(), b"kept");
    }

    #[test]
    fn test_escaping_paths_are_skipped() {
        let mut builder = Builder::new(Vec::new());
        raw_entry(&mut builder, b"../escape.txt", EntryType::Regular, b"evil");
        raw_entry(&mut builder, b"/abs.txt", EntryType::Regular, b"evil");
        raw_entry(&mut builder, b"safe/inside.txt", EntryType::Regular, b"ok");
        let archive = builder.into_inner().unwrap();

        let parent = TempDir::new().unwrap();
        let dest = parent.path().join("restore");
        let stats = Archiver::new(StreamCompression::None).extract(&archive[..], &dest).unwrap();

        assert_eq!(stats.skipped, 2);
        assert!(!parent.path().join("escape.txt").exists());
        assert_eq!(fs::read(dest.join("safe/inside.txt")).unwrap(), b"ok");
    }

    #[test]
    fn test_corrupt_stream_is_an_error() {
        let dest = TempDir::new().unwrap();
        let result =
            Archiver::new(StreamCompression::gzip()).extract(&b"not an archive"[..], dest.path());
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_modes_and_symlinks_roundtrip() {
        use std::os::unix::fs::{symlink, PermissionsExt};

        let source = TempDir::new().unwrap();
        write_file(source.path(), "bin/run.sh", b"#!/bin/sh\n");
        let script = source.path().join("bin/run.sh");
        fs::set_permissions(script, fs::Permissions::from_mode(0o750)).unwrap();
        symlink("bin/run.sh", source.path().join("run")).unwrap();

        let archiver = Archiver::default();
        let mut archive = Vec::new();
        let stats = archiver.create(&mut archive, source.path(), &IncludeFilter::all()).unwrap();
        assert_eq!(stats.links, 1);

        let dest = TempDir::new().unwrap();
        archiver.extract(&archive[..], dest.path()).unwrap();

        let mode = fs::metadata(dest.path().join("bin/run.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
        assert_eq!(fs::read_link(dest.path().join("run")).unwrap(), PathBuf::from("bin/run.sh"));
    }

    #[cfg(unix)]
    #[test]
    fn test_read_only_directories_keep_their_contents() {
        use std::os::unix::fs::PermissionsExt;

        let source = TempDir::new().unwrap();
        write_file(source.path(), "ro/file.txt", b"sealed");
        write_file(source.path(), "ro/inner/deep.txt", b"deeper");
        let inner = source.path().join("ro/inner");
        fs::set_permissions(inner, fs::Permissions::from_mode(0o555)).unwrap();
        fs::set_permissions(source.path().join("ro"), fs::Permissions::from_mode(0o555)).unwrap();

        let archiver = Archiver::default();
        let mut archive = Vec::new();
        let created = archiver.create(&mut archive, source.path(), &IncludeFilter::all()).unwrap();
        assert_eq!(created.files, 2);

        let dest = TempDir::new().unwrap();
        let extracted = archiver.extract(&archive[..], dest.path()).unwrap();

        assert_eq!(extracted.files, 2);
        assert_eq!(extracted.skipped, 0);
        assert_eq!(fs::read(dest.path().join("ro/file.txt")).unwrap(), b"sealed");
        assert_eq!(fs::read(dest.path().join("ro/inner/deep.txt")).unwrap(), b"deeper");
        for dir in ["ro", "ro/inner"] {
            let mode = fs::metadata(dest.path().join(dir)).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o555, "{dir}");
        }

        for root in [source.path(), dest.path()] {
            for dir in ["ro", "ro/inner"] {
                fs::set_permissions(root.join(dir), fs::Permissions::from_mode(0o755)).unwrap();
            }
        }
    }
}
