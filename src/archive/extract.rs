//! Zip extraction confined to an extraction root

use std::fs::{self, File};
use std::io::{self, Read, Seek};
use std::path::{Component, Path, PathBuf};

use tracing::{debug, error};
use zip::ZipArchive;

use crate::error::{MoverError, Result};

/// One zip member as stored in the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveManifestEntry {
    pub relative_path: String,
    pub is_directory: bool,
}

/// Join `relative` onto `root` and normalize it lexically.
///
/// Returns `None` unless the result is a strict descendant of `root`.
/// `root` must already be clean (absolute, no `.` or `..`).
pub fn resolve_entry_path(root: &Path, relative: &str) -> Option<PathBuf> {
    let resolved = clean_path(&root.join(relative));
    if resolved != root && resolved.starts_with(root) {
        Some(resolved)
    } else {
        None
    }
}

fn clean_path(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // Popping past the root is a no-op, as with `/..`.
                cleaned.pop();
            }
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned
}

/// Extract every entry of `archive` below `root`, in archive order.
///
/// Returns the materialized paths. The first entry resolving outside `root`
/// aborts with [`MoverError::UnsafeArchivePath`]; files written before it
/// are left in place.
pub fn extract_zip<R: Read + Seek>(archive: &mut ZipArchive<R>, root: &Path) -> Result<Vec<PathBuf>> {
    let root = fs::canonicalize(root).map_err(|source| MoverError::ArchiveExtraction {
        path: root.to_path_buf(),
        extracted: Vec::new(),
        source,
    })?;

    let mut extracted = Vec::with_capacity(archive.len());

    for index in 0..archive.len() {
        let mut file = match archive.by_index(index) {
            Ok(file) => file,
            Err(err) => {
                return Err(MoverError::ArchiveExtraction {
                    path: root.clone(),
                    extracted,
                    source: io::Error::from(err),
                });
            }
        };

        let entry = ArchiveManifestEntry {
            relative_path: file.name().to_string(),
            is_directory: file.is_dir(),
        };

        let Some(target) = resolve_entry_path(&root, &entry.relative_path) else {
            let path = root.join(&entry.relative_path);
            error!(entry = %entry.relative_path, "zip entry escapes extraction root");
            return Err(MoverError::UnsafeArchivePath { path, extracted });
        };

        if entry.is_directory {
            if let Err(source) = fs::create_dir_all(&target) {
                return Err(MoverError::ArchiveExtraction {
                    path: target,
                    extracted,
                    source,
                });
            }
            debug!(path = %target.display(), "created directory");
            extracted.push(target);
            continue;
        }

        if let Err(source) = write_entry(&mut file, &target) {
            return Err(MoverError::ArchiveExtraction {
                path: target,
                extracted,
                source,
            });
        }
        debug!(path = %target.display(), size = file.size(), "extracted file");
        extracted.push(target);
    }

    Ok(extracted)
}

fn write_entry(file: &mut zip::read::ZipFile<'_>, target: &Path) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut output = File::create(target)?;
    io::copy(file, &mut output)?;

    #[cfg(unix)]
    if let Some(mode) = file.unix_mode() {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(target, fs::Permissions::from_mode(mode & 0o7777))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::write::FileOptions;

    fn zip_with(entries: &[(&str, &[u8], u32)]) -> ZipArchive<Cursor<Vec<u8>>> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, contents, mode) in entries {
            let options = FileOptions::default().unix_permissions(*mode);
            writer.start_file(*name, options).unwrap();
            writer.write_all(contents).unwrap();
        }
        let bytes = writer.finish().unwrap().into_inner();
        ZipArchive::new(Cursor::new(bytes)).unwrap()
    }

    #[test]
    fn resolves_descendants_only() {
        let root = Path::new("/scratch/out");
        assert_eq!(
            resolve_entry_path(root, "a/./b/../image.tar"),
            Some(PathBuf::from("/scratch/out/a/image.tar"))
        );
        assert_eq!(resolve_entry_path(root, "../../etc/passwd"), None);
        assert_eq!(resolve_entry_path(root, "a/../../out-sibling"), None);
        assert_eq!(resolve_entry_path(root, "/etc/passwd"), None);
        assert_eq!(resolve_entry_path(root, "a/.."), None);
        assert_eq!(resolve_entry_path(root, ""), None);
    }

    #[test]
    fn sibling_with_shared_prefix_is_outside() {
        let root = Path::new("/scratch/out");
        assert_eq!(resolve_entry_path(root, "../outside/x"), None);
        assert_eq!(resolve_entry_path(root, "../out2/x"), None);
    }

    #[test]
    fn zip_slip_aborts_and_writes_nothing_outside_root() {
        let base = tempfile::tempdir().unwrap();
        let root = base.path().join("a").join("b");
        fs::create_dir_all(&root).unwrap();

        let mut archive = zip_with(&[
            ("ok.txt", b"fine", 0o644),
            ("../../etc/passwd", b"root::0:0", 0o644),
            ("later.txt", b"never", 0o644),
        ]);

        let err = extract_zip(&mut archive, &root).unwrap_err();
        match err {
            MoverError::UnsafeArchivePath { path, extracted } => {
                assert!(path.to_string_lossy().contains("etc/passwd"));
                assert_eq!(extracted.len(), 1);
                assert!(extracted[0].ends_with("ok.txt"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!base.path().join("etc").exists());
        assert!(!base.path().join("a").join("etc").exists());
        assert!(!root.join("later.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn round_trip_preserves_bytes_and_mode() {
        use std::os::unix::fs::PermissionsExt;

        let base = tempfile::tempdir().unwrap();
        let payload: Vec<u8> = (0..=255u8).cycle().take(70_000).collect();
        let mut archive = zip_with(&[
            ("nested/dir/image.tar", &payload, 0o640),
            ("run.sh", b"#!/bin/sh\n", 0o755),
        ]);

        let extracted = extract_zip(&mut archive, base.path()).unwrap();
        assert_eq!(extracted.len(), 2);

        assert_eq!(fs::read(&extracted[0]).unwrap(), payload);
        let mode = fs::metadata(&extracted[0]).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);

        let mode = fs::metadata(&extracted[1]).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn write_failure_reports_what_was_already_extracted() {
        let base = tempfile::tempdir().unwrap();
        // "a" lands as a file, so "a/b" cannot get its parent directory.
        let mut archive = zip_with(&[("a", b"plain file", 0o644), ("a/b", b"nested", 0o644)]);

        let err = extract_zip(&mut archive, base.path()).unwrap_err();
        let root = fs::canonicalize(base.path()).unwrap();
        match err {
            MoverError::ArchiveExtraction { path, extracted, .. } => {
                assert_eq!(path, root.join("a").join("b"));
                assert_eq!(extracted, vec![root.join("a")]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fs::read(root.join("a")).unwrap(), b"plain file");
    }

    #[test]
    fn paths_are_recorded_in_archive_order() {
        let base = tempfile::tempdir().unwrap();
        let mut archive = zip_with(&[
            ("z.tar", b"z", 0o644),
            ("a.tar", b"a", 0o644),
            ("m/m.tar", b"m", 0o644),
        ]);

        let extracted = extract_zip(&mut archive, base.path()).unwrap();
        let names: Vec<_> = extracted
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["z.tar", "a.tar", "m.tar"]);
    }
}
