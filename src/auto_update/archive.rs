// Update package decoder
// Unpacks the zip package into a directory tree. Entries that are packaged
// application resources (e.g. `app.asar`) are refused unless the caller
// authorizes them for this one extraction.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use zip::result::ZipError;
use zip::ZipArchive;

use crate::auto_update::UpdateError;

/// File extensions treated as packaged application resources
pub const PACKAGED_RESOURCE_EXTENSIONS: &[&str] = &["asar"];

/// What to do with packaged application resources inside the archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PackagedResources {
    /// Fail the extraction when one is found
    #[default]
    Refuse,
    /// Write them like any other file (the update package ships its own)
    Allow,
}

/// Summary of one extraction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractReport {
    pub files: usize,
    pub directories: usize,
    pub skipped: usize,
}

fn is_packaged_resource(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            PACKAGED_RESOURCE_EXTENSIONS
                .iter()
                .any(|protected| ext.eq_ignore_ascii_case(protected))
        })
        .unwrap_or(false)
}

fn package_error(archive_path: &Path, e: ZipError) -> UpdateError {
    match e {
        ZipError::Io(io_err) => UpdateError::FileSystem(format!(
            "Failed to read {}: {}",
            archive_path.display(),
            io_err
        )),
        other => UpdateError::PackageFormat(format!("{}: {}", archive_path.display(), other)),
    }
}

fn fs_error(action: &str, path: &Path, e: io::Error) -> UpdateError {
    UpdateError::FileSystem(format!("Failed to {} {}: {}", action, path.display(), e))
}

/// Unpack `archive_path` into `destination`, creating it as needed
///
/// Entries whose names would escape `destination` are skipped.
pub fn extract_archive(
    archive_path: &Path,
    destination: &Path,
    resources: PackagedResources,
) -> Result<ExtractReport, UpdateError> {
    let file = File::open(archive_path).map_err(|e| fs_error("open", archive_path, e))?;
    let mut archive = ZipArchive::new(file).map_err(|e| package_error(archive_path, e))?;

    fs::create_dir_all(destination).map_err(|e| fs_error("create", destination, e))?;

    let mut report = ExtractReport {
        files: 0,
        directories: 0,
        skipped: 0,
    };

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| package_error(archive_path, e))?;

        let relative: PathBuf = match entry.enclosed_name() {
            Some(path) => path,
            None => {
                log::warn!("[Archive] Skipping unsafe entry name: {}", entry.name());
                report.skipped += 1;
                continue;
            }
        };
        let outpath = destination.join(&relative);

        if entry.is_dir() {
            fs::create_dir_all(&outpath).map_err(|e| fs_error("create", &outpath, e))?;
            report.directories += 1;
            continue;
        }

        if resources == PackagedResources::Refuse && is_packaged_resource(&relative) {
            return Err(UpdateError::PackageFormat(format!(
                "{} is a packaged application resource and extraction was not authorized for it",
                relative.display()
            )));
        }

        if let Some(parent) = outpath.parent() {
            fs::create_dir_all(parent).map_err(|e| fs_error("create", parent, e))?;
        }
        let mut outfile = File::create(&outpath).map_err(|e| fs_error("create", &outpath, e))?;
        io::copy(&mut entry, &mut outfile).map_err(|e| {
            if e.kind() == io::ErrorKind::InvalidData {
                UpdateError::PackageFormat(format!("Corrupt entry {}: {}", entry.name(), e))
            } else {
                fs_error("write", &outpath, e)
            }
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                fs::set_permissions(&outpath, fs::Permissions::from_mode(mode))
                    .map_err(|e| fs_error("set permissions on", &outpath, e))?;
            }
        }

        report.files += 1;
    }

    log::info!(
        "[Archive] Extracted {} file(s), {} dir(s) into {}",
        report.files,
        report.directories,
        destination.display()
    );
    Ok(report)
}

/// [`extract_archive`] on the blocking thread pool
pub async fn extract_archive_async(
    archive_path: PathBuf,
    destination: PathBuf,
    resources: PackagedResources,
) -> Result<ExtractReport, UpdateError> {
    tokio::task::spawn_blocking(move || extract_archive(&archive_path, &destination, resources))
        .await
        .map_err(|e| UpdateError::FileSystem(format!("Extraction task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auto_update::test_support::build_zip;

    fn write_zip(dir: &Path, entries: &[(&str, &[u8])]) -> PathBuf {
        let path = dir.join("update.zip");
        fs::write(&path, build_zip(entries)).unwrap();
        path
    }

    #[test]
    fn test_extracts_nested_tree() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_zip(
            dir.path(),
            &[
                ("D2RMM 1.1.0/", b""),
                ("D2RMM 1.1.0/D2RMM.exe", b"exe"),
                ("D2RMM 1.1.0/mods/readme.txt", b"hello"),
            ],
        );
        let out = dir.path().join("update");

        let report = extract_archive(&archive, &out, PackagedResources::Refuse).unwrap();

        assert_eq!(report.files, 2);
        assert_eq!(
            fs::read_to_string(out.join("D2RMM 1.1.0/mods/readme.txt")).unwrap(),
            "hello"
        );
        assert!(out.join("D2RMM 1.1.0/D2RMM.exe").exists());
    }

    #[test]
    fn test_packaged_resource_requires_authorization() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_zip(dir.path(), &[("D2RMM 1.1.0/resources/app.asar", b"asar")]);
        let out = dir.path().join("update");

        let refused = extract_archive(&archive, &out, PackagedResources::Refuse);
        assert!(matches!(refused, Err(UpdateError::PackageFormat(_))));

        let report = extract_archive(&archive, &out, PackagedResources::Allow).unwrap();
        assert_eq!(report.files, 1);
        assert!(out.join("D2RMM 1.1.0/resources/app.asar").exists());
    }

    #[test]
    fn test_skips_entries_escaping_destination() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_zip(dir.path(), &[("../evil.txt", b"x"), ("ok.txt", b"y")]);
        let out = dir.path().join("update");

        let report = extract_archive(&archive, &out, PackagedResources::Refuse).unwrap();

        assert_eq!(report.files, 1);
        assert_eq!(report.skipped, 1);
        assert!(!dir.path().join("evil.txt").exists());
    }

    #[test]
    fn test_corrupt_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("update.zip");
        fs::write(&archive, b"this is not a zip file").unwrap();

        let result = extract_archive(&archive, &dir.path().join("update"), PackagedResources::Allow);
        assert!(matches!(result, Err(UpdateError::PackageFormat(_))));
    }

    #[test]
    fn test_missing_archive() {
        let dir = tempfile::tempdir().unwrap();
        let result = extract_archive(
            &dir.path().join("nope.zip"),
            &dir.path().join("update"),
            PackagedResources::Allow,
        );
        assert!(matches!(result, Err(UpdateError::FileSystem(_))));
    }

    #[test]
    fn test_is_packaged_resource() {
        assert!(is_packaged_resource(Path::new("resources/app.asar")));
        assert!(is_packaged_resource(Path::new("APP.ASAR")));
        assert!(!is_packaged_resource(Path::new("resources/app.asar.unpacked/x.js")));
        assert!(!is_packaged_resource(Path::new("D2RMM.exe")));
    }

    #[tokio::test]
    async fn test_extract_async() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_zip(dir.path(), &[("a.txt", b"a")]);
        let out = dir.path().join("update");

        let report = extract_archive_async(archive, out.clone(), PackagedResources::Refuse)
            .await
            .unwrap();
        assert_eq!(report.files, 1);
        assert!(out.join("a.txt").exists());
    }
}
