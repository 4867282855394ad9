use std::fs;
use std::io::{self, Cursor, Write};
use std::path::Path;

use walkdir::WalkDir;
use zip::ZipArchive;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::cancel::{CancellableReader, CancellationToken};
use crate::error::BundlerError;

/// Removes `dir` with everything below it and creates it again empty.
pub fn recreate_dir(dir: &Path) -> Result<(), BundlerError> {
    if dir.exists() {
        fs::remove_dir_all(dir)
            .map_err(|err| BundlerError::Filesystem(format!("remove {}: {err}", dir.display())))?;
    }
    fs::create_dir_all(dir)
        .map_err(|err| BundlerError::Filesystem(format!("create {}: {err}", dir.display())))
}

pub fn extract_zip(
    zip_path: &Path,
    target_dir: &Path,
    cancel: &CancellationToken,
) -> Result<(), BundlerError> {
    let file = fs::File::open(zip_path).map_err(|err| {
        BundlerError::Filesystem(format!("open zip {}: {err}", zip_path.display()))
    })?;
    let mut archive = ZipArchive::new(file).map_err(BundlerError::archive)?;

    for i in 0..archive.len() {
        cancel.check()?;
        let entry = archive.by_index(i).map_err(BundlerError::archive)?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(BundlerError::Archive(
                    "zip entry path traversal detected".to_string(),
                ));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path).map_err(BundlerError::filesystem)?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(BundlerError::filesystem)?;
        }
        let mut outfile = fs::File::create(&entry_path).map_err(BundlerError::filesystem)?;
        let mut reader = CancellableReader::new(entry, cancel);
        io::copy(&mut reader, &mut outfile).map_err(|err| match cancel.check() {
            Err(cancelled) => cancelled,
            Ok(()) => BundlerError::filesystem(err),
        })?;
    }
    Ok(())
}

/// Zips every file and directory below `root`, named by its path relative to `root`.
pub fn zip_directory(root: &Path, cancel: &CancellationToken) -> Result<Vec<u8>, BundlerError> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .compression_level(Some(1))
        .large_file(true);

    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        cancel.check()?;
        let entry = entry.map_err(BundlerError::filesystem)?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(BundlerError::filesystem)?;
        let name = relative
            .components()
            .map(|part| part.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if entry.file_type().is_dir() {
            writer
                .add_directory(name, options)
                .map_err(BundlerError::archive)?;
            continue;
        }

        writer
            .start_file(name, options)
            .map_err(BundlerError::archive)?;
        let file = fs::File::open(entry.path()).map_err(BundlerError::filesystem)?;
        let mut reader = CancellableReader::new(file, cancel);
        io::copy(&mut reader, &mut writer).map_err(|err| match cancel.check() {
            Err(cancelled) => cancelled,
            Ok(()) => BundlerError::archive(err),
        })?;
    }
    writer.flush().map_err(BundlerError::archive)?;
    let cursor = writer.finish().map_err(BundlerError::archive)?;
    Ok(cursor.into_inner())
}
