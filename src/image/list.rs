//! Input discovery: directories and list files.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::config::OutputFormat;
use crate::error::{Error, Result};

/// Extensions the decoder is expected to handle.
const IMAGE_EXTENSIONS: [&str; 9] = [
    "png", "jpg", "jpeg", "webp", "bmp", "gif", "tif", "tiff", "tga",
];

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

/// Whether `path` names a list of inputs (`.txt` or `.csv`).
#[must_use]
pub fn is_list_file(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .is_some_and(|ext| matches!(ext.to_lowercase().as_str(), "txt" | "csv"))
}

/// Image files directly inside `dir`, sorted by path.
///
/// # Errors
///
/// Returns an error if the directory cannot be read.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|err| Error::Io(err.into()))?;
        if entry.file_type().is_file() && has_image_extension(entry.path()) {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Paths listed in a `.txt`/`.csv` file, one per row, first column used.
///
/// Rows follow CSV quoting, so a quoted path may contain commas. Blank
/// rows are skipped.
///
/// # Errors
///
/// Returns an error if the file cannot be read or a row is malformed.
pub fn load_list_file(path: &Path) -> Result<Vec<PathBuf>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|err| list_error(path, &err))?;

    let mut files = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| list_error(path, &err))?;
        if let Some(first) = record.get(0).filter(|field| !field.is_empty()) {
            files.push(PathBuf::from(first));
        }
    }
    Ok(files)
}

fn list_error(path: &Path, err: &csv::Error) -> Error {
    Error::config(format!("cannot read list file {}: {err}", path.display()))
}

/// File name for the converted version of `input`: same stem, new extension.
#[must_use]
pub fn output_filename(input: &Path, format: OutputFormat) -> PathBuf {
    let stem = input.file_stem().unwrap_or_else(|| OsStr::new("output"));
    PathBuf::from(stem).with_extension(format.extension())
}
