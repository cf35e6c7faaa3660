//! Filename sanitization and collision-safe placement under the download
//! directory.
//!
//! File names in an offer come from an unauthenticated LAN peer and are
//! never trusted as-is: this module takes the final path component only,
//! rejects anything that still looks like an escape attempt or a hidden
//! file, and appends a numeric suffix on collision instead of overwriting.

use std::path::{Path, PathBuf};

use crate::error::TransferError;

/// Takes the final path component of `file_name` and rejects anything
/// that still looks like an escape attempt or a hidden-file trick.
fn sanitize_component(file_name: &str) -> Result<String, TransferError> {
    if file_name.is_empty() {
        return Err(TransferError::MalformedPayload(
            "empty file name".to_string(),
        ));
    }
    if file_name.contains('\0') {
        return Err(TransferError::MalformedPayload(
            "file name contains a NUL byte".to_string(),
        ));
    }
    if file_name.contains('/') || file_name.contains('\\') {
        return Err(TransferError::MalformedPayload(
            "file name contains a path separator".to_string(),
        ));
    }
    if file_name.starts_with('.') {
        return Err(TransferError::MalformedPayload(
            "file name may not start with '.'".to_string(),
        ));
    }

    let base = Path::new(file_name)
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| TransferError::MalformedPayload("empty file name".to_string()))?;

    Ok(base.to_string())
}

/// Resolves the final on-disk path for `file_name` under `download_dir`,
/// appending `-N` (smallest N that avoids a collision) if a file with
/// that name already exists.
pub fn resolve_destination(
    download_dir: &Path,
    file_name: &str,
) -> Result<PathBuf, TransferError> {
    let sanitized = sanitize_component(file_name)?;
    let candidate = download_dir.join(&sanitized);
    if !candidate.exists() {
        return Ok(candidate);
    }

    let (stem, ext) = split_stem_ext(&sanitized);
    let mut n = 1u32;
    loop {
        let name = match &ext {
            Some(ext) => format!("{stem}-{n}.{ext}"),
            None => format!("{stem}-{n}"),
        };
        let path = download_dir.join(&name);
        if !path.exists() {
            return Ok(path);
        }
        n += 1;
    }
}

fn split_stem_ext(name: &str) -> (&str, Option<&str>) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn rejects_embedded_separators() {
        assert!(sanitize_component("../../etc/passwd").is_err());
        assert!(sanitize_component("a/b").is_err());
    }

    #[test]
    fn rejects_leading_dot() {
        assert!(sanitize_component(".hidden").is_err());
    }

    #[test]
    fn rejects_nul_byte() {
        assert!(sanitize_component("evil\0.txt").is_err());
    }

    #[test]
    fn clean_name_round_trips_unchanged() {
        assert_eq!(sanitize_component("report.pdf").unwrap(), "report.pdf");
    }

    #[test]
    fn collision_appends_smallest_available_suffix() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("report.pdf"), b"x").unwrap();

        let first = resolve_destination(dir.path(), "report.pdf").unwrap();
        assert_eq!(first.file_name().unwrap(), "report-1.pdf");

        std::fs::write(&first, b"y").unwrap();
        let second = resolve_destination(dir.path(), "report.pdf").unwrap();
        assert_eq!(second.file_name().unwrap(), "report-2.pdf");
    }

    #[test]
    fn no_collision_keeps_original_name() {
        let dir = tempdir().unwrap();
        let resolved = resolve_destination(dir.path(), "fresh.txt").unwrap();
        assert_eq!(resolved.file_name().unwrap(), "fresh.txt");
    }

    #[test]
    fn extensionless_collision_appends_suffix_without_dot() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("README"), b"x").unwrap();
        let resolved = resolve_destination(dir.path(), "README").unwrap();
        assert_eq!(resolved.file_name().unwrap(), "README-1");
    }
}
