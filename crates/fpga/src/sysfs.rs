//! Small helpers for reading sysfs attributes.

use core::error::Error;
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;

pub type SysfsResult<T> = Result<T, Report<SysfsError>>;

/// Errors raised while reading sysfs entries.
#[derive(Debug, derive_more::Display)]
pub enum SysfsError {
    #[display("unable to read {}", path.display())]
    Read { path: PathBuf },
    #[display("unable to list directory {}", path.display())]
    ReadDir { path: PathBuf },
    #[display("unable to resolve {}", path.display())]
    Resolve { path: PathBuf },
    #[display("no unique entry matches {pattern} ({matches} matches)")]
    NotFound { pattern: String, matches: usize },
    #[display("invalid value {value:?} in {}", path.display())]
    InvalidValue { path: PathBuf, value: String },
}

impl Error for SysfsError {}

/// Reads a sysfs attribute and trims surrounding whitespace.
pub fn read_trimmed(path: &Path) -> SysfsResult<String> {
    let data = fs::read_to_string(path).change_context_lazy(|| SysfsError::Read {
        path: path.to_path_buf(),
    })?;
    Ok(data.trim().to_string())
}

/// Reads `dir/name`, where `name` may contain glob wildcards.
///
/// A missing file, or a wildcard matching anything other than exactly one
/// entry, yields `None`.
pub fn read_optional(dir: &Path, name: &str) -> SysfsResult<Option<String>> {
    let mut path = dir.join(name);
    if name.contains(['?', '*', '[']) {
        match find_unique(&path) {
            Ok(found) => path = found,
            Err(_) => return Ok(None),
        }
    }

    match fs::read_to_string(&path) {
        Ok(data) => Ok(Some(data.trim().to_string())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Report::new(e).change_context(SysfsError::Read { path })),
    }
}

/// Resolves a glob pattern to its single match.
///
/// Zero or several matches are both reported as not found; an ambiguous
/// pick is never made.
pub fn find_unique(pattern: &Path) -> SysfsResult<PathBuf> {
    let pattern = pattern.to_string_lossy().into_owned();
    let mut matches: Vec<PathBuf> = match glob::glob(&pattern) {
        Ok(paths) => paths.filter_map(Result::ok).collect(),
        Err(e) => {
            return Err(Report::new(SysfsError::NotFound {
                pattern,
                matches: 0,
            })
            .attach_printable(e.to_string()))
        }
    };

    if matches.len() != 1 {
        return Err(Report::new(SysfsError::NotFound {
            pattern,
            matches: matches.len(),
        }));
    }

    Ok(matches.remove(0))
}

/// Lists the entry names of a directory, sorted.
pub fn list_dir(dir: &Path) -> SysfsResult<Vec<String>> {
    let read_dir_err = || SysfsError::ReadDir {
        path: dir.to_path_buf(),
    };

    let mut names = Vec::new();
    for entry in fs::read_dir(dir).change_context_lazy(read_dir_err)? {
        let entry = entry.change_context_lazy(read_dir_err)?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    names.sort();

    Ok(names)
}

/// Follows symlinks and returns the final path.
pub fn resolve(path: &Path) -> SysfsResult<PathBuf> {
    fs::canonicalize(path).change_context_lazy(|| SysfsError::Resolve {
        path: path.to_path_buf(),
    })
}

/// Returns the basename of `path` after resolving symlinks, falling back to
/// the unresolved basename.
pub fn clean_basename(path: &Path) -> String {
    let real = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    real.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Parses an unsigned decimal attribute.
pub fn parse_u32(path: &Path, value: &str) -> SysfsResult<u32> {
    value.parse::<u32>().change_context_lazy(|| SysfsError::InvalidValue {
        path: path.to_path_buf(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_read_trimmed() {
        let dir = TempDir::new().expect("should create temp dir");
        let path = dir.path().join("afu_id");
        fs::write(&path, "  d8424dc4a4a3c413f89e433683f9040b\n").expect("should write");

        assert_eq!(
            read_trimmed(&path).expect("should read"),
            "d8424dc4a4a3c413f89e433683f9040b"
        );
        assert!(read_trimmed(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_read_optional_wildcards() {
        let dir = TempDir::new().expect("should create temp dir");
        for region in ["region1", "region2"] {
            fs::create_dir_all(dir.path().join("unique/fpga_region").join(region))
                .expect("should create dirs");
        }
        fs::write(dir.path().join("unique/fpga_region/region1/compat_id"), "abc\n")
            .expect("should write");
        fs::write(dir.path().join("unique/fpga_region/region1/dev"), "1\n").expect("write");
        fs::write(dir.path().join("unique/fpga_region/region2/dev"), "2\n").expect("write");

        let base = dir.path().join("unique");
        assert_eq!(
            read_optional(&base, "fpga_region/region*/compat_id").expect("should read"),
            Some("abc".to_string())
        );
        // two matches are treated as absent
        assert_eq!(
            read_optional(&base, "fpga_region/region*/dev").expect("should read"),
            None
        );
        assert_eq!(read_optional(&base, "missing").expect("should read"), None);
    }

    #[test]
    fn test_find_unique_reports_match_count() {
        let dir = TempDir::new().expect("should create temp dir");
        fs::create_dir(dir.path().join("dfl-fme.0")).expect("should create dir");
        fs::create_dir(dir.path().join("dfl-fme.1")).expect("should create dir");

        let err = find_unique(&dir.path().join("dfl-fme.*")).expect_err("should be ambiguous");
        match err.current_context() {
            SysfsError::NotFound { matches, .. } => assert_eq!(*matches, 2),
            other => panic!("unexpected error: {other}"),
        }

        let found = find_unique(&dir.path().join("dfl-fme.1")).expect("should find");
        assert_eq!(found, dir.path().join("dfl-fme.1"));
    }

    #[test]
    fn test_list_dir_sorted() {
        let dir = TempDir::new().expect("should create temp dir");
        for name in ["intel-fpga-port.1", "intel-fpga-fme.0", "intel-fpga-port.0"] {
            fs::create_dir(dir.path().join(name)).expect("should create dir");
        }

        assert_eq!(
            list_dir(dir.path()).expect("should list"),
            vec!["intel-fpga-fme.0", "intel-fpga-port.0", "intel-fpga-port.1"]
        );
    }
}
