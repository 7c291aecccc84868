use crate::error::{Error, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// A test file found below a corpus root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CorpusFile {
    /// Path relative to the root, without extension, `/` separated.
    pub name: String,
    pub path: PathBuf,
}

/// Walks `root` for files ending in `.{extension}`. Files whose name does not
/// match `filter` are skipped. Results are sorted by name.
pub fn discover(root: &Path, extension: &str, filter: Option<&Regex>) -> Result<Vec<CorpusFile>> {
    if !root.is_dir() {
        return Err(Error::corpus(
            root.display().to_string(),
            "corpus root is not a directory",
        ));
    }

    let mut files = vec![];
    for entry in WalkDir::new(root).follow_links(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(%err, "can't read corpus entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(extension) {
            continue;
        }

        let name = test_name(root, path);
        if let Some(filter) = filter {
            if !filter.is_match(&name) {
                debug!(test = %name, "skipping test, pattern mismatch");
                continue;
            }
        }
        files.push(CorpusFile {
            name,
            path: path.to_path_buf(),
        });
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

/// The canonical test name: relative path without extension.
pub fn test_name(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path).with_extension("");
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn corpus() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("eth_getBalance")).unwrap();
        fs::create_dir_all(root.join("eth_blockNumber")).unwrap();
        fs::write(root.join("eth_getBalance/get-balance.io"), "").unwrap();
        fs::write(root.join("eth_getBalance/get-balance-unknown.io"), "").unwrap();
        fs::write(root.join("eth_blockNumber/simple-test.io"), "").unwrap();
        fs::write(root.join("eth_blockNumber/README.md"), "").unwrap();
        fs::write(root.join("headfcu.json"), "{}").unwrap();
        dir
    }

    #[test]
    fn discovers_by_extension() {
        let dir = corpus();
        let files = discover(dir.path(), "io", None).unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "eth_blockNumber/simple-test",
                "eth_getBalance/get-balance",
                "eth_getBalance/get-balance-unknown",
            ]
        );
    }

    #[test]
    fn filters_by_pattern() {
        let dir = corpus();
        let filter = Regex::new("(?i:GETBALANCE/get-balance$)").unwrap();
        let files = discover(dir.path(), "io", Some(&filter)).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "eth_getBalance/get-balance");
        assert!(files[0].path.ends_with("eth_getBalance/get-balance.io"));
    }

    #[test]
    fn missing_root() {
        let err = discover(Path::new("/nonexistent/corpus"), "io", None).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Corpus);
    }
}
