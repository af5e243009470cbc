//! Shared command line argument types.

use anyhow::{ensure, Result};
use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// A path taken from the command line that must exist when parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliPath(PathBuf);

impl FromStr for CliPath {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<CliPath> {
        let path = PathBuf::from(s);
        ensure!(path.exists(), "path does not exist: {s}");
        Ok(CliPath(path))
    }
}

impl From<PathBuf> for CliPath {
    fn from(path: PathBuf) -> CliPath {
        CliPath(path)
    }
}

impl AsRef<Path> for CliPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl Deref for CliPath {
    type Target = Path;

    fn deref(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for CliPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.display().fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existing_paths_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("list.txt");
        std::fs::write(&path, "").unwrap();
        let parsed = CliPath::from_str(path.to_str().unwrap()).unwrap();
        assert_eq!(&*parsed, path.as_path());
    }

    #[test]
    fn missing_paths_are_rejected() {
        let err = CliPath::from_str("/no/such/file.txt").unwrap_err();
        assert!(err.to_string().contains("/no/such/file.txt"));
    }
}
