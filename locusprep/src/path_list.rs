//! The plain text path lists both subcommands consume.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Read one path per line, trimming whitespace and skipping blank lines.
pub fn read_path_list(path: &Path) -> Result<Vec<PathBuf>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading path list {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(PathBuf::from)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_and_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("list.txt");
        fs::write(&list, "a.nd2\n  \n  plates/b.nd2  \n\nc.nd2").unwrap();
        let paths = read_path_list(&list).unwrap();
        assert_eq!(
            paths,
            vec![
                PathBuf::from("a.nd2"),
                PathBuf::from("plates/b.nd2"),
                PathBuf::from("c.nd2"),
            ]
        );
    }

    #[test]
    fn empty_files_give_empty_lists() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("list.txt");
        fs::write(&list, "").unwrap();
        assert!(read_path_list(&list).unwrap().is_empty());
    }

    #[test]
    fn missing_lists_name_the_file() {
        let err = read_path_list(Path::new("/nope/list.txt")).unwrap_err();
        assert!(format!("{err:#}").contains("/nope/list.txt"));
    }
}
