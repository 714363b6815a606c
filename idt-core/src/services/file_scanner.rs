//! Image file scanner
//!
//! Recursive discovery of supported images: extension first, then magic bytes.
//! Results are sorted so a run enumerates its inputs in a stable order.

use crate::models::ImageFormat;
use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::{DirEntry, WalkDir};

/// Image scanner errors
#[derive(Debug, Error)]
pub enum ScanError {
    /// Specified path does not exist
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    /// Path exists but is not a directory
    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    /// Cannot read a candidate file
    #[error("File access error {0}: {1}")]
    FileAccessError(PathBuf, String),
}

pub struct FileScanner {
    ignore_patterns: Vec<String>,
    max_depth: Option<usize>,
}

impl FileScanner {
    /// Scanner with the default ignore list (.DS_Store, Thumbs.db, VCS dirs, ...)
    pub fn new() -> Self {
        Self {
            ignore_patterns: vec![
                ".DS_Store".to_string(),
                "Thumbs.db".to_string(),
                ".git".to_string(),
                ".svn".to_string(),
                "@eaDir".to_string(),
            ],
            max_depth: None,
        }
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    /// Skip any entry whose name contains `pattern`
    pub fn ignore(mut self, pattern: impl Into<String>) -> Self {
        self.ignore_patterns.push(pattern.into());
        self
    }

    /// All supported images under `root_path`, sorted by path
    pub fn scan(&self, root_path: &Path) -> Result<Vec<PathBuf>, ScanError> {
        if !root_path.exists() {
            return Err(ScanError::PathNotFound(root_path.to_path_buf()));
        }
        if !root_path.is_dir() {
            return Err(ScanError::NotADirectory(root_path.to_path_buf()));
        }

        let mut symlink_visited = HashSet::new();
        let walker = WalkDir::new(root_path)
            .follow_links(true)
            .max_depth(self.max_depth.unwrap_or(usize::MAX))
            .into_iter()
            .filter_entry(|e| self.should_process_entry(e, &mut symlink_visited));

        let mut images = Vec::new();
        let mut candidates = 0usize;
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    // Keep scanning; one unreadable entry should not hide the rest
                    tracing::warn!("Error accessing entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            candidates += 1;

            match self.is_image_file(entry.path()) {
                Ok(true) => images.push(entry.into_path()),
                Ok(false) => {}
                Err(e) => tracing::warn!("Error verifying {}: {}", entry.path().display(), e),
            }
        }

        images.sort();
        tracing::debug!(
            root = %root_path.display(),
            candidates,
            images = images.len(),
            "Image scan complete"
        );
        Ok(images)
    }

    fn should_process_entry(&self, entry: &DirEntry, symlink_visited: &mut HashSet<PathBuf>) -> bool {
        let file_name = entry.file_name().to_string_lossy();
        if self
            .ignore_patterns
            .iter()
            .any(|pattern| file_name.contains(pattern.as_str()))
        {
            return false;
        }

        if entry.path_is_symlink() {
            if let Ok(canonical) = entry.path().canonicalize() {
                if !symlink_visited.insert(canonical) {
                    tracing::warn!("Symlink loop detected: {}", entry.path().display());
                    return false;
                }
            }
        }

        true
    }

    fn is_image_file(&self, path: &Path) -> Result<bool, ScanError> {
        let Some(format) = ImageFormat::from_path(path) else {
            return Ok(false);
        };

        let mut file = File::open(path)
            .map_err(|e| ScanError::FileAccessError(path.to_path_buf(), e.to_string()))?;
        let mut header = [0u8; 12];
        let read = file
            .read(&mut header)
            .map_err(|e| ScanError::FileAccessError(path.to_path_buf(), e.to_string()))?;

        Ok(format.matches_magic(&header[..read]))
    }
}

impl Default for FileScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const JPEG: &[u8] = &[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

    #[test]
    fn test_scan_nonexistent_path() {
        let scanner = FileScanner::new();
        match scanner.scan(Path::new("/nonexistent/path")) {
            Err(ScanError::PathNotFound(_)) => {}
            other => panic!("Expected PathNotFound, got {:?}", other),
        }
    }

    #[test]
    fn test_scan_file_as_directory() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.jpg");
        fs::write(&file, JPEG).unwrap();
        assert!(matches!(
            FileScanner::new().scan(&file),
            Err(ScanError::NotADirectory(_))
        ));
    }

    #[test]
    fn test_scan_finds_sorted_images_and_checks_magic() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::create_dir_all(dir.path().join(".git")).unwrap();
        fs::write(dir.path().join("b.jpg"), JPEG).unwrap();
        fs::write(dir.path().join("sub").join("a.png"), PNG).unwrap();
        fs::write(dir.path().join("fake.jpg"), b"not an image").unwrap();
        fs::write(dir.path().join("notes.txt"), b"hello").unwrap();
        fs::write(dir.path().join(".git").join("c.jpg"), JPEG).unwrap();

        let found = FileScanner::new().scan(dir.path()).unwrap();
        assert_eq!(
            found,
            vec![dir.path().join("b.jpg"), dir.path().join("sub").join("a.png")]
        );
    }

    #[test]
    fn test_scan_empty_directory() {
        let dir = TempDir::new().unwrap();
        assert!(FileScanner::new().scan(dir.path()).unwrap().is_empty());
    }
}
