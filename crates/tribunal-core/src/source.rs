//! Scan inputs: file paths with their content.

use std::fmt;
use std::path::{Path, PathBuf};

/// Content of an input file as supplied by the caller.
#[derive(Clone)]
pub enum FileContent {
    /// Decoded text.
    Text(String),
    /// Raw bytes, checked for binary data and UTF-8 by the exclusion resolver.
    Bytes(Vec<u8>),
    /// The content could not be read.
    Unreadable(String),
}

impl fmt::Debug for FileContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(s) => write!(f, "Text({} bytes)", s.len()),
            Self::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            Self::Unreadable(reason) => write!(f, "Unreadable({reason})"),
        }
    }
}

impl FileContent {
    /// Returns the content size in bytes, if readable.
    #[must_use]
    pub fn len(&self) -> Option<usize> {
        match self {
            Self::Text(s) => Some(s.len()),
            Self::Bytes(b) => Some(b.len()),
            Self::Unreadable(_) => None,
        }
    }

    /// Returns true if the content is readable and empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Returns the raw bytes, if readable.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Text(s) => Some(s.as_bytes()),
            Self::Bytes(b) => Some(b),
            Self::Unreadable(_) => None,
        }
    }
}

/// One file to scan.
#[derive(Debug, Clone)]
pub struct FileInput {
    /// Path relative to the scan root.
    pub path: PathBuf,
    /// The file's content.
    pub content: FileContent,
}

impl FileInput {
    /// Creates an input from text.
    #[must_use]
    pub fn text(path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            content: FileContent::Text(content.into()),
        }
    }

    /// Creates an input from raw bytes.
    #[must_use]
    pub fn bytes(path: impl Into<PathBuf>, content: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            content: FileContent::Bytes(content),
        }
    }
}

/// Supplies file content on demand.
pub trait ContentAccessor: Send + Sync {
    /// Loads the content of `path` (relative to the scan root).
    ///
    /// Read failures are reported as [`FileContent::Unreadable`], never as
    /// errors, so that the file can be excluded with a reason.
    fn load(&self, path: &Path) -> FileContent;

    /// Loads every path into a [`FileInput`].
    fn load_all(&self, paths: &[PathBuf]) -> Vec<FileInput> {
        paths
            .iter()
            .map(|p| FileInput {
                path: p.clone(),
                content: self.load(p),
            })
            .collect()
    }
}

/// Reads content from the filesystem under a root directory.
#[derive(Debug, Clone)]
pub struct FsAccessor {
    root: PathBuf,
}

impl FsAccessor {
    /// Creates an accessor rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ContentAccessor for FsAccessor {
    fn load(&self, path: &Path) -> FileContent {
        match std::fs::read(self.root.join(path)) {
            Ok(bytes) => FileContent::Bytes(bytes),
            Err(e) => FileContent::Unreadable(e.to_string()),
        }
    }
}

/// Maps byte offsets to 1-indexed line and column numbers.
#[derive(Debug, Clone)]
pub struct LineIndex {
    starts: Vec<usize>,
    len: usize,
}

impl LineIndex {
    /// Builds the index for `content`.
    #[must_use]
    pub fn new(content: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(
            content
                .bytes()
                .enumerate()
                .filter(|(_, b)| *b == b'\n')
                .map(|(i, _)| i + 1),
        );
        Self {
            starts,
            len: content.len(),
        }
    }

    /// Returns `(line, column)` for a byte offset, both 1-indexed.
    #[must_use]
    pub fn line_col(&self, offset: usize) -> (usize, usize) {
        let offset = offset.min(self.len);
        let line = self.starts.partition_point(|&s| s <= offset);
        let start = self.starts[line - 1];
        (line, offset - start + 1)
    }

    /// Returns the byte offset where the 1-indexed `line` starts.
    #[must_use]
    pub fn line_start(&self, line: usize) -> usize {
        self.starts
            .get(line.saturating_sub(1))
            .copied()
            .unwrap_or(self.len)
    }

    /// Returns the byte offset where the 1-indexed `line` ends (before `\n`).
    #[must_use]
    pub fn line_end(&self, line: usize) -> usize {
        self.starts
            .get(line)
            .map_or(self.len, |next| next.saturating_sub(1))
    }

    /// Returns the number of lines.
    #[must_use]
    pub fn line_count(&self) -> usize {
        self.starts.len()
    }
}
