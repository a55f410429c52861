use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("taxid {0} not found in the taxonomy")]
    TaxidNotFound(u32),

    #[error("null bytes at line {line} of {}", path.display())]
    NullBytes { path: PathBuf, line: usize },

    #[error("malformed line {line} of {}: {reason}", path.display())]
    MalformedLine {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("no usable member in archive {}", .0.display())]
    EmptyArchive(PathBuf),

    #[error("taxonomy is not a tree: {0}")]
    MalformedTree(String),

    #[error("cache serialization failed: {0}")]
    Cache(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
