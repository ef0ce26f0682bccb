//! File-based blocklist loader.
//!
//! Loads blocklist files from the local filesystem. Used for `file` feeds and
//! for user imports.

use std::io::BufReader;
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::AsyncReadExt;

use super::{Entry, ParseError, parser_for_format};
use crate::config::BlocklistFormat;

/// Error type for blocklist file loading operations.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// File was not found at the specified path.
    #[error("file not found: {0:?}")]
    NotFound(PathBuf),

    /// Permission denied when accessing the file.
    #[error("permission denied: {0:?}")]
    PermissionDenied(PathBuf),

    /// I/O error while reading the file.
    #[error("I/O error reading {path:?}")]
    Io {
        /// Path to the file that caused the error.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Error parsing the blocklist content.
    #[error("parse error")]
    Parse(#[from] ParseError),

    /// Task join error from spawning a blocking task.
    #[error("task join error")]
    Join(#[from] tokio::task::JoinError),
}

/// Parse blocklist content off the async runtime.
///
/// Feeds can hold hundreds of thousands of lines, so parsing runs on the
/// blocking pool.
pub(crate) async fn parse_blocking(
    content: String,
    format: BlocklistFormat,
) -> Result<Result<Vec<Entry>, ParseError>, tokio::task::JoinError> {
    tokio::task::spawn_blocking(move || {
        let parser = parser_for_format(format);
        let mut reader = BufReader::new(content.as_bytes());
        parser.parse(&mut reader)
    })
    .await
}

/// Loads blocklists from local files.
pub struct FileLoader;

impl FileLoader {
    /// Load a blocklist from a local file.
    ///
    /// # Errors
    ///
    /// Returns a [`LoadError`] if:
    /// - The file does not exist ([`LoadError::NotFound`])
    /// - Permission is denied ([`LoadError::PermissionDenied`])
    /// - An I/O error occurs ([`LoadError::Io`])
    /// - The file content cannot be parsed ([`LoadError::Parse`])
    ///
    /// # Example
    ///
    /// ```no_run
    /// use std::path::Path;
    /// use defensiq::blocklist::loader::FileLoader;
    /// use defensiq::config::BlocklistFormat;
    ///
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let entries = FileLoader::load(Path::new("lists/malware.txt"), BlocklistFormat::Domains).await?;
    /// println!("Loaded {} entries", entries.len());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn load(path: &Path, format: BlocklistFormat) -> Result<Vec<Entry>, LoadError> {
        let path_buf = path.to_path_buf();

        let mut file = File::open(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => LoadError::NotFound(path_buf.clone()),
            std::io::ErrorKind::PermissionDenied => LoadError::PermissionDenied(path_buf.clone()),
            _ => LoadError::Io {
                path: path_buf.clone(),
                source: e,
            },
        })?;

        let mut content = String::new();
        file.read_to_string(&mut content)
            .await
            .map_err(|e| LoadError::Io {
                path: path_buf.clone(),
                source: e,
            })?;

        let entries = parse_blocking(content, format).await??;
        Ok(entries)
    }
}
