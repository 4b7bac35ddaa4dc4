//! Primitive file operations with typed errors.
//!
//! These operate on the host view of the workspace; callers translate
//! sandbox-visible paths first (`Sandbox::resolve_for_io`). The workspace
//! is a bind mount in docker mode, so both views name the same files.

use crate::error::SandboxError;
use crate::sandbox::Sandbox;
use std::path::Path;

/// Metadata subset exposed to tools.
#[derive(Debug, Clone)]
pub struct FileStat {
    pub size: u64,
    pub is_file: bool,
    pub is_dir: bool,
    pub modified: Option<chrono::DateTime<chrono::Utc>>,
}

/// One directory listing row.
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

impl Sandbox {
    pub async fn read_file(&self, path: &Path) -> Result<Vec<u8>, SandboxError> {
        tokio::fs::read(path)
            .await
            .map_err(|error| SandboxError::from_io(path.display().to_string(), error))
    }

    /// Create or overwrite, creating parent directories as needed.
    pub async fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<(), SandboxError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|error| SandboxError::from_io(parent.display().to_string(), error))?;
        }
        tokio::fs::write(path, bytes)
            .await
            .map_err(|error| SandboxError::from_io(path.display().to_string(), error))
    }

    /// Replace `old` with `new`. With `expect_unique`, `old` must occur
    /// exactly once; zero or multiple occurrences fail without writing.
    pub async fn edit_file(
        &self,
        path: &Path,
        old: &str,
        new: &str,
        expect_unique: bool,
    ) -> Result<(), SandboxError> {
        let bytes = self.read_file(path).await?;
        let content = String::from_utf8_lossy(&bytes).into_owned();

        let occurrences = content.matches(old).count();
        if occurrences == 0 {
            return Err(SandboxError::NotFound(format!(
                "no occurrence of the given text in {}",
                path.display()
            )));
        }
        if expect_unique && occurrences > 1 {
            return Err(SandboxError::Io {
                path: path.display().to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("expected exactly one occurrence, found {occurrences}"),
                ),
            });
        }

        let replaced = if expect_unique {
            content.replacen(old, new, 1)
        } else {
            content.replace(old, new)
        };
        self.write_file(path, replaced.as_bytes()).await
    }

    pub async fn path_exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    pub async fn stat_file(&self, path: &Path) -> Result<FileStat, SandboxError> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|error| SandboxError::from_io(path.display().to_string(), error))?;
        let modified = metadata
            .modified()
            .ok()
            .map(chrono::DateTime::<chrono::Utc>::from);
        Ok(FileStat {
            size: metadata.len(),
            is_file: metadata.is_file(),
            is_dir: metadata.is_dir(),
            modified,
        })
    }

    pub async fn list_dir(&self, path: &Path) -> Result<Vec<DirEntryInfo>, SandboxError> {
        let mut reader = tokio::fs::read_dir(path)
            .await
            .map_err(|error| SandboxError::from_io(path.display().to_string(), error))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|error| SandboxError::from_io(path.display().to_string(), error))?
        {
            let metadata = entry
                .metadata()
                .await
                .map_err(|error| SandboxError::from_io(path.display().to_string(), error))?;
            entries.push(DirEntryInfo {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: metadata.is_dir(),
                size: metadata.len(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}
